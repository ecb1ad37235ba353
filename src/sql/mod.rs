//! Statement analysis: classification, structural validation and the
//! DELETE → SELECT dry-run rewrite. Everything here is pure.

pub mod classify;
pub mod dry_run;
pub mod scan;
pub mod validate;

pub use classify::{classify, OperationKind};
pub use dry_run::{delete_to_select, DryRunError};
pub use validate::{validate, ValidationError};

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// One-line rendering of a statement for logs and notifications.
/// Not for execution: whitespace inside literals is collapsed too.
pub fn summarize(sql: &str, max_chars: usize) -> String {
    let flat = WHITESPACE.replace_all(sql.trim(), " ");
    if flat.chars().count() <= max_chars {
        return flat.into_owned();
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_flattens_and_truncates() {
        assert_eq!(summarize("DELETE\n  FROM t\tWHERE x", 100), "DELETE FROM t WHERE x");
        assert_eq!(summarize("SELECT 123456", 6), "SELECT…");
    }
}

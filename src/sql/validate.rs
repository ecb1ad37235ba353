//! Structural safety checks run before a statement gets anywhere near a
//! live connection.
//!
//! These checks are cheap and advisory. They reject obviously malformed
//! input with a specific reason; they are not an injection defense.

use thiserror::Error;

use super::classify::OperationKind;
use super::scan::{scan, Scan, Token};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("statement is empty")]
    Empty,

    #[error("unbalanced parentheses")]
    UnbalancedParentheses,

    #[error("unterminated {0} literal")]
    UnterminatedLiteral(&'static str),

    #[error("unterminated block comment")]
    UnterminatedComment,

    #[error("transaction control statements are managed by sqlgate")]
    TransactionControl,

    #[error("{kind} statement must contain {expected}")]
    MissingClause {
        kind: OperationKind,
        expected: &'static str,
    },

    #[error("{kind} statement must name a target table")]
    MissingTarget { kind: OperationKind },

    #[error("only a single statement may be submitted")]
    MultipleStatements,
}

/// Validate `sql` against the structure expected for `kind`.
///
/// Checks run in a fixed order and the first failure wins: emptiness,
/// parenthesis balance, literal and comment termination, transaction
/// control, per-kind clauses, then the single-statement rule.
pub fn validate(sql: &str, kind: OperationKind) -> Result<(), ValidationError> {
    if sql.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    let scanned = scan(sql);
    if scanned.tokens.iter().all(|t| t.is_punct(';')) {
        return Err(ValidationError::Empty);
    }

    match scanned.paren_balance() {
        Some(0) => {}
        _ => return Err(ValidationError::UnbalancedParentheses),
    }

    if let Some(quote) = scanned.unterminated {
        return Err(ValidationError::UnterminatedLiteral(match quote {
            '\'' => "string",
            '$' => "dollar-quoted string",
            _ => "quoted identifier",
        }));
    }
    if scanned.unterminated_comment {
        return Err(ValidationError::UnterminatedComment);
    }

    if is_transaction_control(&scanned) {
        return Err(ValidationError::TransactionControl);
    }

    check_structure(&scanned, kind)?;

    if has_trailing_statement(&scanned) {
        return Err(ValidationError::MultipleStatements);
    }

    Ok(())
}

fn check_structure(scanned: &Scan<'_>, kind: OperationKind) -> Result<(), ValidationError> {
    match kind {
        OperationKind::Insert => {
            if !["VALUES", "SELECT", "SET"]
                .iter()
                .any(|kw| scanned.contains_keyword(kw))
            {
                return Err(ValidationError::MissingClause {
                    kind,
                    expected: "VALUES, SELECT or SET",
                });
            }
        }
        OperationKind::Update => {
            // GRANT/REVOKE and unrecognised statements also classify as update;
            // the SET requirement only applies to an actual UPDATE.
            if leading_keyword(scanned, "UPDATE") && !scanned.contains_keyword("SET") {
                return Err(ValidationError::MissingClause {
                    kind,
                    expected: "SET",
                });
            }
        }
        OperationKind::Delete => {
            if !has_delete_target(scanned) {
                return Err(ValidationError::MissingClause {
                    kind,
                    expected: "FROM or a table name",
                });
            }
        }
        OperationKind::CreateTable | OperationKind::DropTable => {
            if !names_target(&scanned.tokens) {
                return Err(ValidationError::MissingTarget { kind });
            }
        }
        OperationKind::Select | OperationKind::AlterTable => {}
    }
    Ok(())
}

/// Statements run inside transactions this service opens and ends itself.
fn is_transaction_control(scanned: &Scan<'_>) -> bool {
    const CONTROL: &[&str] = &[
        "BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE",
    ];
    let Some(first) = scanned.tokens.first() else {
        return false;
    };
    CONTROL.iter().any(|kw| first.is_keyword(kw))
        || (first.is_keyword("PREPARE")
            && scanned.tokens.get(1).map_or(false, |t| t.is_keyword("TRANSACTION")))
}

fn leading_keyword(scanned: &Scan<'_>, keyword: &str) -> bool {
    scanned
        .tokens
        .first()
        .map(|t| t.is_keyword(keyword))
        .unwrap_or(false)
}

/// `DELETE FROM t`, the bare `DELETE t ...` form, or `TRUNCATE [TABLE] t`.
/// Data-modifying CTEs only need a FROM somewhere.
fn has_delete_target(scanned: &Scan<'_>) -> bool {
    let tokens = &scanned.tokens;
    let Some(first) = tokens.first() else {
        return false;
    };
    if first.is_keyword("TRUNCATE") {
        return tokens
            .iter()
            .skip(1)
            .find(|t| !(t.is_keyword("TABLE") || t.is_keyword("ONLY")))
            .map(|t| t.is_identifier())
            .unwrap_or(false);
    }
    if scanned.contains_keyword("FROM") {
        return true;
    }
    first.is_keyword("DELETE")
        && tokens
            .get(1)
            .map(|t| t.is_identifier() && !t.is_keyword("WHERE"))
            .unwrap_or(false)
}

/// CREATE/DROP must be followed by an object name, after any modifiers and
/// an optional `IF [NOT] EXISTS`.
fn names_target(tokens: &[Token<'_>]) -> bool {
    const MODIFIERS: &[&str] = &[
        "TABLE",
        "TEMP",
        "TEMPORARY",
        "UNLOGGED",
        "GLOBAL",
        "LOCAL",
        "OR",
        "REPLACE",
        "MATERIALIZED",
        "VIEW",
        "SCHEMA",
        "SEQUENCE",
        "INDEX",
        "UNIQUE",
        "CONCURRENTLY",
        "FOREIGN",
        "TYPE",
        "FUNCTION",
        "DATABASE",
        "IF",
        "NOT",
        "EXISTS",
    ];

    for t in tokens.iter().skip(1) {
        if t.is_identifier() && MODIFIERS.iter().any(|m| t.is_keyword(m)) {
            continue;
        }
        return t.is_identifier();
    }
    false
}

/// Anything other than `;` after the first top-level `;` is a second statement.
fn has_trailing_statement(scanned: &Scan<'_>) -> bool {
    let mut depth = 0i32;
    let mut terminated = false;
    for t in &scanned.tokens {
        if terminated && !t.is_punct(';') {
            return true;
        }
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        } else if depth == 0 && t.is_punct(';') {
            terminated = true;
        }
    }
    false
}

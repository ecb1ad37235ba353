//! Operation classification from a statement's leading keyword.
//!
//! Classification never fails. Anything unrecognised is treated as a
//! mutation so that it lands in the approval queue rather than running
//! straight away.

use serde::{Deserialize, Serialize};

use super::scan::{scan, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    AlterTable,
}

impl OperationKind {
    pub const ALL: [OperationKind; 7] = [
        OperationKind::Select,
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::CreateTable,
        OperationKind::DropTable,
        OperationKind::AlterTable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateTable => "create_table",
            Self::DropTable => "drop_table",
            Self::AlterTable => "alter_table",
        }
    }

    /// Only selects run without review.
    pub fn is_read_only(self) -> bool {
        self == Self::Select
    }

    pub fn requires_approval(self) -> bool {
        !self.is_read_only()
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a statement. Total: every input yields exactly one kind.
pub fn classify(sql: &str) -> OperationKind {
    let scanned = scan(sql);
    // Statements wrapped in parentheses, e.g. `(SELECT 1) UNION (SELECT 2)`.
    let words: Vec<&Token<'_>> = scanned
        .tokens
        .iter()
        .skip_while(|t| t.is_punct('('))
        .collect();
    classify_tokens(&words)
}

fn classify_tokens(tokens: &[&Token<'_>]) -> OperationKind {
    let Some(first) = tokens.first() else {
        return OperationKind::Update;
    };
    if first.kind != TokenKind::Word {
        return OperationKind::Update;
    }

    match first.text.to_ascii_uppercase().as_str() {
        "SELECT" => {
            if selects_into_table(tokens) {
                OperationKind::CreateTable
            } else {
                OperationKind::Select
            }
        }
        "SHOW" | "VALUES" | "TABLE" | "DESCRIBE" | "DESC" => OperationKind::Select,
        "WITH" => classify_with(tokens),
        "EXPLAIN" => classify_explain(&tokens[1..]),
        "INSERT" | "REPLACE" | "UPSERT" => OperationKind::Insert,
        "UPDATE" | "MERGE" => OperationKind::Update,
        "DELETE" | "TRUNCATE" => OperationKind::Delete,
        "CREATE" => {
            if tokens.iter().skip(1).take(3).any(|t| t.is_keyword("INDEX")) {
                OperationKind::AlterTable
            } else {
                OperationKind::CreateTable
            }
        }
        "DROP" => OperationKind::DropTable,
        "ALTER" | "RENAME" | "COMMENT" => OperationKind::AlterTable,
        // GRANT, REVOKE and everything unknown.
        _ => OperationKind::Update,
    }
}

/// `SELECT ... INTO new_table` creates a table, unlike PL/pgSQL's
/// `SELECT INTO variable` which never reaches us as a bare statement.
fn selects_into_table(tokens: &[&Token<'_>]) -> bool {
    let mut depth = 0i32;
    for t in tokens {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        } else if depth == 0 && t.is_keyword("INTO") {
            return true;
        }
    }
    false
}

fn classify_with(tokens: &[&Token<'_>]) -> OperationKind {
    // A data-modifying CTE anywhere makes the whole statement a mutation.
    for t in tokens {
        if t.is_keyword("INSERT") {
            return OperationKind::Insert;
        }
        if t.is_keyword("UPDATE") {
            return OperationKind::Update;
        }
        if t.is_keyword("DELETE") {
            return OperationKind::Delete;
        }
    }
    OperationKind::Select
}

fn classify_explain(rest: &[&Token<'_>]) -> OperationKind {
    let mut analyze = false;
    let mut i = 0;

    // Options either as bare keywords or a parenthesised list.
    while i < rest.len() {
        let t = rest[i];
        if t.is_punct('(') {
            while i < rest.len() && !rest[i].is_punct(')') {
                if rest[i].is_keyword("ANALYZE") || rest[i].is_keyword("ANALYSE") {
                    analyze = true;
                }
                i += 1;
            }
            i += 1;
            continue;
        }
        if t.is_keyword("ANALYZE") || t.is_keyword("ANALYSE") {
            analyze = true;
            i += 1;
            continue;
        }
        if t.is_keyword("VERBOSE") {
            i += 1;
            continue;
        }
        break;
    }

    if !analyze {
        return OperationKind::Select;
    }
    classify_tokens(&rest[i.min(rest.len())..])
}

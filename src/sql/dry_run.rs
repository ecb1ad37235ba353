//! DELETE → SELECT rewriting for impact previews.
//!
//! The rewritten statement matches exactly the rows the DELETE would remove,
//! so running it read-only shows what a delete will affect without opening
//! a write transaction.

use thiserror::Error;

use super::scan::{scan, strip_comments, Scan, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DryRunError {
    #[error("dry run only supports DELETE or TRUNCATE statements")]
    NotADelete,

    #[error("could not find the target table")]
    MissingTable,

    #[error("unsupported delete form: {0}")]
    Unsupported(&'static str),
}

/// Words that end a table reference instead of aliasing it.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "USING", "RETURNING", "ORDER", "LIMIT", "FROM", "JOIN", "INNER", "LEFT", "RIGHT",
    "FULL", "CROSS", "NATURAL", "ON", "AS",
];

/// Rewrite a DELETE (or TRUNCATE) as the SELECT that matches the same rows.
pub fn delete_to_select(sql: &str) -> Result<String, DryRunError> {
    let text = strip_comments(sql);
    let scanned = scan(&text);
    Rewriter {
        text: &text,
        scanned: &scanned,
    }
    .rewrite()
}

struct Rewriter<'a> {
    text: &'a str,
    scanned: &'a Scan<'a>,
}

impl Rewriter<'_> {
    fn rewrite(&self) -> Result<String, DryRunError> {
        let first = self.scanned.tokens.first().ok_or(DryRunError::NotADelete)?;
        if first.is_keyword("TRUNCATE") {
            return self.rewrite_truncate();
        }
        if first.is_keyword("WITH") {
            return self.rewrite_with();
        }
        if !first.is_keyword("DELETE") {
            return Err(DryRunError::NotADelete);
        }
        self.rewrite_delete(0)
    }

    /// `WITH ... DELETE ...` keeps the CTE list in front of the rewritten
    /// delete. CTEs that modify data cannot run read-only.
    fn rewrite_with(&self) -> Result<String, DryRunError> {
        let delete = self
            .scanned
            .find_top_level(1, "DELETE")
            .ok_or(DryRunError::Unsupported("WITH without a top-level DELETE"))?;
        let modifies = self.scanned.tokens[..delete].iter().any(|t| {
            ["INSERT", "UPDATE", "DELETE", "MERGE"]
                .iter()
                .any(|k| t.is_keyword(k))
        });
        if modifies {
            return Err(DryRunError::Unsupported("data-modifying WITH"));
        }
        let select = self.rewrite_delete(delete)?;
        Ok(format!("{} {select}", self.span(0, delete)))
    }

    /// The DELETE starting at token `start`.
    fn rewrite_delete(&self, start: usize) -> Result<String, DryRunError> {
        if self.top_level_current_of() {
            return Err(DryRunError::Unsupported("WHERE CURRENT OF"));
        }

        let mut i = start + 1;
        while self.keyword_at(i, &["LOW_PRIORITY", "QUICK", "IGNORE"]) {
            i += 1;
        }

        if self.keyword_at(i, &["FROM"]) {
            let (table, next) = self.table_ref(i + 1)?;
            return self.rewrite_single(table, next);
        }

        // Bare `DELETE t ...`, or MySQL's `DELETE t FROM t JOIN ...`.
        let (target, next) = self.table_ref(i)?;
        if self.punct_at(next, ',') {
            return Err(DryRunError::Unsupported("multiple delete targets"));
        }
        if self.keyword_at(next, &["FROM"]) {
            let rest = self.remainder(next + 1);
            if rest.is_empty() {
                return Err(DryRunError::MissingTable);
            }
            return Ok(format!("SELECT {target}.* FROM {rest}"));
        }
        self.rewrite_single(target, next)
    }

    fn rewrite_truncate(&self) -> Result<String, DryRunError> {
        let mut i = 1;
        if self.keyword_at(i, &["TABLE"]) {
            i += 1;
        }
        let (table, next) = self.table_ref(i)?;
        if self.punct_at(next, ',') {
            return Err(DryRunError::Unsupported("TRUNCATE of multiple tables"));
        }
        Ok(format!("SELECT * FROM {table}"))
    }

    /// `<table> [[AS] alias] [USING list] [WHERE cond] [RETURNING ...]`
    fn rewrite_single(&self, table: &str, mut next: usize) -> Result<String, DryRunError> {
        let alias_start = next;
        if self.keyword_at(next, &["AS"]) {
            next += 2;
        } else if self.is_alias(next) {
            next += 1;
        }
        let alias = self.span(alias_start, next);
        let head = if alias.is_empty() {
            format!("SELECT * FROM {table}")
        } else {
            format!("SELECT * FROM {table} {alias}")
        };

        if self.keyword_at(next, &["USING"]) {
            let where_idx = self.scanned.find_top_level(next + 1, "WHERE");
            let using_end = where_idx.unwrap_or_else(|| self.end_index());
            let using = self.span(next + 1, using_end);
            if using.is_empty() {
                return Err(DryRunError::Unsupported("empty USING list"));
            }
            let condition = where_idx.map(|w| self.remainder(w + 1)).unwrap_or("");
            return Ok(if condition.is_empty() {
                format!("{head} WHERE EXISTS (SELECT 1 FROM {using})")
            } else {
                format!("{head} WHERE EXISTS (SELECT 1 FROM {using} WHERE {condition})")
            });
        }

        let rest = self.remainder(next);
        Ok(if rest.is_empty() {
            head
        } else {
            format!("{head} {rest}")
        })
    }

    /// A possibly schema-qualified name starting at token `i`, with an
    /// optional leading `ONLY`. Returns the verbatim text and the next index.
    fn table_ref(&self, i: usize) -> Result<(&str, usize), DryRunError> {
        let tokens = &self.scanned.tokens;
        let start = i;
        let mut i = i;
        if self.keyword_at(i, &["ONLY"]) {
            i += 1;
        }
        let name_ok = |idx: usize| {
            tokens.get(idx).map_or(false, |t| {
                t.kind == TokenKind::QuotedIdent
                    || (t.kind == TokenKind::Word
                        && !CLAUSE_KEYWORDS.iter().any(|k| t.is_keyword(k)))
            })
        };
        if !name_ok(i) {
            return Err(DryRunError::MissingTable);
        }
        i += 1;
        while self.punct_at(i, '.') && name_ok(i + 1) {
            i += 2;
        }
        Ok((self.span(start, i), i))
    }

    fn is_alias(&self, i: usize) -> bool {
        self.scanned.tokens.get(i).map_or(false, |t| {
            t.kind == TokenKind::QuotedIdent
                || (t.kind == TokenKind::Word && !CLAUSE_KEYWORDS.iter().any(|k| t.is_keyword(k)))
        }) && i < self.end_index()
    }

    fn top_level_current_of(&self) -> bool {
        self.scanned
            .find_top_level(0, "WHERE")
            .map_or(false, |w| self.keyword_at(w + 1, &["CURRENT"]) && self.keyword_at(w + 2, &["OF"]))
    }

    /// Token index where the statement ends: a top-level `;` or `RETURNING`.
    fn end_index(&self) -> usize {
        let len = self.scanned.tokens.len();
        let mut depth = 0i32;
        for (i, t) in self.scanned.tokens.iter().enumerate() {
            if t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(')') {
                depth -= 1;
            } else if depth == 0 && (t.is_punct(';') || t.is_keyword("RETURNING")) {
                return i;
            }
        }
        len
    }

    /// Verbatim text from token `from` to the end of the statement.
    fn remainder(&self, from: usize) -> &str {
        self.span(from, self.end_index())
    }

    /// Verbatim, trimmed text covering tokens `[from, to)`.
    fn span(&self, from: usize, to: usize) -> &str {
        let tokens = &self.scanned.tokens;
        if from >= to || from >= tokens.len() {
            return "";
        }
        let start = tokens[from].start;
        let end = tokens[to.min(tokens.len()) - 1].end;
        self.text[start..end].trim()
    }

    fn keyword_at(&self, i: usize, keywords: &[&str]) -> bool {
        self.scanned
            .tokens
            .get(i)
            .map_or(false, |t| keywords.iter().any(|k| t.is_keyword(k)))
    }

    fn punct_at(&self, i: usize, c: char) -> bool {
        self.scanned.tokens.get(i).map_or(false, |t| t.is_punct(c))
    }
}

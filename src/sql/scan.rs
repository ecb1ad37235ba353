//! Lexical scanning shared by the classifier, validator and dry-run rewriter.
//!
//! This is deliberately not a parser. It splits statement text into words,
//! quoted identifiers, literals and punctuation while skipping comments, which
//! is enough to find keywords without being fooled by string contents.

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches a Postgres dollar-quote opener such as `$$` or `$body$`. Tags may
/// contain non-ASCII letters.
static DOLLAR_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$([A-Za-z_\x{80}-\x{10FFFF}][A-Za-z0-9_\x{80}-\x{10FFFF}]*)?\$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare word: keyword or unquoted identifier.
    Word,
    /// `"ident"`.
    QuotedIdent,
    /// `'text'`, `E'text'` or `$tag$text$tag$`.
    StringLit,
    Number,
    Punct,
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
}

impl Token<'_> {
    /// Case-insensitive keyword comparison; only bare words can be keywords.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.starts_with(c)
    }

    /// Word or quoted identifier: anything that can name a relation.
    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }
}

/// Result of scanning one statement.
#[derive(Debug)]
pub struct Scan<'a> {
    pub tokens: Vec<Token<'a>>,
    /// Byte ranges of skipped comments.
    pub comments: Vec<(usize, usize)>,
    /// Opening quote of a literal that never closed, if any.
    pub unterminated: Option<char>,
    /// A `/*` comment ran to the end of the input.
    pub unterminated_comment: bool,
}

impl<'a> Scan<'a> {
    /// Index of the first token matching `keyword` at parenthesis depth 0,
    /// searching from `from`.
    pub fn find_top_level(&self, from: usize, keyword: &str) -> Option<usize> {
        let mut depth = 0i32;
        for (i, tok) in self.tokens.iter().enumerate() {
            if tok.is_punct('(') {
                depth += 1;
            } else if tok.is_punct(')') {
                depth -= 1;
            } else if i >= from && depth == 0 && tok.is_keyword(keyword) {
                return Some(i);
            }
        }
        None
    }

    pub fn contains_keyword(&self, keyword: &str) -> bool {
        self.tokens.iter().any(|t| t.is_keyword(keyword))
    }

    /// Net parenthesis depth across the statement; zero when balanced.
    /// Returns `None` if a closing parenthesis ever appears without an opener.
    pub fn paren_balance(&self) -> Option<i32> {
        let mut depth = 0i32;
        for tok in &self.tokens {
            if tok.is_punct('(') {
                depth += 1;
            } else if tok.is_punct(')') {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
        }
        Some(depth)
    }
}

pub fn scan(sql: &str) -> Scan<'_> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut comments = Vec::new();
    let mut unterminated = None;
    let mut unterminated_comment = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        // Postgres also treats vertical tab as whitespace.
        if c.is_ascii_whitespace() || c == 0x0B {
            i += 1;
            continue;
        }

        // -- line comment, ended by either newline character as in Postgres
        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            let end = sql[i..]
                .find(|ch: char| ch == '\n' || ch == '\r')
                .map_or(bytes.len(), |n| i + n);
            comments.push((i, end));
            i = end;
            continue;
        }

        // /* block comment */, nesting allowed as in Postgres
        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let (end, closed) = skip_block_comment(bytes, i);
            unterminated_comment |= !closed;
            comments.push((i, end));
            i = end;
            continue;
        }

        if c == b'\'' {
            let backslash_escapes = tokens
                .last()
                .map(|t: &Token<'_>| {
                    t.end == i && t.kind == TokenKind::Word && t.text.eq_ignore_ascii_case("e")
                })
                .unwrap_or(false);
            let (end, closed) = skip_quoted(bytes, i, b'\'', backslash_escapes);
            if !closed {
                unterminated = Some('\'');
            }
            // An E prefix belongs to the literal.
            let start = if backslash_escapes {
                tokens.pop().map_or(i, |t| t.start)
            } else {
                i
            };
            tokens.push(token(sql, TokenKind::StringLit, start, end));
            i = end;
            continue;
        }

        if c == b'"' {
            let (end, closed) = skip_quoted(bytes, i, c, false);
            if !closed {
                unterminated = Some(c as char);
            }
            tokens.push(token(sql, TokenKind::QuotedIdent, i, end));
            i = end;
            continue;
        }

        if c == b'$' {
            if let Some(m) = DOLLAR_TAG.find(&sql[i..]) {
                let tag = m.as_str();
                let body_start = i + tag.len();
                let end = match sql[body_start..].find(tag) {
                    Some(n) => body_start + n + tag.len(),
                    None => {
                        unterminated = Some('$');
                        bytes.len()
                    }
                };
                tokens.push(token(sql, TokenKind::StringLit, i, end));
                i = end;
                continue;
            }
        }

        if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 {
            let end = take_while(bytes, i, |b| {
                b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
            });
            tokens.push(token(sql, TokenKind::Word, i, end));
            i = end;
            continue;
        }

        if c.is_ascii_digit() {
            let end = take_while(bytes, i, |b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_');
            tokens.push(token(sql, TokenKind::Number, i, end));
            i = end;
            continue;
        }

        // Punctuation is always a single ASCII byte; anything else was consumed above.
        tokens.push(token(sql, TokenKind::Punct, i, i + 1));
        i += 1;
    }

    Scan {
        tokens,
        comments,
        unterminated,
        unterminated_comment,
    }
}

/// Remove `--` and `/* */` comments, replacing each with a single space so
/// that neighbouring tokens stay separated. Literals are left untouched.
pub fn strip_comments(sql: &str) -> String {
    let scanned = scan(sql);
    if scanned.comments.is_empty() {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (start, end) in scanned.comments {
        out.push_str(&sql[cursor..start]);
        out.push(' ');
        cursor = end;
    }
    out.push_str(&sql[cursor..]);
    out
}

fn token(sql: &str, kind: TokenKind, start: usize, end: usize) -> Token<'_> {
    Token {
        kind,
        text: &sql[start..end],
        start,
        end,
    }
}

fn take_while(bytes: &[u8], start: usize, pred: impl Fn(u8) -> bool) -> usize {
    let mut i = start;
    while i < bytes.len() && pred(bytes[i]) {
        i += 1;
    }
    i
}

/// Returns the end offset of a quoted run and whether its closing quote was found.
/// A doubled quote inside the run is an escaped quote.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> (usize, bool) {
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return (i + 1, true);
        }
        i += 1;
    }
    (bytes.len(), false)
}

/// Returns the end offset of a possibly nested comment and whether it closed.
fn skip_block_comment(bytes: &[u8], start: usize) -> (usize, bool) {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return (i, true);
            }
        } else {
            i += 1;
        }
    }
    (bytes.len(), false)
}

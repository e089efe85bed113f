//! SQL inspection helpers
//!
//! Pure functions invoked on every observed statement: literal
//! masking, statement-kind detection, best-effort table extraction,
//! and driver error classification. All single-pass over the input
//! and allocation-light.
//!
//! None of this parses SQL. Keyword matching can misfire inside
//! string literals, which is acceptable here: a wrong table guess
//! only weakens lock tracking, it never changes what the host
//! application executes.

use serde::{Deserialize, Serialize};

/// Statement category derived from the first meaningful keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Tcl,
    Other,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Tcl => "TCL",
            Self::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lock intent a statement expresses against its target tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    None,
    Shared,
    Exclusive,
}

/// Vendor-agnostic classification of a driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DbErrorKind {
    DeadlockSuspect,
    LockTimeout,
    Other,
}

impl DbErrorKind {
    /// Whether this error should trigger an on-demand cycle check.
    pub fn triggers_deadlock_check(&self) -> bool {
        matches!(self, Self::DeadlockSuspect | Self::LockTimeout)
    }
}

/// Replace string and numeric literals with `?`.
///
/// Quoted strings (`'...'`, with `''` escapes) and bare
/// integer/decimal tokens become `?`; identifiers, keywords, and
/// existing placeholders pass through. Idempotent, so re-masking an
/// already-fingerprinted statement is a no-op.
pub fn mask_sql(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(sql.len());
    let mut i = 0;
    let mut prev_word = false;

    while i < bytes.len() {
        let b = bytes[i];

        // Quoted string literal, with '' escaping.
        if b == b'\'' {
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'\'' {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            out.push(b'?');
            prev_word = false;
            continue;
        }

        // Bare numeric literal. A digit glued to an identifier (t1,
        // col2) is part of the identifier, not a literal.
        if b.is_ascii_digit() && !prev_word {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            out.push(b'?');
            prev_word = false;
            continue;
        }

        out.push(b);
        // Non-ASCII bytes belong to identifiers as far as masking is
        // concerned: a digit glued to them is not a literal.
        prev_word = b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80;
        i += 1;
    }

    // Only whole ASCII tokens were replaced, so the buffer is still
    // the input's (valid) encoding.
    match String::from_utf8(out) {
        Ok(masked) => masked,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Detect the statement kind from the first meaningful keyword,
/// skipping leading whitespace and `--` / `/* */` comments.
pub fn statement_kind(sql: &str) -> StatementKind {
    let keyword = match first_keyword(sql) {
        Some(word) => word,
        None => return StatementKind::Other,
    };

    match keyword.as_str() {
        "SELECT" | "WITH" => StatementKind::Select,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" | "DROP" | "ALTER" | "TRUNCATE" => StatementKind::Ddl,
        "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "SET" => {
            StatementKind::Tcl
        }
        _ => StatementKind::Other,
    }
}

/// Best-effort extraction of the tables a statement touches, plus the
/// lock intent it expresses.
///
/// Tables are collected after FROM / UPDATE / DELETE FROM /
/// INSERT INTO / JOIN and canonicalized to lowercase with quoting
/// stripped. `SELECT ... FOR UPDATE` is Exclusive, `FOR SHARE` /
/// `LOCK IN SHARE MODE` is Shared, mutations are Exclusive.
pub fn statement_targets(sql: &str) -> (std::collections::BTreeSet<String>, LockMode) {
    let kind = statement_kind(sql);
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect();

    let mut tables = std::collections::BTreeSet::new();
    let mut idx = 0;
    while idx < words.len() {
        let upper = words[idx].to_ascii_uppercase();
        let wants_table = match upper.as_str() {
            "FROM" | "JOIN" | "INTO" => true,
            "UPDATE" => kind == StatementKind::Update,
            _ => false,
        };
        if wants_table {
            if let Some(next) = words.get(idx + 1) {
                if let Some(table) = canonical_table(next) {
                    tables.insert(table);
                }
            }
        }
        idx += 1;
    }

    let locking = match kind {
        StatementKind::Update | StatementKind::Delete | StatementKind::Insert => {
            LockMode::Exclusive
        }
        StatementKind::Select => select_lock_hint(&words),
        _ => LockMode::None,
    };

    (tables, locking)
}

/// Classify a driver error against the vendor-agnostic mapping table.
pub fn classify_db_error(code: Option<i64>, sqlstate: Option<&str>, message: &str) -> DbErrorKind {
    if matches!(code, Some(1213) | Some(40001)) {
        return DbErrorKind::DeadlockSuspect;
    }
    if matches!(code, Some(1205)) {
        return DbErrorKind::LockTimeout;
    }
    if matches!(sqlstate, Some("40001") | Some("40P01")) {
        return DbErrorKind::DeadlockSuspect;
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("lock wait timeout") {
        DbErrorKind::LockTimeout
    } else if lowered.contains("deadlock") {
        DbErrorKind::DeadlockSuspect
    } else {
        DbErrorKind::Other
    }
}

fn first_keyword(sql: &str) -> Option<String> {
    let bytes = sql.as_bytes();
    let mut i = 0;

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'-' && bytes[i + 1] == b'-' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            continue;
        }
        break;
    }

    let start = i;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    if i == start {
        return None;
    }
    Some(sql[start..i].to_ascii_uppercase())
}

fn canonical_table(word: &str) -> Option<String> {
    let trimmed = word.trim_matches(|c| matches!(c, '`' | '"' | '[' | ']' | '\''));
    if trimmed.is_empty() {
        return None;
    }
    let first = trimmed.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    // SELECT ... FROM (subquery) starts with a keyword, not a table.
    let upper = trimmed.to_ascii_uppercase();
    if matches!(upper.as_str(), "SELECT" | "VALUES" | "DUAL" | "ONLY") {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

fn select_lock_hint(words: &[String]) -> LockMode {
    let mut i = 0;
    while i < words.len() {
        let upper = words[i].to_ascii_uppercase();
        if upper == "FOR" {
            match words.get(i + 1).map(|w| w.to_ascii_uppercase()).as_deref() {
                Some("UPDATE") => return LockMode::Exclusive,
                Some("SHARE") => return LockMode::Shared,
                _ => {}
            }
        }
        // MySQL legacy: LOCK IN SHARE MODE
        if upper == "LOCK"
            && words.get(i + 1).map(|w| w.to_ascii_uppercase()).as_deref() == Some("IN")
            && words.get(i + 2).map(|w| w.to_ascii_uppercase()).as_deref() == Some("SHARE")
        {
            return LockMode::Shared;
        }
        i += 1;
    }
    LockMode::None
}

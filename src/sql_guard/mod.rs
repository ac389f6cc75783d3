//! Read-only SQL safety gate.
//!
//! Every statement is checked before it leaves the connection manager. The
//! gate admits a precisely defined read-only subset and rejects everything
//! that would — or might — modify data, including DML smuggled through CTEs,
//! `EXPLAIN ANALYZE`, `SELECT INTO`, `CALL`, and anonymous `DO` blocks.
//!
//! The implementation is a conservative pre-parser over a quote-aware
//! tokenizer, not a SQL grammar. When a statement's shape cannot be
//! understood, it is rejected.

use crate::error::ServerError;

mod lexer;
#[cfg(test)]
mod tests;

use lexer::{skip_ws_and_comments, tokenize, Token, TokenKind};

/// Statement keywords that are rejected outright in read-only mode.
const BLOCKED_KEYWORDS: &[&str] = &[
    "CALL", "DO", "COPY", "TRUNCATE", "LOCK", "GRANT", "REVOKE", "PREPARE", "EXECUTE", "INSERT",
    "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "MERGE",
];

/// Data-modifying keywords that poison a CTE body.
const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

/// `EXPLAIN` option words that may precede the inner statement, in either the
/// parenthesised or the bare form.
const EXPLAIN_OPTION_WORDS: &[&str] = &[
    "ANALYZE", "VERBOSE", "COSTS", "SETTINGS", "BUFFERS", "WAL", "TIMING", "SUMMARY", "FORMAT",
    "TEXT", "JSON", "XML", "YAML", "TRUE", "FALSE", "ON", "OFF",
];

const WITH_REJECT_MSG: &str =
    "WITH statements only allowed with read-only CTEs and a final SELECT, TABLE, or VALUES statement";

const EXPLAIN_ANALYZE_REJECT_MSG: &str =
    "EXPLAIN ANALYZE executes the statement; only SELECT, TABLE, VALUES, or read-only WITH queries are allowed";

fn reject(msg: impl Into<String>) -> ServerError {
    ServerError::Validation(msg.into())
}

/// Return the statement with leading whitespace and comments removed.
/// A fixed point: applying it twice equals applying it once.
pub fn strip_leading_comments(sql: &str) -> &str {
    &sql[skip_ws_and_comments(sql, 0)..]
}

/// The first unquoted word of the statement, uppercased.
pub fn first_keyword(sql: &str) -> Option<String> {
    let tokens = tokenize(sql);
    tokens
        .first()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.upper.clone())
}

/// True iff the statement is a `WITH` whose CTE bodies contain a
/// data-modifying keyword. Unparseable `WITH` shapes count as containing DML.
pub fn cte_contains_dml(sql: &str) -> bool {
    let tokens = tokenize(sql);
    if !tokens.first().is_some_and(|t| t.is_word("WITH")) {
        return false;
    }
    match analyze_with(&tokens) {
        Some(shape) => shape.has_dml,
        None => true,
    }
}

/// The final statement following the last top-level CTE of a `WITH` query,
/// or `None` when the input is not a `WITH` the pre-parser understands.
pub fn final_statement_after_ctes(sql: &str) -> Option<&str> {
    let tokens = tokenize(sql);
    if !tokens.first().is_some_and(|t| t.is_word("WITH")) {
        return None;
    }
    let shape = analyze_with(&tokens)?;
    let start = shape.final_start?;
    Some(&sql[tokens[start].offset..])
}

/// Whether the statement can be wrapped in `DECLARE ... CURSOR FOR`.
/// Cursors require a read-only-compatible top-level statement.
pub fn is_cursor_eligible(sql: &str) -> bool {
    let tokens = tokenize(sql);
    let tokens = without_trailing_semicolon(&tokens);
    let Some(first) = tokens.first() else {
        return false;
    };
    if first.kind != TokenKind::Word {
        return false;
    }
    match first.upper.as_str() {
        "SELECT" | "TABLE" | "VALUES" => true,
        "WITH" => match analyze_with(tokens) {
            Some(shape) if !shape.has_dml => shape
                .final_start
                .and_then(|i| tokens.get(i))
                .is_some_and(|t| {
                    t.kind == TokenKind::Word
                        && matches!(t.upper.as_str(), "SELECT" | "TABLE" | "VALUES")
                }),
            _ => false,
        },
        _ => false,
    }
}

/// Validate that a statement is read-only. Returns the reason for rejection;
/// an accepted statement never reaches the database with a DML keyword
/// outside strings, comments, dollar quotes, or quoted identifiers.
pub fn validate_read_only(sql: &str) -> Result<(), ServerError> {
    let tokens = tokenize(sql);
    if tokens.is_empty() {
        return Err(reject("Empty SQL statement"));
    }

    // Exactly one top-level statement. A trailing semicolon is allowed; a
    // semicolon followed by anything else is not.
    if let Some(pos) = tokens.iter().position(|t| t.is_punct(';')) {
        if pos + 1 != tokens.len() {
            return Err(reject("Multiple statements not allowed"));
        }
    }
    let tokens = without_trailing_semicolon(&tokens);
    let Some(first) = tokens.first() else {
        return Err(reject("Empty SQL statement"));
    };

    if first.kind != TokenKind::Word {
        return Err(reject(
            "Unable to determine statement type; only read-only statements are allowed",
        ));
    }

    match first.upper.as_str() {
        "SELECT" => check_no_top_level_into(&tokens[1..], first.depth),
        "SHOW" | "VALUES" | "TABLE" => Ok(()),
        "WITH" => validate_with(tokens),
        "EXPLAIN" => validate_explain(tokens),
        kw => Err(reject(format!(
            "Statement type not allowed in read-only mode: {kw}"
        ))),
    }
}

fn without_trailing_semicolon<'a>(tokens: &'a [Token]) -> &'a [Token] {
    match tokens.last() {
        Some(t) if t.is_punct(';') => &tokens[..tokens.len() - 1],
        _ => tokens,
    }
}

/// Reject `SELECT ... INTO ...` — `INTO` at the statement's own bracket depth
/// creates a table. `INTO` inside a subquery (deeper parens) is untouched.
fn check_no_top_level_into(tokens: &[Token], depth: u32) -> Result<(), ServerError> {
    if tokens
        .iter()
        .any(|t| t.depth == depth && t.is_word("INTO"))
    {
        return Err(reject("SELECT INTO is not allowed in read-only mode"));
    }
    Ok(())
}

struct WithShape {
    has_dml: bool,
    /// Token index where the final statement after the CTE list begins.
    final_start: Option<usize>,
}

/// Walk `WITH [RECURSIVE] name [(cols)] AS [[NOT] MATERIALIZED] (body)
/// [, ...]* final-statement`, collecting whether any body holds DML and where
/// the final statement starts. Returns `None` for shapes the walk does not
/// understand — callers treat that as unsafe.
fn analyze_with(tokens: &[Token]) -> Option<WithShape> {
    let mut i = 1; // past WITH
    if tokens.get(i)?.is_word("RECURSIVE") {
        i += 1;
    }

    let mut has_dml = false;
    loop {
        // CTE name (possibly a quoted identifier)
        let name = tokens.get(i)?;
        if name.kind != TokenKind::Word && name.kind != TokenKind::QuotedIdent {
            return None;
        }
        i += 1;

        // Optional column list
        if tokens.get(i)?.is_punct('(') {
            i = skip_group(tokens, i)?;
        }

        if !tokens.get(i)?.is_word("AS") {
            return None;
        }
        i += 1;

        // Optional [NOT] MATERIALIZED
        if tokens.get(i)?.is_word("NOT") {
            i += 1;
            if !tokens.get(i)?.is_word("MATERIALIZED") {
                return None;
            }
            i += 1;
        } else if tokens.get(i)?.is_word("MATERIALIZED") {
            i += 1;
        }

        if !tokens.get(i)?.is_punct('(') {
            return None;
        }
        let body_end = skip_group(tokens, i)?;
        if tokens[i + 1..body_end - 1]
            .iter()
            .any(|t| t.kind == TokenKind::Word && DML_KEYWORDS.contains(&t.upper.as_str()))
        {
            has_dml = true;
        }
        i = body_end;

        match tokens.get(i) {
            Some(t) if t.is_punct(',') => {
                i += 1;
                continue;
            }
            Some(_) => return Some(WithShape { has_dml, final_start: Some(i) }),
            None => return Some(WithShape { has_dml, final_start: None }),
        }
    }
}

/// `tokens[open]` must be a `(`. Returns the index just past its matching
/// `)`, or `None` when unbalanced.
fn skip_group(tokens: &[Token], open: usize) -> Option<usize> {
    let depth = tokens[open].depth;
    tokens[open + 1..]
        .iter()
        .position(|t| t.is_punct(')') && t.depth == depth)
        .map(|rel| open + 1 + rel + 1)
}

fn validate_with(tokens: &[Token]) -> Result<(), ServerError> {
    let shape = analyze_with(tokens).ok_or_else(|| reject(WITH_REJECT_MSG))?;
    if shape.has_dml {
        return Err(reject(WITH_REJECT_MSG));
    }
    let start = shape.final_start.ok_or_else(|| reject(WITH_REJECT_MSG))?;
    let final_token = &tokens[start];
    if final_token.kind != TokenKind::Word {
        return Err(reject(WITH_REJECT_MSG));
    }
    match final_token.upper.as_str() {
        "SELECT" => check_no_top_level_into(&tokens[start + 1..], final_token.depth),
        "TABLE" | "VALUES" => Ok(()),
        _ => Err(reject(WITH_REJECT_MSG)),
    }
}

fn validate_explain(tokens: &[Token]) -> Result<(), ServerError> {
    let mut i = 1; // past EXPLAIN
    let mut analyze = false;

    // Parenthesised option list: EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) ...
    if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
        let end = skip_group(tokens, i)
            .ok_or_else(|| reject("EXPLAIN has an unbalanced option list"))?;
        let options = &tokens[i + 1..end - 1];
        for (k, t) in options.iter().enumerate() {
            if t.is_word("ANALYZE") {
                let negated = options.get(k + 1).is_some_and(|n| {
                    n.kind == TokenKind::Word
                        && matches!(n.upper.as_str(), "FALSE" | "OFF" | "0")
                });
                if !negated {
                    analyze = true;
                }
            }
        }
        i = end;
    }

    // Bare options: EXPLAIN ANALYZE VERBOSE ...
    while let Some(t) = tokens.get(i) {
        if t.kind == TokenKind::Word && EXPLAIN_OPTION_WORDS.contains(&t.upper.as_str()) {
            if t.upper == "ANALYZE" {
                analyze = true;
            }
            i += 1;
        } else {
            break;
        }
    }

    let inner = tokens
        .get(i)
        .ok_or_else(|| reject("EXPLAIN requires a statement to explain"))?;
    if inner.kind != TokenKind::Word {
        return Err(reject("EXPLAIN requires a statement to explain"));
    }
    if BLOCKED_KEYWORDS.contains(&inner.upper.as_str()) {
        return Err(reject(format!(
            "Statement type not allowed in read-only mode: {}",
            inner.upper
        )));
    }
    if !analyze {
        return Ok(());
    }

    // EXPLAIN ANALYZE executes the inner statement, so the read-only subset
    // applies to it in full.
    match inner.upper.as_str() {
        "SELECT" => check_no_top_level_into(&tokens[i + 1..], inner.depth),
        "TABLE" | "VALUES" => Ok(()),
        "WITH" => {
            let rest = &tokens[i..];
            let shape =
                analyze_with(rest).ok_or_else(|| reject(EXPLAIN_ANALYZE_REJECT_MSG))?;
            if shape.has_dml {
                return Err(reject(EXPLAIN_ANALYZE_REJECT_MSG));
            }
            let start = shape.final_start.ok_or_else(|| reject(EXPLAIN_ANALYZE_REJECT_MSG))?;
            let final_token = &rest[start];
            match final_token.upper.as_str() {
                "SELECT" => check_no_top_level_into(&rest[start + 1..], final_token.depth),
                "TABLE" | "VALUES" => Ok(()),
                _ => Err(reject(EXPLAIN_ANALYZE_REJECT_MSG)),
            }
        }
        _ => Err(reject(EXPLAIN_ANALYZE_REJECT_MSG)),
    }
}

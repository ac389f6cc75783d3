use super::*;

fn ok(sql: &str) {
    if let Err(e) = validate_read_only(sql) {
        panic!("expected {sql:?} to be accepted, got: {e}");
    }
}

fn rejected(sql: &str) -> String {
    match validate_read_only(sql) {
        Ok(()) => panic!("expected {sql:?} to be rejected"),
        Err(e) => e.to_string(),
    }
}

// ── Allow-list ───────────────────────────────────────────────────────────────

#[test]
fn select_is_allowed() {
    ok("SELECT * FROM users");
    ok("select id, name from users where id = $1");
    ok("SELECT 1");
}

#[test]
fn show_values_table_are_allowed() {
    ok("SHOW server_version");
    ok("VALUES (1, 'a'), (2, 'b')");
    ok("TABLE users");
}

#[test]
fn trailing_semicolon_is_allowed() {
    ok("SELECT 1;");
    ok("SELECT 1 ; ");
    ok("SELECT 1; -- done");
}

#[test]
fn leading_comments_are_skipped() {
    ok("-- a comment\nSELECT 1");
    ok("/* block */ SELECT 1");
    ok("/* outer /* nested */ still comment */ SELECT 1");
    ok("  \n\t-- one\n-- two\nSELECT 1");
}

#[test]
fn keyword_matching_is_case_insensitive() {
    let msg = rejected("dElEtE FROM users");
    assert!(msg.contains("Statement type not allowed"), "{msg}");
}

// ── Block-list ───────────────────────────────────────────────────────────────

#[test]
fn every_blocked_keyword_is_rejected_with_its_name() {
    for kw in [
        "CALL", "DO", "COPY", "TRUNCATE", "LOCK", "GRANT", "REVOKE", "PREPARE", "EXECUTE",
        "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "MERGE",
    ] {
        let msg = rejected(&format!("{kw} something"));
        assert!(
            msg.contains("Statement type not allowed in read-only mode"),
            "keyword {kw}: {msg}"
        );
        assert!(msg.contains(kw), "keyword {kw} not named in: {msg}");
    }
}

#[test]
fn unknown_statement_types_are_rejected() {
    rejected("VACUUM users");
    rejected("SET search_path TO public");
    rejected("BEGIN");
    rejected("ANALYZE users");
}

#[test]
fn delete_statement_rejection_message() {
    let msg = rejected("DELETE FROM users");
    assert!(msg.contains("Statement type not allowed"), "{msg}");
}

// ── Multi-statement rule ─────────────────────────────────────────────────────

#[test]
fn multiple_statements_are_rejected() {
    let msg = rejected("SELECT 1; SELECT 2");
    assert_eq!(msg, "Multiple statements not allowed");
    rejected("SELECT 1;;");
    rejected("SELECT 1; DELETE FROM users");
    rejected("; SELECT 1");
}

#[test]
fn semicolon_inside_string_is_not_a_separator() {
    ok("SELECT 'a; b' FROM t");
    ok("SELECT $$x; y$$");
}

// ── Quoting and comments hide keywords ───────────────────────────────────────

#[test]
fn dml_inside_string_literal_is_ignored() {
    ok("SELECT 'DELETE FROM users'");
    ok("SELECT 'it''s an INSERT statement'");
}

#[test]
fn dml_inside_quoted_identifier_is_ignored() {
    ok("SELECT \"delete\" FROM t");
    ok("SELECT \"weird\"\"update\"\"name\" FROM t");
}

#[test]
fn dml_inside_dollar_quotes_is_ignored() {
    ok("SELECT $$DELETE FROM users$$");
    ok("SELECT $fn$UPDATE t SET x = 1$fn$");
}

#[test]
fn dml_inside_comments_is_ignored() {
    ok("SELECT 1 -- DELETE FROM users");
    ok("SELECT /* UPDATE t */ 1");
}

#[test]
fn dollar_parameters_are_not_dollar_quotes() {
    ok("SELECT * FROM t WHERE id = $1 AND name = $2");
}

#[test]
fn keyword_as_identifier_substring_is_not_matched() {
    // inserted_at / updater are plain identifiers, not INSERT/UPDATE tokens
    ok("SELECT inserted_at, updater FROM audit_log");
}

// ── SELECT INTO ──────────────────────────────────────────────────────────────

#[test]
fn select_into_is_rejected() {
    let msg = rejected("SELECT * INTO backup FROM users");
    assert!(msg.contains("SELECT INTO"), "{msg}");
    rejected("SELECT id INTO TEMP t2 FROM t1");
}

#[test]
fn into_below_top_bracket_depth_is_not_matched() {
    // The INTO check applies at the statement's own depth only; parenthesised
    // sub-expressions are Postgres's problem, not a table-creation risk here.
    ok("SELECT * FROM (SELECT 1 INTO x) t");
    ok("SELECT (SELECT 1) AS sub, 'into' FROM t");
}

#[test]
fn into_inside_string_is_allowed() {
    ok("SELECT 'INTO the void' FROM t");
}

// ── WITH / CTE handling ──────────────────────────────────────────────────────

#[test]
fn readonly_cte_is_allowed() {
    ok("WITH active AS (SELECT * FROM users WHERE active) SELECT * FROM active");
}

#[test]
fn recursive_cte_is_allowed() {
    ok("WITH RECURSIVE nums AS (SELECT 1 AS n UNION ALL SELECT n + 1 FROM nums WHERE n < 10) SELECT * FROM nums");
}

#[test]
fn multiple_ctes_are_allowed() {
    ok("WITH a AS (SELECT 1), b AS (SELECT 2) SELECT * FROM a, b");
}

#[test]
fn cte_with_column_list_is_allowed() {
    ok("WITH t(x, y) AS (SELECT 1, 2) SELECT x FROM t");
}

#[test]
fn materialized_cte_is_allowed() {
    ok("WITH a AS MATERIALIZED (SELECT 1) SELECT * FROM a");
    ok("WITH a AS NOT MATERIALIZED (SELECT 1) SELECT * FROM a");
}

#[test]
fn data_modifying_cte_is_rejected() {
    let msg = rejected("WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x");
    assert!(msg.contains("WITH statements only allowed"), "{msg}");
    rejected("WITH x AS (INSERT INTO t VALUES (1) RETURNING id) SELECT * FROM x");
    rejected("WITH x AS (UPDATE t SET a = 1 RETURNING *) SELECT * FROM x");
    rejected("WITH x AS (MERGE INTO t USING s ON t.id = s.id WHEN MATCHED THEN DO NOTHING) SELECT 1");
}

#[test]
fn dml_in_second_cte_is_rejected() {
    rejected("WITH a AS (SELECT 1), b AS (DELETE FROM t RETURNING *) SELECT * FROM a");
}

#[test]
fn dml_nested_deep_inside_cte_body_is_rejected() {
    rejected("WITH a AS (SELECT * FROM (SELECT 1) s WHERE EXISTS (SELECT 1 FROM x WHERE note = f(DELETE))) SELECT 1");
}

#[test]
fn dml_keyword_in_cte_string_is_allowed() {
    ok("WITH a AS (SELECT 'DELETE FROM t' AS cmd) SELECT * FROM a");
}

#[test]
fn with_final_statement_must_be_readonly() {
    rejected("WITH a AS (SELECT 1) INSERT INTO t SELECT * FROM a");
    rejected("WITH a AS (SELECT 1) UPDATE t SET x = 1");
    rejected("WITH a AS (SELECT 1) DELETE FROM t");
}

#[test]
fn with_final_table_and_values_are_allowed() {
    ok("WITH a AS (SELECT 1) TABLE a");
    ok("WITH a AS (SELECT 1) VALUES (1)");
}

#[test]
fn with_final_select_into_is_rejected() {
    rejected("WITH a AS (SELECT 1) SELECT * INTO b FROM a");
}

#[test]
fn with_subquery_parens_in_final_statement() {
    ok("WITH a AS (SELECT 1) SELECT * FROM a WHERE x IN (SELECT y FROM (SELECT 1 AS y) s)");
}

#[test]
fn malformed_with_is_rejected() {
    rejected("WITH a AS SELECT 1");
    rejected("WITH a (SELECT 1)");
    rejected("WITH a AS (SELECT 1");
}

// ── EXPLAIN ──────────────────────────────────────────────────────────────────

#[test]
fn explain_select_is_allowed() {
    ok("EXPLAIN SELECT * FROM users");
    ok("EXPLAIN VERBOSE SELECT 1");
}

#[test]
fn explain_with_option_list_is_allowed() {
    ok("EXPLAIN (COSTS, FORMAT JSON) SELECT 1");
    ok("EXPLAIN (ANALYZE, BUFFERS, TIMING) SELECT * FROM t");
    ok("EXPLAIN (FORMAT YAML) TABLE users");
}

#[test]
fn explain_analyze_select_is_allowed() {
    ok("EXPLAIN ANALYZE SELECT * FROM users");
    ok("EXPLAIN ANALYZE VERBOSE SELECT 1");
}

#[test]
fn explain_blocked_inner_statement_is_rejected() {
    let msg = rejected("EXPLAIN DELETE FROM users");
    assert!(msg.contains("Statement type not allowed"), "{msg}");
    rejected("EXPLAIN INSERT INTO t VALUES (1)");
    rejected("EXPLAIN (COSTS) UPDATE t SET x = 1");
}

#[test]
fn explain_analyze_rejects_non_select_inner() {
    let msg = rejected("EXPLAIN ANALYZE SHOW server_version");
    assert!(msg.contains("EXPLAIN ANALYZE"), "{msg}");
}

#[test]
fn explain_analyze_with_dml_cte_is_rejected() {
    rejected("EXPLAIN ANALYZE WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x");
    rejected("EXPLAIN (ANALYZE) WITH x AS (INSERT INTO t VALUES (1)) SELECT 1");
}

#[test]
fn explain_analyze_with_readonly_cte_is_allowed() {
    ok("EXPLAIN ANALYZE WITH a AS (SELECT 1) SELECT * FROM a");
}

#[test]
fn explain_analyze_select_into_is_rejected() {
    rejected("EXPLAIN ANALYZE SELECT * INTO b FROM a");
}

#[test]
fn explain_analyze_false_still_gates_blocked_keywords() {
    // ANALYZE disabled, but INSERT is on the block-list either way.
    rejected("EXPLAIN (ANALYZE FALSE) INSERT INTO t VALUES (1)");
}

#[test]
fn explain_analyze_false_is_not_treated_as_execution() {
    // Without execution, a plan of a non-blocked statement is harmless.
    ok("EXPLAIN (ANALYZE FALSE) SELECT 1");
    ok("EXPLAIN (ANALYZE OFF) WITH a AS (SELECT 1) SELECT * FROM a");
}

#[test]
fn explain_without_statement_is_rejected() {
    rejected("EXPLAIN");
    rejected("EXPLAIN (ANALYZE)");
}

// ── Helpers used by the connection manager ───────────────────────────────────

#[test]
fn first_keyword_basics() {
    assert_eq!(first_keyword("SELECT 1").as_deref(), Some("SELECT"));
    assert_eq!(first_keyword("  -- c\n select 1").as_deref(), Some("SELECT"));
    assert_eq!(first_keyword("/* c */ WITH a AS (SELECT 1) SELECT 1").as_deref(), Some("WITH"));
    assert_eq!(first_keyword(""), None);
    assert_eq!(first_keyword("-- only a comment"), None);
}

#[test]
fn strip_leading_comments_is_a_fixed_point() {
    let inputs = [
        "-- c\nSELECT 1",
        "/* a */ /* b */\n\tSELECT 1",
        "SELECT 1",
        "",
    ];
    for input in inputs {
        let once = strip_leading_comments(input);
        assert_eq!(strip_leading_comments(once), once, "input {input:?}");
    }
    assert_eq!(strip_leading_comments("-- c\nSELECT 1"), "SELECT 1");
}

#[test]
fn cte_contains_dml_basics() {
    assert!(cte_contains_dml("WITH x AS (DELETE FROM t) SELECT 1"));
    assert!(!cte_contains_dml("WITH x AS (SELECT 1) SELECT * FROM x"));
    assert!(!cte_contains_dml("SELECT 1"));
    assert!(!cte_contains_dml("WITH x AS (SELECT 'DELETE') SELECT 1"));
    // Unparseable WITH counts as unsafe.
    assert!(cte_contains_dml("WITH x AS SELECT 1"));
}

#[test]
fn final_statement_extraction() {
    assert_eq!(
        final_statement_after_ctes("WITH a AS (SELECT 1) SELECT * FROM a"),
        Some("SELECT * FROM a")
    );
    assert_eq!(
        final_statement_after_ctes("WITH a AS (SELECT 1), b AS (SELECT 2) TABLE b"),
        Some("TABLE b")
    );
    assert_eq!(final_statement_after_ctes("SELECT 1"), None);
    assert_eq!(final_statement_after_ctes("WITH a AS (SELECT 1)"), None);
}

#[test]
fn cursor_eligibility() {
    assert!(is_cursor_eligible("SELECT * FROM t"));
    assert!(is_cursor_eligible("TABLE users"));
    assert!(is_cursor_eligible("VALUES (1)"));
    assert!(is_cursor_eligible("WITH a AS (SELECT 1) SELECT * FROM a"));
    assert!(is_cursor_eligible("SELECT 1;"));

    assert!(!is_cursor_eligible("SHOW server_version"));
    assert!(!is_cursor_eligible("EXPLAIN SELECT 1"));
    assert!(!is_cursor_eligible("WITH x AS (DELETE FROM t) SELECT 1"));
    assert!(!is_cursor_eligible("WITH a AS (SELECT 1) INSERT INTO t SELECT 1"));
    assert!(!is_cursor_eligible("INSERT INTO t VALUES (1)"));
    assert!(!is_cursor_eligible(""));
}

// ── Acceptance implies no reachable DML (spot checks) ────────────────────────

#[test]
fn accepted_statements_never_expose_dml_tokens() {
    let accepted = [
        "SELECT 'UPDATE t SET x = 1'",
        "SELECT $$DROP TABLE users$$",
        "WITH a AS (SELECT 'TRUNCATE x') SELECT * FROM a",
        "SELECT \"grant\" FROM perms",
    ];
    for sql in accepted {
        ok(sql);
    }
}

#[test]
fn unterminated_string_is_not_a_bypass() {
    // The rest of the input is swallowed by the open literal; nothing
    // executable hides after it, and the statement stays a SELECT.
    ok("SELECT 'unterminated");
    // An unterminated string cannot hide a second statement.
    rejected("SELECT 1; DELETE FROM t WHERE note = 'oops");
}

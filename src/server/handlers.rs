//! The twelve tool handlers.
//!
//! Handlers parse arguments by hand, parameterise every user-supplied value
//! as `$1, $2, ...`, and catch every connection-manager error into an
//! obfuscated error outcome — exceptions never reach the transport.

use serde_json::{json, Map, Value};

use super::error::error_outcome;
use super::registry::{ToolOutcome, ToolRegistry};
use crate::db::{QueryParam, QueryResult};
use crate::error::ServerError;

/// Maximum SQL statement length (1 MB).
const MAX_SQL_LEN: usize = 1_000_000;

fn success(result: Value) -> ToolOutcome {
    ToolOutcome::Success { result }
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn rows_value(result: &QueryResult) -> Value {
    Value::Array(result.rows.iter().cloned().map(Value::Object).collect())
}

/// One row-returning catalog query, shaped as a plain JSON array.
async fn catalog_rows(
    registry: &ToolRegistry,
    sql: &str,
    params: &[QueryParam],
) -> Result<Value, ServerError> {
    let result = registry.manager.execute_query(sql, params).await?;
    Ok(rows_value(&result))
}

impl ToolRegistry {
    // ------------------------------------------------------------------
    // Tool handler: execute_query
    // ------------------------------------------------------------------
    pub(crate) async fn handle_execute_query(&self, args: &Map<String, Value>) -> ToolOutcome {
        let Some(sql) = arg_str(args, "sql").filter(|s| !s.is_empty()) else {
            return error_outcome("Missing required argument: sql");
        };
        if sql.len() > MAX_SQL_LEN {
            return error_outcome(format!(
                "SQL too large: {} bytes (max {} bytes / 1 MB)",
                sql.len(),
                MAX_SQL_LEN
            ));
        }
        let params = match args.get("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => match QueryParam::from_json_array(values) {
                Ok(params) => params,
                Err(e) => return error_outcome(e.to_string()),
            },
            Some(_) => return error_outcome("Argument 'params' must be an array"),
        };

        match self.manager.execute_query(sql, &params).await {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => success(value),
                Err(e) => error_outcome(format!("Failed to serialize result: {e}")),
            },
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: explain_query
    // ------------------------------------------------------------------
    pub(crate) async fn handle_explain_query(&self, args: &Map<String, Value>) -> ToolOutcome {
        let Some(sql) = arg_str(args, "sql").filter(|s| !s.is_empty()) else {
            return error_outcome("Missing required argument: sql");
        };
        if sql.len() > MAX_SQL_LEN {
            return error_outcome(format!(
                "SQL too large: {} bytes (max {} bytes / 1 MB)",
                sql.len(),
                MAX_SQL_LEN
            ));
        }
        let analyze = arg_bool(args, "analyze", false);
        let format = arg_str(args, "format").unwrap_or("text");
        if !matches!(format, "text" | "json" | "yaml" | "xml") {
            return error_outcome(format!(
                "Argument 'format' must be one of text, json, yaml, xml; got '{format}'"
            ));
        }

        let mut options: Vec<String> = Vec::new();
        if analyze {
            options.push("ANALYZE".to_string());
        }
        if format != "text" {
            options.push(format!("FORMAT {}", format.to_uppercase()));
        }
        let explain_sql = if options.is_empty() {
            format!("EXPLAIN {}", sql)
        } else {
            format!("EXPLAIN ({}) {}", options.join(", "), sql)
        };

        match self.manager.execute_query(&explain_sql, &[]).await {
            Ok(result) => success(Value::String(stringify_plan(&result.rows))),
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: list_schemas
    // ------------------------------------------------------------------
    pub(crate) async fn handle_list_schemas(&self, args: &Map<String, Value>) -> ToolOutcome {
        let include_system = arg_bool(args, "includeSystem", false);
        let sql = if include_system {
            "SELECT schema_name, schema_owner, \
                    CASE WHEN schema_name LIKE 'pg\\_%' OR schema_name = 'information_schema' \
                         THEN 'system' ELSE 'user' END AS schema_type \
             FROM information_schema.schemata \
             ORDER BY schema_name"
        } else {
            "SELECT schema_name, schema_owner, 'user' AS schema_type \
             FROM information_schema.schemata \
             WHERE schema_name NOT LIKE 'pg\\_%' AND schema_name <> 'information_schema' \
             ORDER BY schema_name"
        };
        match catalog_rows(self, sql, &[]).await {
            Ok(rows) => success(rows),
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: list_tables
    // ------------------------------------------------------------------
    pub(crate) async fn handle_list_tables(&self, args: &Map<String, Value>) -> ToolOutcome {
        let schema = arg_str(args, "schema").unwrap_or("public").to_string();
        let include_views = arg_bool(args, "includeViews", false);
        let sql = if include_views {
            "SELECT t.table_name, t.table_type, \
                    c.reltuples::bigint AS estimated_row_count, \
                    pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size \
             FROM information_schema.tables t \
             JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema \
             JOIN pg_catalog.pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid \
             WHERE t.table_schema = $1 AND t.table_type IN ('BASE TABLE', 'VIEW') \
             ORDER BY t.table_name"
        } else {
            "SELECT t.table_name, t.table_type, \
                    c.reltuples::bigint AS estimated_row_count, \
                    pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size \
             FROM information_schema.tables t \
             JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema \
             JOIN pg_catalog.pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid \
             WHERE t.table_schema = $1 AND t.table_type = 'BASE TABLE' \
             ORDER BY t.table_name"
        };
        match catalog_rows(self, sql, &[QueryParam::Text(schema)]).await {
            Ok(rows) => success(rows),
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: describe_table
    // ------------------------------------------------------------------
    pub(crate) async fn handle_describe_table(&self, args: &Map<String, Value>) -> ToolOutcome {
        let schema = arg_str(args, "schema").unwrap_or("public").to_string();
        let Some(table) = arg_str(args, "table").filter(|s| !s.is_empty()) else {
            return error_outcome("Missing required argument: table");
        };
        let table = table.to_string();
        let params = [
            QueryParam::Text(schema.clone()),
            QueryParam::Text(table.clone()),
        ];

        let columns_sql = "SELECT column_name, data_type, is_nullable, column_default, \
                                  character_maximum_length \
                           FROM information_schema.columns \
                           WHERE table_schema = $1 AND table_name = $2 \
                           ORDER BY ordinal_position";
        let constraints_sql = "SELECT tc.constraint_name, tc.constraint_type, kcu.column_name \
                               FROM information_schema.table_constraints tc \
                               LEFT JOIN information_schema.key_column_usage kcu \
                                 ON kcu.constraint_name = tc.constraint_name \
                                AND kcu.table_schema = tc.table_schema \
                                AND kcu.table_name = tc.table_name \
                               WHERE tc.table_schema = $1 AND tc.table_name = $2 \
                               ORDER BY tc.constraint_name, kcu.ordinal_position";
        let indexes_sql = "SELECT indexname, indexdef \
                           FROM pg_catalog.pg_indexes \
                           WHERE schemaname = $1 AND tablename = $2 \
                           ORDER BY indexname";

        let (columns, constraints, indexes) = tokio::join!(
            catalog_rows(self, columns_sql, &params),
            catalog_rows(self, constraints_sql, &params),
            catalog_rows(self, indexes_sql, &params),
        );

        let columns = match columns {
            Ok(rows) => rows,
            Err(e) => return error_outcome(e.to_string()),
        };
        let constraints = match constraints {
            Ok(rows) => merge_constraints(&rows),
            Err(e) => return error_outcome(e.to_string()),
        };
        let indexes = match indexes {
            Ok(rows) => rows,
            Err(e) => return error_outcome(e.to_string()),
        };

        success(json!({
            "table": { "schema": schema, "name": table },
            "columns": columns,
            "constraints": constraints,
            "indexes": indexes,
        }))
    }

    // ------------------------------------------------------------------
    // Tool handler: list_databases
    // ------------------------------------------------------------------
    pub(crate) async fn handle_list_databases(&self, _args: &Map<String, Value>) -> ToolOutcome {
        let sql = "SELECT d.datname AS name, \
                          pg_get_userbyid(d.datdba) AS owner, \
                          pg_encoding_to_char(d.encoding) AS encoding, \
                          d.datcollate AS collation, \
                          pg_size_pretty(pg_database_size(d.datname)) AS size \
                   FROM pg_catalog.pg_database d \
                   WHERE d.datistemplate = false \
                   ORDER BY d.datname";
        match catalog_rows(self, sql, &[]).await {
            Ok(rows) => success(rows),
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: get_connection_status
    // ------------------------------------------------------------------
    pub(crate) async fn handle_get_connection_status(
        &self,
        _args: &Map<String, Value>,
    ) -> ToolOutcome {
        match serde_json::to_value(self.manager.status().await) {
            Ok(value) => success(value),
            Err(e) => error_outcome(format!("Failed to serialize status: {e}")),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: get_database_version
    // ------------------------------------------------------------------
    pub(crate) async fn handle_get_database_version(
        &self,
        _args: &Map<String, Value>,
    ) -> ToolOutcome {
        match self.manager.execute_query("SELECT version()", &[]).await {
            Ok(result) => {
                let version = result
                    .rows
                    .first()
                    .and_then(|row| row.values().next())
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                success(Value::String(version))
            }
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: get_database_size
    // ------------------------------------------------------------------
    pub(crate) async fn handle_get_database_size(&self, args: &Map<String, Value>) -> ToolOutcome {
        let limit = args
            .get("limit")
            .and_then(|v| v.as_i64())
            .filter(|n| *n > 0)
            .unwrap_or(10);

        let database_sql = "SELECT current_database() AS name, \
                                   pg_size_pretty(pg_database_size(current_database())) AS size";
        let tables_sql = "SELECT n.nspname AS schema, c.relname AS table, \
                                 pg_size_pretty(pg_total_relation_size(c.oid)) AS total_size, \
                                 pg_total_relation_size(c.oid) AS size_bytes \
                          FROM pg_catalog.pg_class c \
                          JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                          WHERE c.relkind = 'r' \
                            AND n.nspname NOT LIKE 'pg\\_%' \
                            AND n.nspname <> 'information_schema' \
                          ORDER BY pg_total_relation_size(c.oid) DESC \
                          LIMIT $1";

        let database = match self.manager.execute_query(database_sql, &[]).await {
            Ok(result) => result
                .rows
                .first()
                .cloned()
                .map(Value::Object)
                .unwrap_or(Value::Null),
            Err(e) => return error_outcome(e.to_string()),
        };
        let largest = match catalog_rows(self, tables_sql, &[QueryParam::Int(limit)]).await {
            Ok(rows) => rows,
            Err(e) => return error_outcome(e.to_string()),
        };

        success(json!({
            "database": database,
            "largestTables": largest,
        }))
    }

    // ------------------------------------------------------------------
    // Tool handler: get_table_stats
    // ------------------------------------------------------------------
    pub(crate) async fn handle_get_table_stats(&self, args: &Map<String, Value>) -> ToolOutcome {
        let schema = arg_str(args, "schema").unwrap_or("public").to_string();
        let Some(table) = arg_str(args, "table").filter(|s| !s.is_empty()) else {
            return error_outcome("Missing required argument: table");
        };
        let sql = "SELECT schemaname, relname, seq_scan, seq_tup_read, idx_scan, \
                          idx_tup_fetch, n_tup_ins, n_tup_upd, n_tup_del, n_live_tup, \
                          n_dead_tup, last_vacuum, last_autovacuum, last_analyze, \
                          last_autoanalyze \
                   FROM pg_catalog.pg_stat_user_tables \
                   WHERE schemaname = $1 AND relname = $2";
        let params = [
            QueryParam::Text(schema.clone()),
            QueryParam::Text(table.to_string()),
        ];
        match self.manager.execute_query(sql, &params).await {
            Ok(result) => match result.rows.first() {
                Some(row) => success(Value::Object(row.clone())),
                None => success(json!({
                    "error": format!("No statistics found for table {schema}.{table}")
                })),
            },
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: list_active_connections
    // ------------------------------------------------------------------
    pub(crate) async fn handle_list_active_connections(
        &self,
        args: &Map<String, Value>,
    ) -> ToolOutcome {
        let include_idle = arg_bool(args, "includeIdle", false);
        let sql = if include_idle {
            "SELECT pid, usename, datname, client_addr::text AS client_addr, state, \
                    backend_start, query_start, wait_event_type, \
                    left(query, 200) AS query \
             FROM pg_catalog.pg_stat_activity \
             WHERE pid <> pg_backend_pid() AND backend_type = 'client backend' \
             ORDER BY backend_start"
        } else {
            "SELECT pid, usename, datname, client_addr::text AS client_addr, state, \
                    backend_start, query_start, wait_event_type, \
                    left(query, 200) AS query \
             FROM pg_catalog.pg_stat_activity \
             WHERE pid <> pg_backend_pid() AND backend_type = 'client backend' \
               AND state <> 'idle' \
             ORDER BY backend_start"
        };
        match catalog_rows(self, sql, &[]).await {
            Ok(rows) => success(rows),
            Err(e) => error_outcome(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Tool handler: list_long_running_queries
    // ------------------------------------------------------------------
    pub(crate) async fn handle_list_long_running_queries(
        &self,
        args: &Map<String, Value>,
    ) -> ToolOutcome {
        let min_duration = args
            .get("minDurationSeconds")
            .and_then(|v| v.as_f64())
            .filter(|n| *n >= 0.0)
            .unwrap_or(5.0);
        let sql = "SELECT pid, usename, datname, state, \
                          (now() - query_start)::text AS duration, \
                          left(query, 200) AS query \
                   FROM pg_catalog.pg_stat_activity \
                   WHERE state = 'active' AND pid <> pg_backend_pid() \
                     AND now() - query_start > make_interval(secs => $1) \
                   ORDER BY now() - query_start DESC";
        match catalog_rows(self, sql, &[QueryParam::Float(min_duration)]).await {
            Ok(rows) => success(rows),
            Err(e) => error_outcome(e.to_string()),
        }
    }
}

/// Join plan rows into one string: TEXT plans are one line per row, the
/// structured formats arrive as a single JSON/text value.
fn stringify_plan(rows: &[Map<String, Value>]) -> String {
    let mut lines = Vec::new();
    for row in rows {
        let Some(value) = row.values().next() else {
            continue;
        };
        match value {
            Value::String(s) => lines.push(s.clone()),
            other => lines.push(serde_json::to_string_pretty(other).unwrap_or_default()),
        }
    }
    lines.join("\n")
}

/// Fold `(constraint_name, constraint_type, column_name)` rows into one
/// object per constraint with a column-name array, preserving row order.
fn merge_constraints(rows: &Value) -> Value {
    let mut order: Vec<String> = Vec::new();
    let mut merged: std::collections::HashMap<String, (String, Vec<Value>)> =
        std::collections::HashMap::new();

    if let Value::Array(rows) = rows {
        for row in rows {
            let Some(name) = row.get("constraint_name").and_then(|v| v.as_str()) else {
                continue;
            };
            let ctype = row
                .get("constraint_type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let entry = merged.entry(name.to_string()).or_insert_with(|| {
                order.push(name.to_string());
                (ctype, Vec::new())
            });
            if let Some(column) = row.get("column_name").filter(|v| !v.is_null()) {
                entry.1.push(column.clone());
            }
        }
    }

    Value::Array(
        order
            .into_iter()
            .map(|name| {
                let (ctype, columns) = merged.remove(&name).unwrap_or_default();
                json!({ "name": name, "type": ctype, "columns": columns })
            })
            .collect(),
    )
}

//! Tool declarations and dispatch.
//!
//! The registry is transport-neutral: the stdio protocol server and the HTTP
//! transport both list and invoke tools through it. Tool order here is the
//! order every `tools/list` response uses.

use crate::db::ConnectionManager;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::tool_schemas::*;

/// What one tool invocation produced. Success carries the value placed in
/// `structuredContent.result`; errors carry obfuscated text only.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success { result: Value },
    Error { message: String },
}

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: fn() -> Arc<Map<String, Value>>,
}

/// Declaration order is the protocol's advertised order.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "execute_query",
            description: concat!(
                "Execute a SQL query against PostgreSQL. Returns rows, rowCount, and a ",
                "truncated flag (true when the result was capped at the configured MAX_ROWS). ",
                "User values must be passed via params ($1, $2, ...), never interpolated. ",
                "In read-only mode only SELECT, SHOW, VALUES, TABLE, EXPLAIN, and ",
                "read-only WITH queries are accepted.",
            ),
            input_schema: execute_query_schema,
        },
        ToolSpec {
            name: "explain_query",
            description: concat!(
                "Get the execution plan for a query. Set analyze:true to actually run it ",
                "(read-only statements only); format selects text, json, yaml, or xml output.",
            ),
            input_schema: explain_query_schema,
        },
        ToolSpec {
            name: "list_schemas",
            description: "List database schemas with owner and type. System schemas (pg_*, information_schema) are hidden unless includeSystem:true.",
            input_schema: list_schemas_schema,
        },
        ToolSpec {
            name: "list_tables",
            description: "List tables in a schema (default: public) with estimated row counts and total on-disk size. Set includeViews:true to include views.",
            input_schema: list_tables_schema,
        },
        ToolSpec {
            name: "describe_table",
            description: "Describe a table: columns with types and defaults, constraints merged by name with their column lists, and indexes.",
            input_schema: describe_table_schema,
        },
        ToolSpec {
            name: "list_databases",
            description: "List databases on the server with owner, encoding, collation, and size.",
            input_schema: no_args_schema,
        },
        ToolSpec {
            name: "get_connection_status",
            description: "Get connection state: pool counters, in-flight query counts, read-only flag, and SSH tunnel status when tunneling.",
            input_schema: no_args_schema,
        },
        ToolSpec {
            name: "get_database_version",
            description: "Get the PostgreSQL server version string.",
            input_schema: no_args_schema,
        },
        ToolSpec {
            name: "get_database_size",
            description: "Get the current database's size and its largest tables (default limit 10).",
            input_schema: get_database_size_schema,
        },
        ToolSpec {
            name: "get_table_stats",
            description: "Get planner/autovacuum statistics for one table from pg_stat_user_tables.",
            input_schema: get_table_stats_schema,
        },
        ToolSpec {
            name: "list_active_connections",
            description: "List active server connections from pg_stat_activity. Idle sessions are hidden unless includeIdle:true.",
            input_schema: list_active_connections_schema,
        },
        ToolSpec {
            name: "list_long_running_queries",
            description: "List queries running longer than minDurationSeconds (default 5).",
            input_schema: list_long_running_queries_schema,
        },
    ]
}

pub struct ToolRegistry {
    pub(crate) manager: Arc<ConnectionManager>,
}

impl ToolRegistry {
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }

    /// Dispatch an invocation. `None` means the tool does not exist; the
    /// transport turns that into its method-not-found error.
    pub async fn call(&self, name: &str, args: &Map<String, Value>) -> Option<ToolOutcome> {
        let outcome = match name {
            "execute_query" => self.handle_execute_query(args).await,
            "explain_query" => self.handle_explain_query(args).await,
            "list_schemas" => self.handle_list_schemas(args).await,
            "list_tables" => self.handle_list_tables(args).await,
            "describe_table" => self.handle_describe_table(args).await,
            "list_databases" => self.handle_list_databases(args).await,
            "get_connection_status" => self.handle_get_connection_status(args).await,
            "get_database_version" => self.handle_get_database_version(args).await,
            "get_database_size" => self.handle_get_database_size(args).await,
            "get_table_stats" => self.handle_get_table_stats(args).await,
            "list_active_connections" => self.handle_list_active_connections(args).await,
            "list_long_running_queries" => self.handle_list_long_running_queries(args).await,
            _ => return None,
        };
        Some(outcome)
    }
}

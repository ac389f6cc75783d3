use serde_json::{json, Map, Value};
use std::sync::Arc;

// ============================================================
// Tool input schemas
// Each function builds and returns the JSON schema for its tool.
// ============================================================

fn object(value: Value) -> Arc<Map<String, Value>> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => unreachable!("tool schemas are object literals"),
    }
}

pub(crate) fn execute_query_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "sql": {
                "type": "string",
                "description": "The SQL statement to execute. Exactly one statement; a trailing semicolon is allowed."
            },
            "params": {
                "type": "array",
                "items": { "type": ["string", "number", "boolean", "null"] },
                "description": "Positional parameters bound as $1, $2, ... Strings, numbers, booleans, and null only."
            }
        },
        "required": ["sql"]
    }))
}

pub(crate) fn explain_query_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "sql": {
                "type": "string",
                "description": "The statement to explain."
            },
            "analyze": {
                "type": "boolean",
                "description": "Execute the statement and report actual times (default: false). Only read-only statements may be analyzed.",
                "default": false
            },
            "format": {
                "type": "string",
                "enum": ["text", "json", "yaml", "xml"],
                "description": "Plan output format (default: text).",
                "default": "text"
            }
        },
        "required": ["sql"]
    }))
}

pub(crate) fn list_schemas_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "includeSystem": {
                "type": "boolean",
                "description": "Include pg_* and information_schema (default: false).",
                "default": false
            }
        },
        "required": []
    }))
}

pub(crate) fn list_tables_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "schema": {
                "type": "string",
                "description": "Schema to list (default: public).",
                "default": "public"
            },
            "includeViews": {
                "type": "boolean",
                "description": "Also list views (default: false).",
                "default": false
            }
        },
        "required": []
    }))
}

pub(crate) fn describe_table_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "schema": {
                "type": "string",
                "description": "Schema containing the table (default: public).",
                "default": "public"
            },
            "table": {
                "type": "string",
                "description": "Table name."
            }
        },
        "required": ["table"]
    }))
}

pub(crate) fn no_args_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {},
        "required": []
    }))
}

pub(crate) fn get_database_size_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "limit": {
                "type": "integer",
                "description": "How many of the largest tables to return (default: 10).",
                "default": 10,
                "minimum": 1
            }
        },
        "required": []
    }))
}

pub(crate) fn get_table_stats_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "schema": {
                "type": "string",
                "description": "Schema containing the table (default: public).",
                "default": "public"
            },
            "table": {
                "type": "string",
                "description": "Table name."
            }
        },
        "required": ["table"]
    }))
}

pub(crate) fn list_active_connections_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "includeIdle": {
                "type": "boolean",
                "description": "Include idle sessions (default: false).",
                "default": false
            }
        },
        "required": []
    }))
}

pub(crate) fn list_long_running_queries_schema() -> Arc<Map<String, Value>> {
    object(json!({
        "type": "object",
        "properties": {
            "minDurationSeconds": {
                "type": "number",
                "description": "Minimum runtime in seconds (default: 5).",
                "default": 5
            }
        },
        "required": []
    }))
}

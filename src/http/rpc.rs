//! JSON-RPC dispatch for the HTTP transport.
//!
//! The protocol library drives the stdio transport; over HTTP each request
//! (stateless) or session (stateful) gets its own [`RpcServer`] — a small
//! protocol-server object whose client state can be scrubbed and reused,
//! since the library exposes no reset API.

use crate::server::{registry, ToolOutcome, ToolRegistry, SERVER_NAME};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Semaphore;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revisions this server can speak, newest first.
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

// JSON-RPC error codes used on this transport.
pub const CODE_PROTOCOL: i64 = -32000;
pub const CODE_AUTH: i64 = -32001;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL: i64 = -32603;
pub const CODE_PARSE_ERROR: i64 = -32700;

pub fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "error": { "code": code, "message": message.into() },
        "id": id,
    })
}

pub fn rpc_result(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "result": result,
        "id": id,
    })
}

pub fn is_initialize_request(request: &Value) -> bool {
    request.get("method").and_then(|m| m.as_str()) == Some("initialize")
}

/// One protocol-server instance. Client state accumulates across requests in
/// stateful mode and is scrubbed between requests in stateless mode.
pub struct RpcServer {
    registry: Arc<ToolRegistry>,
    initialized: bool,
    protocol_version: Option<String>,
    client_info: Option<Value>,
    client_capabilities: Option<Value>,
    logging_level: Option<String>,
}

impl RpcServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            initialized: false,
            protocol_version: None,
            client_info: None,
            client_capabilities: None,
            logging_level: None,
        }
    }

    /// Scrub everything learned from a client. The instance behaves as if
    /// freshly constructed.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.protocol_version = None;
        self.client_info = None;
        self.client_capabilities = None;
        self.logging_level = None;
    }

    /// Handle one JSON-RPC message. `None` means no response body is due
    /// (the message was a notification).
    pub async fn handle(&mut self, request: Value) -> Option<Value> {
        let id = request.get("id").cloned();
        let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
            return Some(rpc_error(
                id.unwrap_or(Value::Null),
                CODE_INVALID_REQUEST,
                "Request has no method",
            ));
        };
        let method = method.to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        // A message without an id is a notification: process side effects,
        // never respond.
        let Some(id) = id else {
            if method == "notifications/initialized" {
                self.initialized = true;
            }
            return None;
        };

        let response = match method.as_str() {
            "initialize" => self.handle_initialize(&params),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.handle_tools_list()),
            "tools/call" => self.handle_tools_call(&params).await,
            "logging/setLevel" => {
                self.logging_level = params
                    .get("level")
                    .and_then(|l| l.as_str())
                    .map(str::to_string);
                Ok(json!({}))
            }
            _ => Err((CODE_METHOD_NOT_FOUND, format!("Method not found: {method}"))),
        };

        Some(match response {
            Ok(result) => rpc_result(id, result),
            Err((code, message)) => rpc_error(id, code, message),
        })
    }

    fn handle_initialize(&mut self, params: &Value) -> Result<Value, (i64, String)> {
        let requested = params
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);
        let negotiated = if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
            requested
        } else {
            SUPPORTED_PROTOCOL_VERSIONS[0]
        };

        self.protocol_version = Some(negotiated.to_string());
        self.client_info = params.get("clientInfo").cloned();
        self.client_capabilities = params.get("capabilities").cloned();
        self.initialized = true;

        Ok(json!({
            "protocolVersion": negotiated,
            "capabilities": {
                "tools": { "listChanged": true }
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "title": "PostgreSQL SSH MCP Server",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": "Use execute_query to run SQL against the connected PostgreSQL database.",
        }))
    }

    fn handle_tools_list(&self) -> Value {
        let tools: Vec<Value> = registry::tool_specs()
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "inputSchema": Value::Object((*(spec.input_schema)()).clone()),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: &Value) -> Result<Value, (i64, String)> {
        let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
            return Err((CODE_INVALID_PARAMS, "tools/call requires a tool name".to_string()));
        };
        let arguments: Map<String, Value> = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err((
                    CODE_INVALID_PARAMS,
                    "tools/call arguments must be an object".to_string(),
                ))
            }
        };

        match self.registry.call(name, &arguments).await {
            None => Err((CODE_METHOD_NOT_FOUND, format!("Unknown tool: {name}"))),
            Some(ToolOutcome::Success { result }) => {
                let text = serde_json::to_string_pretty(&result)
                    .map_err(|e| (CODE_INTERNAL, format!("Failed to serialize result: {e}")))?;
                Ok(json!({
                    "content": [{ "type": "text", "text": text }],
                    "structuredContent": { "result": result },
                }))
            }
            Some(ToolOutcome::Error { message }) => Ok(json!({
                "content": [{ "type": "text", "text": message }],
                "isError": true,
            })),
        }
    }
}

/// Fixed-size pool of protocol servers for stateless mode. Waiters queue
/// FIFO on the semaphore; released servers are scrubbed before reuse so no
/// client state outlives a single request.
pub struct ServerPool {
    semaphore: Arc<Semaphore>,
    servers: StdMutex<Vec<RpcServer>>,
}

impl ServerPool {
    pub fn new(registry: Arc<ToolRegistry>, size: usize) -> Arc<Self> {
        let servers = (0..size).map(|_| RpcServer::new(registry.clone())).collect();
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            servers: StdMutex::new(servers),
        })
    }

    pub async fn run(&self, request: Value) -> Option<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("stateless pool semaphore closed");
        let mut server = self
            .servers
            .lock()
            .unwrap()
            .pop()
            .expect("permit held but no server available");
        let response = server.handle(request).await;
        server.reset();
        self.servers.lock().unwrap().push(server);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::ConnectionManager;

    fn test_registry() -> Arc<ToolRegistry> {
        ToolRegistry::new(ConnectionManager::new(Arc::new(Config::default())))
    }

    fn initialize_request(id: i64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "t", "version": "0" }
            }
        })
    }

    #[tokio::test]
    async fn initialize_reports_server_name() {
        let mut server = RpcServer::new(test_registry());
        let response = server.handle(initialize_request(1)).await.unwrap();
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["serverInfo"]["name"], "postgresql-ssh-mcp");
        assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], true);
    }

    #[tokio::test]
    async fn unknown_protocol_version_negotiates_latest() {
        let mut server = RpcServer::new(test_registry());
        let request = json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": { "protocolVersion": "1999-01-01" }
        });
        let response = server.handle(request).await.unwrap();
        assert_eq!(response["result"]["protocolVersion"], "2025-06-18");
    }

    #[tokio::test]
    async fn tools_list_is_complete_and_ordered() {
        let mut server = RpcServer::new(test_registry());
        server.handle(initialize_request(1)).await;
        let response = server
            .handle(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await
            .unwrap();
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "execute_query",
            "explain_query",
            "list_schemas",
            "list_tables",
            "describe_table",
            "list_databases",
            "get_connection_status",
            "get_database_version",
            "get_database_size",
            "get_table_stats",
            "list_active_connections",
            "list_long_running_queries",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
        assert_eq!(names[0], "execute_query");
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let mut server = RpcServer::new(test_registry());
        let response = server
            .handle(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(response.is_none());
        assert!(server.initialized);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let mut server = RpcServer::new(test_registry());
        let response = server
            .handle(json!({"jsonrpc": "2.0", "id": 5, "method": "no/such"}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], CODE_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let mut server = RpcServer::new(test_registry());
        let response = server
            .handle(json!({
                "jsonrpc": "2.0", "id": 6, "method": "tools/call",
                "params": { "name": "bogus_tool", "arguments": {} }
            }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], CODE_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_error_becomes_is_error_result() {
        // No database is connected, so the pool error surfaces as a tool
        // error envelope, not a JSON-RPC error.
        let mut server = RpcServer::new(test_registry());
        let response = server
            .handle(json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": { "name": "execute_query", "arguments": { "sql": "SELECT 1" } }
            }))
            .await
            .unwrap();
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Connection not initialized"), "{text}");
    }

    #[tokio::test]
    async fn reset_scrubs_client_state() {
        let mut server = RpcServer::new(test_registry());
        server.handle(initialize_request(1)).await;
        assert!(server.initialized);
        assert!(server.client_info.is_some());
        server.reset();
        assert!(!server.initialized);
        assert!(server.client_info.is_none());
        assert!(server.protocol_version.is_none());
        assert!(server.client_capabilities.is_none());
        assert!(server.logging_level.is_none());
    }

    #[tokio::test]
    async fn server_pool_reuses_and_scrubs() {
        let pool = ServerPool::new(test_registry(), 2);
        for i in 0..5 {
            let response = pool.run(initialize_request(i)).await.unwrap();
            assert_eq!(response["id"], i);
        }
        // After the burst every pooled server is scrubbed.
        let servers = pool.servers.lock().unwrap();
        assert_eq!(servers.len(), 2);
        for server in servers.iter() {
            assert!(!server.initialized);
        }
    }

    #[tokio::test]
    async fn request_without_method_is_invalid() {
        let mut server = RpcServer::new(test_registry());
        let response = server.handle(json!({"jsonrpc": "2.0", "id": 9})).await.unwrap();
        assert_eq!(response["error"]["code"], CODE_INVALID_REQUEST);
    }
}

use anyhow::Result;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, ErrorCode, Implementation,
        ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
        Tool, ToolsCapability,
    },
    service::RequestContext,
    transport::stdio,
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::ConnectionManager;
use crate::obfuscate::obfuscate;

pub mod error;
pub mod handlers;
pub mod registry;
pub mod tool_schemas;

pub use registry::{ToolOutcome, ToolRegistry};

pub const SERVER_NAME: &str = "postgresql-ssh-mcp";

/// Delay between background initialization attempts on the stdio transport.
const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

impl ToolOutcome {
    /// Map the outcome onto the protocol shape: success carries both a text
    /// block and `structuredContent.result`; errors carry obfuscated text.
    pub fn into_call_tool_result(self) -> CallToolResult {
        match self {
            ToolOutcome::Success { result } => {
                let text = serde_json::to_string_pretty(&result)
                    .unwrap_or_else(|_| result.to_string());
                let mut response = CallToolResult::success(vec![Content::text(text)]);
                response.structured_content = Some(serde_json::json!({ "result": result }));
                response
            }
            ToolOutcome::Error { message } => {
                CallToolResult::error(vec![Content::text(message)])
            }
        }
    }
}

pub struct McpServer {
    registry: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                title: Some("PostgreSQL SSH MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use execute_query to run SQL against the connected PostgreSQL database. \
                 Schema inspection tools (list_schemas, list_tables, describe_table) and \
                 admin introspection tools are also available."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = registry::tool_specs()
            .into_iter()
            .map(|spec| Tool::new(spec.name, spec.description, (spec.input_schema)()))
            .collect();
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request.arguments.unwrap_or_default();
        match self.registry.call(request.name.as_ref(), &args).await {
            Some(outcome) => Ok(outcome.into_call_tool_result()),
            None => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}

/// Initialize the connection manager in the background, retrying every 5 s.
///
/// The protocol listener stays alive before the database is reachable; with
/// trust-on-first-use the known_hosts file may be freshly written between
/// attempts, so each retry closes the manager and starts from scratch.
pub fn spawn_init_retry(manager: Arc<ConnectionManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match manager.initialize().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(
                        "initialization failed: {}; retrying in {}s",
                        obfuscate(&e.to_string()),
                        INIT_RETRY_INTERVAL.as_secs()
                    );
                    manager.close().await;
                    tokio::time::sleep(INIT_RETRY_INTERVAL).await;
                }
            }
        }
    })
}

/// Stdio entry point: speak the protocol on stdin/stdout until the client
/// disconnects or a signal arrives.
pub async fn run_stdio(config: Arc<Config>) -> Result<()> {
    let manager = ConnectionManager::new(config);
    let registry = ToolRegistry::new(manager.clone());
    let init_task = spawn_init_retry(manager.clone());

    let server = McpServer::new(registry);
    tracing::info!("MCP server starting on stdio");
    let service = server.serve(stdio()).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = service.waiting() => {
            result?;
            tracing::info!("stdio transport closed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
        }
    }

    init_task.abort();
    manager.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_outcome_carries_structured_content() {
        let outcome = ToolOutcome::Success {
            result: json!({"rows": [], "rowCount": 0}),
        };
        let result = outcome.into_call_tool_result();
        assert_ne!(result.is_error, Some(true));
        let structured = result.structured_content.expect("structured content");
        assert_eq!(structured["result"]["rowCount"], 0);
    }

    #[test]
    fn error_outcome_is_text_only() {
        let outcome = ToolOutcome::Error {
            message: "Statement type not allowed in read-only mode: DELETE".to_string(),
        };
        let result = outcome.into_call_tool_result();
        assert_eq!(result.is_error, Some(true));
        assert!(result.structured_content.is_none());
    }

    #[test]
    fn server_info_advertises_tool_listing() {
        let manager = ConnectionManager::new(Arc::new(Config::default()));
        let server = McpServer::new(ToolRegistry::new(manager));
        let info = server.get_info();
        assert_eq!(info.server_info.name, SERVER_NAME);
        let tools = info.capabilities.tools.expect("tools capability");
        assert_eq!(tools.list_changed, Some(true));
    }
}

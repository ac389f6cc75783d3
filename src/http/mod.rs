//! Streamable HTTP transport.
//!
//! `POST /mcp` carries protocol requests in both modes. Stateless mode
//! serves each request from a scrubbed pooled protocol server and stores
//! nothing; stateful mode keys sessions on `mcp-session-id` and additionally
//! supports `GET /mcp` (SSE) and `DELETE /mcp`. CORS runs first, then the
//! origin/host guards, then bearer auth (oauth mode) on `/mcp` only.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::{AuthMode, Config};
use crate::db::ConnectionManager;
use crate::obfuscate::obfuscate;
use crate::server::{spawn_init_retry, ToolRegistry};

pub mod auth;
pub mod rpc;
pub mod session;

use auth::{Auth0JwksVerifier, TokenVerifier};
use rpc::{rpc_error, ServerPool, CODE_PARSE_ERROR, CODE_PROTOCOL};
use session::{PostOutcome, SessionStore};

const SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub enum TransportMode {
    Stateless(Arc<ServerPool>),
    Stateful(Arc<SessionStore>),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ConnectionManager>,
    pub mode: TransportMode,
    pub auth: Option<Arc<dyn TokenVerifier>>,
}

/// Lowercase, no trailing slash. `Origin` header values and configured
/// allow-list entries normalise the same way.
fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Empty list or a `*` entry accepts anything; a request without an Origin
/// header (non-browser client) always passes.
fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() || allowed.iter().any(|entry| entry == "*") {
        return true;
    }
    match origin {
        None => true,
        Some(origin) => {
            let normalized = normalize_origin(origin);
            allowed.iter().any(|entry| normalize_origin(entry) == normalized)
        }
    }
}

/// DNS-rebinding guard: when a Host allow-list is configured, the request's
/// Host header must match one of its entries exactly (case-insensitive).
fn host_allowed(allowed: &[String], host: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match host {
        None => false,
        Some(host) => {
            let host = host.to_ascii_lowercase();
            allowed.iter().any(|entry| entry.to_ascii_lowercase() == host)
        }
    }
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(rpc_error(Value::Null, CODE_PROTOCOL, message)),
    )
        .into_response()
}

async fn guard_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let headers = request.headers();
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.config.http.allowed_origins, origin) {
        tracing::warn!("rejected request from origin {:?}", origin);
        return forbidden("Origin not allowed");
    }
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !host_allowed(&state.config.http.allowed_hosts, host) {
        tracing::warn!("rejected request for host {:?}", host);
        return forbidden("Host not allowed");
    }
    next.run(request).await
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(SESSION_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)])
}

fn session_id_from(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok())
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(rpc_error(
            Value::Null,
            CODE_PROTOCOL,
            "Method not allowed in stateless mode",
        )),
    )
        .into_response()
}

async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(rpc_error(Value::Null, CODE_PARSE_ERROR, "Invalid JSON body")),
            )
                .into_response()
        }
    };

    match &state.mode {
        TransportMode::Stateless(pool) => match pool.run(request).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
        TransportMode::Stateful(store) => {
            match store.handle_post(session_id_from(&headers), request).await {
                PostOutcome::Response { body, session_id } => {
                    let mut response = match body {
                        Some(body) => Json(body).into_response(),
                        None => StatusCode::ACCEPTED.into_response(),
                    };
                    if let Some(id) = session_id {
                        if let Ok(value) = HeaderValue::from_str(&id) {
                            response
                                .headers_mut()
                                .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
                        }
                    }
                    response
                }
                PostOutcome::Error { status, body } => (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
                    Json(body),
                )
                    .into_response(),
            }
        }
    }
}

/// `GET /mcp`: server-sent-events stream for an existing session.
async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let TransportMode::Stateful(store) = &state.mode else {
        return method_not_allowed();
    };
    let Some(id) = session_id_from(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(rpc_error(
                Value::Null,
                CODE_PROTOCOL,
                "Missing mcp-session-id header",
            )),
        )
            .into_response();
    };
    match store.open_stream(id) {
        Some(receiver) => Sse::new(ReceiverStream::new(receiver))
            .keep_alive(KeepAlive::default())
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(rpc_error(
                Value::Null,
                CODE_PROTOCOL,
                format!("Unknown session: {id}"),
            )),
        )
            .into_response(),
    }
}

async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let TransportMode::Stateful(store) = &state.mode else {
        return method_not_allowed();
    };
    let Some(id) = session_id_from(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(rpc_error(
                Value::Null,
                CODE_PROTOCOL,
                "Missing mcp-session-id header",
            )),
        )
            .into_response();
    };
    if store.delete(id) {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(rpc_error(
                Value::Null,
                CODE_PROTOCOL,
                format!("Unknown session: {id}"),
            )),
        )
            .into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_ready(State(state): State<AppState>) -> Response {
    match state.manager.health_check().await {
        Ok(()) => Json(json!({
            "status": "ready",
            "database": "connected",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": obfuscate(&e.to_string()),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
    }
}

pub fn build_router(state: AppState) -> Router {
    let oauth = state.auth.is_some();

    let mut mcp = Router::new().route(
        "/mcp",
        axum::routing::post(mcp_post).get(mcp_get).delete(mcp_delete),
    );
    if oauth {
        mcp = mcp.route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_middleware,
        ));
    }

    let mut app = Router::new()
        .merge(mcp)
        .route("/health", get(health))
        .route("/health/ready", get(health_ready));
    if oauth {
        app = app
            .route(
                "/.well-known/oauth-protected-resource",
                get(auth::resource_metadata),
            )
            .route(
                "/mcp/.well-known/oauth-protected-resource",
                get(auth::resource_metadata),
            );
    }

    // Layers run last-added-first: CORS answers preflights before the guard
    // sees them, and the guard runs before auth and the handlers.
    app.layer(middleware::from_fn_with_state(
        state.clone(),
        guard_middleware,
    ))
    .layer(cors_layer())
    .with_state(state)
}

pub fn build_state(config: Arc<Config>, manager: Arc<ConnectionManager>) -> AppState {
    let registry = ToolRegistry::new(manager.clone());
    let mode = if config.http.stateless {
        TransportMode::Stateless(ServerPool::new(registry, config.http.server_pool_size))
    } else {
        TransportMode::Stateful(SessionStore::new(
            registry,
            config.http.session_ttl_minutes,
            std::time::Duration::from_millis(config.http.session_cleanup_interval_ms),
        ))
    };
    let auth: Option<Arc<dyn TokenVerifier>> = match config.http.auth_mode {
        AuthMode::OAuth => Some(Arc::new(Auth0JwksVerifier::new(
            config.http.auth0_domain.clone().unwrap_or_default(),
            config.http.auth0_audience.clone().unwrap_or_default(),
        ))),
        AuthMode::None => None,
    };
    AppState {
        config,
        manager,
        mode,
        auth,
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");
}

/// HTTP entry point.
pub async fn run_http(config: Arc<Config>) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(config.clone());
    let init_task = spawn_init_retry(manager.clone());

    let state = build_state(config.clone(), manager.clone());
    let app = build_router(state.clone());

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        "HTTP transport listening on {} ({} mode{})",
        addr,
        if config.http.stateless { "stateless" } else { "stateful" },
        if state.auth.is_some() { ", oauth" } else { "" },
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let TransportMode::Stateful(store) = &state.mode {
        store.stop();
    }
    init_task.abort();
    manager.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::util::ServiceExt;

    fn test_state(mutate: impl FnOnce(&mut Config)) -> AppState {
        let mut config = Config::default();
        mutate(&mut config);
        let config = Arc::new(config);
        let manager = ConnectionManager::new(config.clone());
        build_state(config, manager)
    }

    fn post_mcp(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn initialize_body() -> Value {
        json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "t", "version": "0" }
            }
        })
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ── Guard helpers ────────────────────────────────────────────────────

    #[test]
    fn origin_normalization() {
        assert_eq!(normalize_origin("https://App.Example.com/"), "https://app.example.com");
        assert_eq!(normalize_origin("  http://x "), "http://x");
    }

    #[test]
    fn origin_allowed_rules() {
        let any: Vec<String> = vec![];
        assert!(origin_allowed(&any, Some("https://evil.example")));

        let star = vec!["*".to_string()];
        assert!(origin_allowed(&star, Some("https://evil.example")));

        let allowed = vec!["https://app.example.com".to_string()];
        assert!(origin_allowed(&allowed, Some("https://app.example.com")));
        assert!(origin_allowed(&allowed, Some("https://APP.example.com/")));
        assert!(!origin_allowed(&allowed, Some("https://evil.example")));
        assert!(origin_allowed(&allowed, None), "non-browser clients pass");
    }

    #[test]
    fn host_allowed_rules() {
        let unchecked: Vec<String> = vec![];
        assert!(host_allowed(&unchecked, Some("anything")));
        assert!(host_allowed(&unchecked, None));

        let allowed = vec!["mcp.example.com:3000".to_string()];
        assert!(host_allowed(&allowed, Some("mcp.example.com:3000")));
        assert!(host_allowed(&allowed, Some("MCP.example.com:3000")));
        assert!(!host_allowed(&allowed, Some("evil.example:3000")));
        assert!(!host_allowed(&allowed, None));
    }

    // ── Stateless mode ───────────────────────────────────────────────────

    #[tokio::test]
    async fn stateless_initialize_has_no_session_header() {
        let app = build_router(test_state(|_| {}));
        let response = app.oneshot(post_mcp(initialize_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SESSION_ID_HEADER).is_none());
        let body = body_json(response).await;
        assert_eq!(body["result"]["serverInfo"]["name"], "postgresql-ssh-mcp");
    }

    #[tokio::test]
    async fn stateless_tools_list_without_session() {
        let app = build_router(test_state(|_| {}));
        let response = app
            .oneshot(post_mcp(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let names: Vec<&str> = body["result"]["tools"]
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
            "list_active_connections",
            "list_long_running_queries",
            "get_database_version",
            "get_database_size",
            "get_table_stats",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn stateless_get_and_delete_are_405() {
        let app = build_router(test_state(|_| {}));
        let get_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/mcp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let delete_response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/mcp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(delete_response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn invalid_json_body_is_parse_error() {
        let app = build_router(test_state(|_| {}));
        let request = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], CODE_PARSE_ERROR);
    }

    // ── Stateful mode ────────────────────────────────────────────────────

    #[tokio::test]
    async fn stateful_session_lifecycle() {
        let app = build_router(test_state(|c| c.http.stateless = false));

        let response = app
            .clone()
            .oneshot(post_mcp(initialize_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("stateful initialize returns a session id")
            .to_str()
            .unwrap()
            .to_string();

        // Follow-up with the id works.
        let mut request = post_mcp(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}));
        request
            .headers_mut()
            .insert(SESSION_ID_HEADER, session_id.parse().unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Without the id: 400.
        let response = app
            .clone()
            .oneshot(post_mcp(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // DELETE terminates; a second DELETE is 404.
        let delete = |id: &str| {
            Request::builder()
                .method("DELETE")
                .uri("/mcp")
                .header(SESSION_ID_HEADER, id)
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete(&session_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(delete(&session_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stateful_get_opens_sse_stream() {
        let app = build_router(test_state(|c| c.http.stateless = false));
        let response = app
            .clone()
            .oneshot(post_mcp(initialize_body()))
            .await
            .unwrap();
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let request = Request::builder()
            .method("GET")
            .uri("/mcp")
            .header(SESSION_ID_HEADER, &session_id)
            .header("accept", "text/event-stream")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    // ── Guards ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn mismatched_origin_is_403() {
        let app = build_router(test_state(|c| {
            c.http.allowed_origins = vec!["https://app.example.com".to_string()];
        }));
        let mut request = post_mcp(initialize_body());
        request
            .headers_mut()
            .insert(header::ORIGIN, "https://evil.example".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], CODE_PROTOCOL);
    }

    #[tokio::test]
    async fn mismatched_host_is_403() {
        let app = build_router(test_state(|c| {
            c.http.allowed_hosts = vec!["mcp.example.com".to_string()];
        }));
        // axum fills Host from the request URI authority; an absolute URI
        // with the wrong host must be rejected.
        let mut request = post_mcp(initialize_body());
        request
            .headers_mut()
            .insert(header::HOST, "evil.example".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // ── Health ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn health_is_ok_without_database() {
        let app = build_router(test_state(|_| {}));
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn readiness_reports_disconnected_database() {
        let app = build_router(test_state(|_| {}));
        let request = Request::builder()
            .method("GET")
            .uri("/health/ready")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["database"], "disconnected");
    }

    // ── OAuth ────────────────────────────────────────────────────────────

    fn oauth_state() -> AppState {
        test_state(|c| {
            c.http.auth_mode = AuthMode::OAuth;
            c.http.auth0_domain = Some("tenant.auth0.com".to_string());
            c.http.auth0_audience = Some("https://api.example.com".to_string());
        })
    }

    #[tokio::test]
    async fn missing_bearer_token_is_401_with_www_authenticate() {
        let app = build_router(oauth_state());
        let mut request = post_mcp(initialize_body());
        request
            .headers_mut()
            .insert(header::HOST, "mcp.example.com".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let www = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(www.contains(
            "resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
        ));
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], rpc::CODE_AUTH);
    }

    #[tokio::test]
    async fn health_is_not_behind_auth() {
        let app = build_router(oauth_state());
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn resource_metadata_is_served_on_both_paths() {
        let app = build_router(oauth_state());
        for path in [
            "/.well-known/oauth-protected-resource",
            "/mcp/.well-known/oauth-protected-resource",
        ] {
            let request = Request::builder()
                .method("GET")
                .uri(path)
                .header(header::HOST, "mcp.example.com")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            let body = body_json(response).await;
            assert_eq!(
                body["authorization_servers"][0],
                "https://tenant.auth0.com/"
            );
            assert_eq!(body["scopes_supported"][0], "openid");
        }
    }
}

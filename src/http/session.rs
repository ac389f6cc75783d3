//! Stateful-mode session store.
//!
//! Sessions are keyed by the `mcp-session-id` header: created by a valid
//! `initialize` without an id, refreshed on every request, destroyed by an
//! explicit DELETE, by the TTL sweeper, or by `stop()`.

use super::rpc::{self, RpcServer};
use crate::server::ToolRegistry;
use axum::response::sse::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

struct SessionEntry {
    server: Arc<Mutex<RpcServer>>,
    sse_tx: Option<mpsc::Sender<Result<Event, Infallible>>>,
    last_access: Instant,
}

/// What a POST produced: a JSON-RPC body (or 202 for notifications) plus a
/// session id to echo, or a protocol error with its HTTP status.
pub enum PostOutcome {
    Response {
        body: Option<Value>,
        session_id: Option<String>,
    },
    Error {
        status: u16,
        body: Value,
    },
}

pub struct SessionStore {
    registry: Arc<ToolRegistry>,
    sessions: Arc<StdMutex<HashMap<String, SessionEntry>>>,
    ttl: Duration,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(
        registry: Arc<ToolRegistry>,
        ttl_minutes: u64,
        cleanup_interval: Duration,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            registry,
            sessions: Arc::new(StdMutex::new(HashMap::new())),
            ttl: Duration::from_secs(ttl_minutes * 60),
            sweeper: StdMutex::new(None),
        });

        let sweeper = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&store),
            cleanup_interval,
        ));
        *store.sweeper.lock().unwrap() = Some(sweeper);
        store
    }

    /// Drop sessions idle past the TTL. The key set is snapshotted before
    /// any removal so concurrent request handlers never race the iteration.
    async fn sweep_loop(store: std::sync::Weak<SessionStore>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                return;
            };
            let Some(cutoff) = Instant::now().checked_sub(store.ttl) else {
                continue;
            };
            let stale: Vec<String> = {
                let sessions = store.sessions.lock().unwrap();
                sessions
                    .iter()
                    .filter(|(_, entry)| entry.last_access <= cutoff)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in stale {
                if store.sessions.lock().unwrap().remove(&id).is_some() {
                    tracing::info!("session {} expired", id);
                }
            }
        }
    }

    pub async fn handle_post(&self, session_id: Option<&str>, request: Value) -> PostOutcome {
        if rpc::is_initialize_request(&request) {
            return self.handle_initialize_post(session_id, request).await;
        }

        let Some(id) = session_id else {
            return PostOutcome::Error {
                status: 400,
                body: rpc::rpc_error(
                    Value::Null,
                    rpc::CODE_PROTOCOL,
                    "Missing mcp-session-id header",
                ),
            };
        };

        let Some(server) = self.touch(id) else {
            return PostOutcome::Error {
                status: 404,
                body: rpc::rpc_error(
                    Value::Null,
                    rpc::CODE_PROTOCOL,
                    format!("Unknown session: {id}"),
                ),
            };
        };

        let body = server.lock().await.handle(request).await;
        PostOutcome::Response {
            body,
            session_id: Some(id.to_string()),
        }
    }

    /// `initialize` with no id creates a session; with a known id it
    /// replaces that session's protocol state in place.
    async fn handle_initialize_post(
        &self,
        session_id: Option<&str>,
        request: Value,
    ) -> PostOutcome {
        if let Some(id) = session_id {
            let Some(server) = self.touch(id) else {
                return PostOutcome::Error {
                    status: 404,
                    body: rpc::rpc_error(
                        Value::Null,
                        rpc::CODE_PROTOCOL,
                        format!("Unknown session: {id}"),
                    ),
                };
            };
            let mut server = server.lock().await;
            server.reset();
            let body = server.handle(request).await;
            return PostOutcome::Response {
                body,
                session_id: Some(id.to_string()),
            };
        }

        let id = uuid::Uuid::new_v4().to_string();
        let server = Arc::new(Mutex::new(RpcServer::new(self.registry.clone())));
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(
                id.clone(),
                SessionEntry {
                    server: server.clone(),
                    sse_tx: None,
                    last_access: Instant::now(),
                },
            );
        }
        tracing::info!("session {} created", id);
        let body = server.lock().await.handle(request).await;
        PostOutcome::Response {
            body,
            session_id: Some(id),
        }
    }

    /// Refresh `last_access` and return the session's server handle.
    fn touch(&self, id: &str) -> Option<Arc<Mutex<RpcServer>>> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.get_mut(id)?;
        entry.last_access = Instant::now();
        Some(entry.server.clone())
    }

    /// Attach an SSE stream to a session. Returns the receiving end, or
    /// `None` when the session does not exist.
    pub fn open_stream(&self, id: &str) -> Option<mpsc::Receiver<Result<Event, Infallible>>> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.get_mut(id)?;
        entry.last_access = Instant::now();
        let (tx, rx) = mpsc::channel(16);
        // A fresh GET replaces any previous stream; dropping the old sender
        // ends the old response.
        entry.sse_tx = Some(tx);
        Some(rx)
    }

    /// Explicit termination. True when the session existed.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(id).is_some();
        if removed {
            tracing::info!("session {} terminated", id);
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Close every session transport and stop the sweeper.
    pub fn stop(&self) {
        if let Some(task) = self.sweeper.lock().unwrap().take() {
            task.abort();
        }
        // Dropping the entries drops the SSE senders, which closes streams.
        self.sessions.lock().unwrap().clear();
    }
}

//! Pooled PostgreSQL access, optionally through the SSH tunnel.
//!
//! The manager owns the pool and the tunnel. When the tunnel reconnects on a
//! new local port, a fresh pool is built and swapped in while the old one
//! drains in the background; queries in flight keep their clone of the old
//! pool and either finish or surface a driver error.

use crate::config::Config;
use crate::error::ServerError;
use crate::sql_guard;
use crate::tunnel::{TunnelEvent, TunnelManager, TunnelState};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;

pub mod rows;

pub use rows::{FieldInfo, QueryParam};
use rows::{bind_params, field_descriptions, row_to_json};

const POOL_MAX_CONNECTIONS: u32 = 10;
const POOL_IDLE_TIMEOUT_SECS: u64 = 30;
const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 10;

const MSG_NOT_INITIALIZED: &str = "Connection not initialized";
const MSG_RECONNECTING: &str = "Database connection lost, reconnecting...";

/// Result envelope for one statement. `truncated` is true iff the database
/// produced more than `max_rows` usable rows.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Map<String, Value>>,
    #[serde(rename = "rowCount")]
    pub row_count: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatusReport {
    pub status: &'static str,
    #[serde(rename = "localPort")]
    pub local_port: Option<u16>,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: Option<u64>,
    #[serde(rename = "reconnectAttempts")]
    pub reconnect_attempts: u32,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<TunnelState> for TunnelStatusReport {
    fn from(state: TunnelState) -> Self {
        Self {
            status: state.status.as_str(),
            local_port: state.local_port,
            uptime_seconds: state.uptime_seconds(),
            reconnect_attempts: state.reconnect_attempts,
            last_error: state.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub initialized: bool,
    pub connected: bool,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(rename = "sshTunnel", skip_serializing_if = "Option::is_none")]
    pub ssh_tunnel: Option<TunnelStatusReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolCounters>,
    pub queries: QueryCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolCounters {
    pub size: u32,
    pub idle: usize,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCounters {
    #[serde(rename = "inFlight")]
    pub in_flight: usize,
    pub waiting: usize,
    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: usize,
}

pub struct ConnectionManager {
    config: Arc<Config>,
    pool: RwLock<Option<PgPool>>,
    tunnel: StdMutex<Option<Arc<TunnelManager>>>,
    gate: Arc<Semaphore>,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    reconnecting: AtomicBool,
    initialized: AtomicBool,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Map the SSL switch onto a driver mode.
///
/// | ssl        | reject_unauthorized | has_ca | mode      |
/// |------------|---------------------|--------|-----------|
/// | Some(false)| *                   | *      | Disable   |
/// | Some(true) | false               | *      | Require   |
/// | Some(true) | true                | true   | VerifyCa  |
/// | Some(true) | true                | false  | VerifyFull|
/// | None       | (local host)        | *      | Disable   |
/// | None       | (remote host)       | *      | Require   |
fn determine_ssl_mode(
    ssl: Option<bool>,
    reject_unauthorized: bool,
    has_ca: bool,
    configured_host: &str,
) -> PgSslMode {
    match (ssl, reject_unauthorized, has_ca) {
        (Some(false), _, _) => PgSslMode::Disable,
        (Some(true), false, _) => PgSslMode::Require,
        (Some(true), true, true) => PgSslMode::VerifyCa,
        (Some(true), true, false) => PgSslMode::VerifyFull,
        (None, _, _) => {
            if is_local_host(configured_host) {
                PgSslMode::Disable
            } else {
                PgSslMode::Require
            }
        }
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Unique name for a server-side cursor.
fn cursor_name() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("mcp_cursor_{}_{:04x}", millis, rand::random::<u16>())
}

async fn build_pool(config: &Config, tunnel_port: Option<u16>) -> Result<PgPool, ServerError> {
    let db = &config.database;
    let (host, port) = match tunnel_port {
        Some(p) => ("127.0.0.1", p),
        None => (db.host.as_str(), db.port),
    };
    // SSL auto-detection keys off the *configured* host: through a tunnel the
    // socket goes to 127.0.0.1 but the server on the far end is remote.
    let ssl_mode = determine_ssl_mode(
        db.ssl,
        db.ssl_reject_unauthorized,
        db.ssl_ca.is_some(),
        &db.host,
    );

    let mut opts = PgConnectOptions::new()
        .host(host)
        .port(port)
        .username(&db.user)
        .ssl_mode(ssl_mode)
        .options([(
            "statement_timeout",
            config.limits.query_timeout_ms.to_string(),
        )]);
    if !db.password.is_empty() {
        opts = opts.password(&db.password);
    }
    if let Some(name) = &db.name {
        opts = opts.database(name);
    }
    if let Some(ca) = &db.ssl_ca {
        opts = opts.ssl_root_cert(ca);
    }

    let pool = PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
        .acquire_timeout(Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS))
        .connect_with(opts)
        .await
        .map_err(|e| ServerError::Query(format!("Failed to create connection pool: {e}")))?;
    Ok(pool)
}

impl ConnectionManager {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let max = config.limits.max_concurrent_queries;
        Arc::new(Self {
            config,
            pool: RwLock::new(None),
            tunnel: StdMutex::new(None),
            gate: Arc::new(Semaphore::new(max)),
            in_flight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            event_task: StdMutex::new(None),
        })
    }

    /// Bring up the tunnel (when configured) and the pool, then smoke-test
    /// with `SELECT 1`. Any failure here is fatal to initialization.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut tunnel_port = None;

        if let Some(ssh) = &self.config.ssh {
            let tunnel = TunnelManager::new(
                ssh.clone(),
                self.config.database.host.clone(),
                self.config.database.port,
            );
            let events = tunnel.subscribe();
            let task = tokio::spawn(Self::handle_tunnel_events(Arc::downgrade(self), events));
            *self.event_task.lock().unwrap() = Some(task);
            *self.tunnel.lock().unwrap() = Some(tunnel.clone());

            tunnel_port = Some(tunnel.connect().await?);
        }

        let pool = build_pool(&self.config, tunnel_port).await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ServerError::Query(format!("Database connectivity check failed: {e}")))?;

        *self.pool.write().await = Some(pool);
        self.reconnecting.store(false, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            "connected to PostgreSQL at {}:{}{}",
            self.config.database.host,
            self.config.database.port,
            if tunnel_port.is_some() { " (via SSH tunnel)" } else { "" }
        );
        Ok(())
    }

    async fn handle_tunnel_events(
        manager: std::sync::Weak<ConnectionManager>,
        mut events: broadcast::Receiver<TunnelEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match event {
                TunnelEvent::Disconnecting { old_port } => {
                    tracing::warn!("tunnel lost (port {}); failing queries fast", old_port);
                    manager.reconnecting.store(true, Ordering::SeqCst);
                }
                TunnelEvent::Reconnected { old_port, new_port } => {
                    tracing::info!("tunnel back: port {} -> {}", old_port, new_port);
                    manager.swap_pool(new_port).await;
                }
                TunnelEvent::Failed { error } => {
                    tracing::error!("tunnel failed permanently: {}", error);
                    manager.initialized.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Build a pool against the new tunnel port and retire the old one. The
    /// old pool gets `pool_drain_timeout_ms` to drain; afterwards it is
    /// dropped and sqlx reaps its connections in the background.
    async fn swap_pool(&self, new_port: u16) {
        match build_pool(&self.config, Some(new_port)).await {
            Ok(new_pool) => {
                let old = self.pool.write().await.replace(new_pool);
                self.reconnecting.store(false, Ordering::SeqCst);
                if let Some(old) = old {
                    let drain = Duration::from_millis(self.config.limits.pool_drain_timeout_ms);
                    if tokio::time::timeout(drain, old.close()).await.is_err() {
                        tracing::warn!(
                            "old pool did not drain within {}ms; abandoning it",
                            drain.as_millis()
                        );
                    }
                }
            }
            Err(e) => {
                // Stay in the reconnecting state: queries keep failing fast
                // and the next tunnel event gets another chance.
                tracing::error!(
                    "failed to rebuild pool after tunnel reconnect: {}",
                    crate::obfuscate::obfuscate(&e.to_string())
                );
            }
        }
    }

    fn fail_fast_message(&self) -> &'static str {
        if self.reconnecting.load(Ordering::SeqCst) {
            MSG_RECONNECTING
        } else {
            MSG_NOT_INITIALIZED
        }
    }

    /// Execute one statement under the concurrency gate.
    ///
    /// Read-only mode validates first and runs inside a `READ ONLY`
    /// transaction that is always rolled back. Cursor-eligible statements are
    /// row-capped server-side with `DECLARE ... FETCH`; everything else is
    /// capped client-side.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<QueryResult, ServerError> {
        if !self.initialized.load(Ordering::SeqCst) || self.reconnecting.load(Ordering::SeqCst) {
            return Err(ServerError::pool(self.fail_fast_message()));
        }

        if self.config.limits.read_only {
            sql_guard::validate_read_only(sql)?;
        }

        // FIFO gate: tokio's semaphore queues waiters in acquire order.
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit.map_err(|_| ServerError::pool(MSG_NOT_INITIALIZED))?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.run_gated(sql, params).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_gated(&self, sql: &str, params: &[QueryParam]) -> Result<QueryResult, ServerError> {
        let pool = {
            let guard = self.pool.read().await;
            guard.clone().ok_or_else(|| ServerError::pool(self.fail_fast_message()))?
        };

        let max_rows = self.config.limits.max_rows;
        let cursor_eligible = sql_guard::is_cursor_eligible(sql);
        let mut conn = pool.acquire().await?;

        if self.config.limits.read_only {
            sqlx::query("BEGIN TRANSACTION READ ONLY")
                .execute(&mut *conn)
                .await?;
            let outcome = if cursor_eligible {
                fetch_via_cursor(&mut conn, sql, params, max_rows).await
            } else {
                fetch_direct(&mut conn, sql, params, max_rows).await
            };
            // Rolled back on every path: nothing a read-only transaction did
            // is worth keeping.
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            outcome
        } else if cursor_eligible {
            sqlx::query("BEGIN").execute(&mut *conn).await?;
            match fetch_via_cursor(&mut conn, sql, params, max_rows).await {
                Ok(result) => {
                    sqlx::query("COMMIT").execute(&mut *conn).await?;
                    Ok(result)
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    Err(e)
                }
            }
        } else {
            fetch_direct(&mut conn, sql, params, max_rows).await
        }
    }

    pub async fn health_check(&self) -> Result<(), ServerError> {
        let pool = {
            let guard = self.pool.read().await;
            guard.clone().ok_or_else(|| ServerError::pool(self.fail_fast_message()))?
        };
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    pub async fn status(&self) -> ConnectionStatus {
        let pool_counters = self.pool.read().await.as_ref().map(|p| PoolCounters {
            size: p.size(),
            idle: p.num_idle(),
            max: POOL_MAX_CONNECTIONS,
        });
        let tunnel_report = self
            .tunnel
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| TunnelStatusReport::from(t.state()));
        let initialized = self.initialized.load(Ordering::SeqCst);

        ConnectionStatus {
            initialized,
            connected: initialized
                && !self.reconnecting.load(Ordering::SeqCst)
                && pool_counters.is_some(),
            read_only: self.config.limits.read_only,
            host: self.config.database.host.clone(),
            port: self.config.database.port,
            database: self.config.database.name.clone(),
            ssh_tunnel: tunnel_report,
            pool: pool_counters,
            queries: QueryCounters {
                in_flight: self.in_flight.load(Ordering::SeqCst),
                waiting: self.waiting.load(Ordering::SeqCst),
                max_concurrent: self.config.limits.max_concurrent_queries,
            },
        }
    }

    /// Close the pool, then the tunnel. Safe to call repeatedly.
    pub async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        let tunnel = self.tunnel.lock().unwrap().take();
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

/// `DECLARE <name> CURSOR FOR <sql>`, `FETCH max_rows+1`, always `CLOSE`.
/// Fetching one row beyond the cap is what makes `truncated` exact.
async fn fetch_via_cursor(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>,
    sql: &str,
    params: &[QueryParam],
    max_rows: usize,
) -> Result<QueryResult, ServerError> {
    let name = cursor_name();
    let declare = format!("DECLARE {} CURSOR FOR {}", name, sql);
    bind_params(sqlx::query(&declare), params)
        .execute(&mut **conn)
        .await?;

    let fetch = format!("FETCH {} FROM {}", max_rows + 1, name);
    let fetched = sqlx::query(&fetch).fetch_all(&mut **conn).await;

    // Best-effort close; the surrounding transaction ends either way.
    let _ = sqlx::query(&format!("CLOSE {}", name))
        .execute(&mut **conn)
        .await;

    let mut rows = fetched?;
    let truncated = rows.len() > max_rows;
    if truncated {
        rows.truncate(max_rows);
    }

    let fields = rows.first().map(|r| field_descriptions(r));
    let json_rows: Vec<_> = rows.iter().map(row_to_json).collect();
    Ok(QueryResult {
        row_count: json_rows.len(),
        rows: json_rows,
        truncated,
        fields,
        command: None,
    })
}

/// Run a statement as-is and cap the produced rows client-side. Used for
/// statements a cursor cannot wrap (SHOW, EXPLAIN, and all write-mode DML).
async fn fetch_direct(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>,
    sql: &str,
    params: &[QueryParam],
    max_rows: usize,
) -> Result<QueryResult, ServerError> {
    let mut rows = bind_params(sqlx::query(sql), params)
        .fetch_all(&mut **conn)
        .await?;
    let truncated = rows.len() > max_rows;
    if truncated {
        rows.truncate(max_rows);
    }

    let fields = rows.first().map(|r| field_descriptions(r));
    let json_rows: Vec<_> = rows.iter().map(row_to_json).collect();
    Ok(QueryResult {
        row_count: json_rows.len(),
        rows: json_rows,
        truncated,
        fields,
        command: sql_guard::first_keyword(sql),
    })
}

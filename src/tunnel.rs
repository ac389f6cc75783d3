//! SSH tunnel manager: a local TCP forwarder over a reusable SSH connection.
//!
//! The manager owns the SSH client, the local listener, and every forwarded
//! socket; nothing else touches them. Consumers observe the tunnel through
//! [`TunnelManager::state`] and the [`TunnelEvent`] broadcast channel.
//!
//! Lifecycle: `connect()` establishes the SSH session (verifying the host key
//! against `known_hosts`), binds `127.0.0.1:0`, and forwards each inbound TCP
//! connection through a `direct-tcpip` channel to the target host. A lost
//! session triggers reconnection with exponential backoff; the local port
//! usually changes across a reconnect because the listener is rebound.

use crate::config::SshConfig;
use crate::error::ServerError;
use crate::hostkeys::HostKeyVerifier;
use crate::obfuscate::obfuscate;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use russh::client::{self, Handle};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::Disconnect;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// SSH session readiness deadline.
const READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Missed-keepalive budget before russh declares the connection dead.
const KEEPALIVE_MAX: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Reconnecting => "reconnecting",
            TunnelStatus::Failed => "failed",
        }
    }
}

/// Snapshot of the tunnel. `local_port` is non-None iff status is Connected.
#[derive(Debug, Clone)]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub local_port: Option<u16>,
    pub connected_since: Option<Instant>,
    pub reconnect_attempts: u32,
    /// Already obfuscated.
    pub last_error: Option<String>,
}

impl TunnelState {
    fn new() -> Self {
        Self {
            status: TunnelStatus::Disconnected,
            local_port: None,
            connected_since: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    pub fn uptime_seconds(&self) -> Option<u64> {
        self.connected_since.map(|t| t.elapsed().as_secs())
    }
}

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The SSH session was lost; the pool must stop handing out this port.
    Disconnecting { old_port: u16 },
    /// A reconnect succeeded on a (usually different) local port.
    Reconnected { old_port: u16, new_port: u16 },
    /// Reconnect attempts are exhausted.
    Failed { error: String },
}

/// Everything that must be torn down together when the session ends.
#[derive(Default)]
struct Live {
    session: Option<Arc<Handle<TunnelHandler>>>,
    accept_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    sockets: Arc<StdMutex<HashMap<u64, JoinHandle<()>>>>,
}

pub struct TunnelManager {
    config: SshConfig,
    target_host: String,
    target_port: u16,
    state: Arc<StdMutex<TunnelState>>,
    events: broadcast::Sender<TunnelEvent>,
    live: Mutex<Live>,
    shutting_down: Arc<AtomicBool>,
    socket_ids: AtomicU64,
}

/// Backoff before reconnect attempt number `attempts` (0-based):
/// `min(30s, 1s * 2^attempts)`.
fn backoff_delay(attempts: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempts)
        .map(|s| s.min(30))
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// Reject private keys readable by group or other; ssh itself would.
#[cfg(unix)]
fn check_key_permissions(path: &str) -> Result<(), ServerError> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path).map_err(|e| {
        ServerError::tunnel(format!("Cannot read SSH private key {}: {}", path, e))
    })?;
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(ServerError::tunnel(format!(
            "SSH private key {} has permissions {:03o}; it must not be readable by \
             group or other. Run: chmod 600 {}",
            path,
            mode & 0o777,
            path
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &str) -> Result<(), ServerError> {
    Ok(())
}

/// russh handshake callbacks. Host-key verification happens here, before the
/// session is usable; the outcome is mirrored into the shared slots so the
/// connect path can report the precise rejection reason.
struct TunnelHandler {
    verifier: HostKeyVerifier,
    host: String,
    port: u16,
    strict: bool,
    verified: Arc<AtomicBool>,
    rejection: Arc<StdMutex<Option<String>>>,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let accept = if !self.strict {
            self.verified.store(true, Ordering::SeqCst);
            true
        } else {
            match parse_public_key(server_public_key) {
                Some((key_type, key_bytes)) => {
                    let outcome =
                        self.verifier
                            .verify(&self.host, self.port, &key_type, &key_bytes);
                    if outcome.verified {
                        self.verified.store(true, Ordering::SeqCst);
                    } else if let Some(reason) = outcome.reason {
                        tracing::warn!("host key rejected: {}", reason);
                        *self.rejection.lock().unwrap() = Some(reason);
                    }
                    outcome.verified
                }
                None => {
                    *self.rejection.lock().unwrap() =
                        Some("Unsupported server host key encoding".to_string());
                    false
                }
            }
        };
        async move { Ok(accept) }
    }
}

/// `(key-type, raw key bytes)` from a russh public key.
fn parse_public_key(key: &russh::keys::PublicKey) -> Option<(String, Vec<u8>)> {
    let openssh = key.to_openssh().ok()?;
    let mut fields = openssh.split_whitespace();
    let key_type = fields.next()?.to_string();
    let key_bytes = BASE64_STANDARD.decode(fields.next()?).ok()?;
    Some((key_type, key_bytes))
}

impl TunnelManager {
    /// `target_host:target_port` is the database endpoint as seen from the
    /// bastion, not from this process.
    pub fn new(config: SshConfig, target_host: String, target_port: u16) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            config,
            target_host,
            target_port,
            state: Arc::new(StdMutex::new(TunnelState::new())),
            events,
            live: Mutex::new(Live::default()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            socket_ids: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TunnelState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().status == TunnelStatus::Connected
    }

    /// Establish the tunnel and return the local forwarding port.
    pub async fn connect(self: &Arc<Self>) -> Result<u16, ServerError> {
        self.set_status(TunnelStatus::Connecting);
        match self.connect_once().await {
            Ok(port) => Ok(port),
            Err(e) => {
                let msg = obfuscate(&e.to_string());
                {
                    let mut state = self.state.lock().unwrap();
                    state.status = TunnelStatus::Failed;
                    state.last_error = Some(msg);
                }
                Err(e)
            }
        }
    }

    /// One full connection attempt: SSH handshake + auth, listener bind,
    /// accept loop, liveness monitor. On success the state is Connected.
    async fn connect_once(self: &Arc<Self>) -> Result<u16, ServerError> {
        let ssh = &self.config;

        // Fail before any network traffic if the key would be rejected.
        if let Some(key_path) = &ssh.private_key_path {
            check_key_permissions(key_path)?;
        }

        let verified = Arc::new(AtomicBool::new(false));
        let rejection: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let handler = TunnelHandler {
            // Loaded per attempt: trust-on-first-use may have written the file
            // since the previous try.
            verifier: HostKeyVerifier::load(&ssh.known_hosts_path, ssh.trust_on_first_use),
            host: ssh.host.clone(),
            port: ssh.port,
            strict: ssh.strict_host_key,
            verified: verified.clone(),
            rejection: rejection.clone(),
        };

        let client_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_millis(ssh.keepalive_interval_ms)),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let connect =
            client::connect(client_config, (ssh.host.as_str(), ssh.port), handler);
        let mut session = match tokio::time::timeout(READY_TIMEOUT, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                // A host-key rejection surfaces as a generic handshake error;
                // the handler recorded the real reason.
                let reason = rejection.lock().unwrap().take();
                return Err(ServerError::tunnel(match reason {
                    Some(r) => r,
                    None => obfuscate(&format!(
                        "SSH connection to {}:{} failed: {}",
                        ssh.host, ssh.port, e
                    )),
                }));
            }
            Err(_) => {
                return Err(ServerError::tunnel(format!(
                    "SSH connection to {}:{} timed out after {}s",
                    ssh.host,
                    ssh.port,
                    READY_TIMEOUT.as_secs()
                )));
            }
        };

        if ssh.strict_host_key && !verified.load(Ordering::SeqCst) {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(ServerError::tunnel(
                "SSH session became ready without host key verification; refusing to proceed",
            ));
        }

        if let Err(e) = self.authenticate(&mut session).await {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(e);
        }

        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(ServerError::tunnel(format!(
                    "Failed to bind local forwarding port: {}",
                    e
                )));
            }
        };
        let local_port = listener
            .local_addr()
            .map_err(|e| ServerError::tunnel(format!("Failed to read local port: {}", e)))?
            .port();

        let sockets: Arc<StdMutex<HashMap<u64, JoinHandle<()>>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let session = Arc::new(session);
        let accept_task = self.spawn_accept_loop(listener, session.clone(), sockets.clone());
        let monitor_task = self.spawn_monitor(session.clone());

        {
            let mut live = self.live.lock().await;
            live.session = Some(session);
            live.accept_task = Some(accept_task);
            live.monitor_task = Some(monitor_task);
            live.sockets = sockets;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.status = TunnelStatus::Connected;
            state.local_port = Some(local_port);
            state.connected_since = Some(Instant::now());
            state.reconnect_attempts = 0;
            state.last_error = None;
        }
        tracing::info!(
            "SSH tunnel ready: 127.0.0.1:{} -> {}:{} via {}@{}",
            local_port,
            self.target_host,
            self.target_port,
            ssh.user,
            ssh.host
        );
        Ok(local_port)
    }

    async fn authenticate(
        &self,
        session: &mut Handle<TunnelHandler>,
    ) -> Result<(), ServerError> {
        let ssh = &self.config;
        let auth = if let Some(key_path) = &ssh.private_key_path {
            let key_data = std::fs::read_to_string(key_path).map_err(|e| {
                ServerError::tunnel(format!("Cannot read SSH private key {}: {}", key_path, e))
            })?;
            let key = decode_secret_key(&key_data, ssh.private_key_passphrase.as_deref())
                .map_err(|e| {
                    ServerError::tunnel(obfuscate(&format!(
                        "Failed to decode SSH private key {}: {}",
                        key_path, e
                    )))
                })?;
            session
                .authenticate_publickey(
                    ssh.user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await
        } else if let Some(password) = &ssh.password {
            session
                .authenticate_password(ssh.user.clone(), password.clone())
                .await
        } else {
            return Err(ServerError::tunnel(
                "SSH requires SSH_PRIVATE_KEY_PATH or SSH_PASSWORD",
            ));
        };

        let result = auth.map_err(|e| {
            ServerError::tunnel(obfuscate(&format!("SSH authentication error: {}", e)))
        })?;
        if !result.success() {
            return Err(ServerError::tunnel(format!(
                "SSH authentication failed for {}@{}; check the configured key or password",
                self.config.user, self.config.host
            )));
        }
        Ok(())
    }

    fn spawn_accept_loop(
        self: &Arc<Self>,
        listener: TcpListener,
        session: Arc<Handle<TunnelHandler>>,
        sockets: Arc<StdMutex<HashMap<u64, JoinHandle<()>>>>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let target_host = self.target_host.clone();
        let target_port = self.target_port;
        tokio::spawn(async move {
            loop {
                let (mut tcp, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("tunnel listener closed: {}", e);
                        return;
                    }
                };
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let session = session.clone();
                let target_host = target_host.clone();
                let sockets_for_task = sockets.clone();
                let id = manager.socket_ids.fetch_add(1, Ordering::Relaxed);
                let lost = Arc::downgrade(&manager);
                let task = tokio::spawn(async move {
                    match session
                        .channel_open_direct_tcpip(
                            target_host.as_str(),
                            target_port as u32,
                            "127.0.0.1",
                            peer.port() as u32,
                        )
                        .await
                    {
                        Ok(channel) => {
                            let mut remote = channel.into_stream();
                            // Either side closing or erroring closes the other.
                            let _ = tokio::io::copy_bidirectional(&mut tcp, &mut remote).await;
                        }
                        Err(e) => {
                            tracing::warn!("direct-tcpip channel open failed: {}", e);
                            // A channel failure on a dead session is the
                            // fastest disconnect signal we get.
                            if let Some(manager) = lost.upgrade() {
                                if manager.session_is_closed().await {
                                    manager.on_connection_lost().await;
                                }
                            }
                        }
                    }
                    sockets_for_task.lock().unwrap().remove(&id);
                });
                sockets.lock().unwrap().insert(id, task);
            }
        })
    }

    fn spawn_monitor(self: &Arc<Self>, session: Arc<Handle<TunnelHandler>>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.keepalive_interval_ms.max(1000));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if session.is_closed() {
                    manager.on_connection_lost().await;
                    return;
                }
            }
        })
    }

    async fn session_is_closed(&self) -> bool {
        let live = self.live.lock().await;
        live.session.as_ref().map(|s| s.is_closed()).unwrap_or(true)
    }

    /// Post-ready loss of the SSH session: tear down every forwarded socket
    /// and the listener, then start the backoff-driven reconnect loop.
    async fn on_connection_lost(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let old_port = {
            let mut state = self.state.lock().unwrap();
            if state.status != TunnelStatus::Connected {
                return; // already handling it
            }
            state.status = TunnelStatus::Reconnecting;
            let port = state.local_port.take().unwrap_or(0);
            state.connected_since = None;
            port
        };
        tracing::warn!("SSH connection lost; reconnecting (old local port {})", old_port);
        self.teardown_live().await;
        let _ = self.events.send(TunnelEvent::Disconnecting { old_port });

        let manager = self.clone();
        let reconnect = tokio::spawn(async move {
            manager.reconnect_loop(old_port).await;
        });
        self.live.lock().await.reconnect_task = Some(reconnect);
    }

    async fn reconnect_loop(self: Arc<Self>, old_port: u16) {
        loop {
            let attempts = self.state.lock().unwrap().reconnect_attempts;
            tokio::time::sleep(backoff_delay(attempts)).await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            {
                let mut state = self.state.lock().unwrap();
                state.status = TunnelStatus::Connecting;
                state.reconnect_attempts = attempts + 1;
            }
            tracing::info!(
                "SSH reconnect attempt {} to {}:{}",
                attempts + 1,
                self.config.host,
                self.config.port
            );

            match self.connect_once().await {
                Ok(new_port) => {
                    let _ = self
                        .events
                        .send(TunnelEvent::Reconnected { old_port, new_port });
                    return;
                }
                Err(e) => {
                    let msg = obfuscate(&e.to_string());
                    tracing::warn!("SSH reconnect attempt {} failed: {}", attempts + 1, msg);
                    self.teardown_live().await;

                    let exhausted = {
                        let mut state = self.state.lock().unwrap();
                        state.last_error = Some(msg.clone());
                        let max = self.config.max_reconnect_attempts;
                        if max >= 0 && state.reconnect_attempts >= max as u32 {
                            state.status = TunnelStatus::Failed;
                            true
                        } else {
                            state.status = TunnelStatus::Reconnecting;
                            false
                        }
                    };
                    if exhausted {
                        tracing::error!(
                            "SSH reconnect attempts exhausted after {} tries",
                            self.config.max_reconnect_attempts
                        );
                        let _ = self.events.send(TunnelEvent::Failed { error: msg });
                        return;
                    }
                }
            }
        }
    }

    /// Destroy forwarded sockets, listener, monitor, and the SSH session.
    /// The reconnect task is left alone: the reconnect loop itself calls this.
    async fn teardown_live(&self) {
        let (session, accept, monitor, sockets) = {
            let mut live = self.live.lock().await;
            let session = live.session.take();
            let accept = live.accept_task.take();
            let monitor = live.monitor_task.take();
            let sockets = std::mem::take(&mut *live.sockets.lock().unwrap());
            (session, accept, monitor, sockets)
        };
        if let Some(task) = accept {
            task.abort();
        }
        if let Some(task) = monitor {
            task.abort();
        }
        for (_, task) in sockets {
            task.abort();
        }
        if let Some(session) = session {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
    }

    /// Permanent shutdown: suppress reconnects and release everything.
    pub async fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let reconnect = self.live.lock().await.reconnect_task.take();
        if let Some(task) = reconnect {
            task.abort();
        }
        self.teardown_live().await;
        let mut state = self.state.lock().unwrap();
        state.status = TunnelStatus::Disconnected;
        state.local_port = None;
        state.connected_since = None;
        tracing::info!("SSH tunnel closed");
    }

    fn set_status(&self, status: TunnelStatus) {
        self.state.lock().unwrap().status = status;
    }
}

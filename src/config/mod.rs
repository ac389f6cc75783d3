use serde::{Deserialize, Serialize};

pub mod env;
#[cfg(test)]
mod tests;

/// Top-level configuration, parsed once at startup and shared immutably.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub transport: Transport,
    pub database: DatabaseConfig,
    pub ssh: Option<SshConfig>,
    pub limits: LimitsConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub user: String,
    pub password: String,
    /// Tri-state SSL switch: `Some(true)` force on, `Some(false)` force off,
    /// `None` auto-detect (off for localhost, on otherwise).
    pub ssl: Option<bool>,
    pub ssl_ca: Option<String>,
    pub ssl_reject_unauthorized: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: Option<String>,
    pub private_key_passphrase: Option<String>,
    pub password: Option<String>,
    pub strict_host_key: bool,
    pub trust_on_first_use: bool,
    pub known_hosts_path: String,
    pub keepalive_interval_ms: u64,
    /// `-1` retries forever.
    pub max_reconnect_attempts: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub read_only: bool,
    pub query_timeout_ms: u64,
    pub max_rows: usize,
    pub max_concurrent_queries: usize,
    pub pool_drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    OAuth,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub auth_mode: AuthMode,
    pub auth0_domain: Option<String>,
    pub auth0_audience: Option<String>,
    pub stateless: bool,
    pub server_pool_size: usize,
    pub session_ttl_minutes: u64,
    pub session_cleanup_interval_ms: u64,
    /// Empty, or containing `*`, means any origin is accepted.
    pub allowed_origins: Vec<String>,
    /// Empty means the Host header is not checked.
    pub allowed_hosts: Vec<String>,
    pub resource_documentation: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            database: DatabaseConfig::default(),
            ssh: None,
            limits: LimitsConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: None,
            user: "postgres".to_string(),
            password: String::new(),
            ssl: None,
            ssl_ca: None,
            ssl_reject_unauthorized: true,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            private_key_path: None,
            private_key_passphrase: None,
            password: None,
            strict_host_key: true,
            trust_on_first_use: true,
            known_hosts_path: env::default_known_hosts_path(),
            keepalive_interval_ms: 10_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            read_only: true,
            query_timeout_ms: 30_000,
            max_rows: 1000,
            max_concurrent_queries: 10,
            pool_drain_timeout_ms: 5000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            auth_mode: AuthMode::None,
            auth0_domain: None,
            auth0_audience: None,
            stateless: true,
            server_pool_size: 4,
            session_ttl_minutes: 30,
            session_cleanup_interval_ms: 300_000,
            allowed_origins: Vec::new(),
            allowed_hosts: Vec::new(),
            resource_documentation: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limits.max_rows == 0 {
            anyhow::bail!("Config error: MAX_ROWS must be at least 1");
        }
        if self.limits.max_concurrent_queries == 0 {
            anyhow::bail!("Config error: MAX_CONCURRENT_QUERIES must be at least 1");
        }
        if self.limits.query_timeout_ms < 100 {
            anyhow::bail!(
                "Config error: QUERY_TIMEOUT must be at least 100ms (got {}ms)",
                self.limits.query_timeout_ms
            );
        }

        if let Some(ssh) = &self.ssh {
            if ssh.host.is_empty() {
                anyhow::bail!("Config error: SSH_ENABLED is set but SSH_HOST is missing");
            }
            if ssh.user.is_empty() {
                anyhow::bail!("Config error: SSH_ENABLED is set but SSH_USER is missing");
            }
            if ssh.private_key_path.is_none() && ssh.password.is_none() {
                anyhow::bail!("Config error: SSH requires SSH_PRIVATE_KEY_PATH or SSH_PASSWORD");
            }
        }

        if self.http.auth_mode == AuthMode::OAuth {
            if self.http.auth0_domain.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("Config error: MCP_AUTH_MODE=oauth requires AUTH0_DOMAIN");
            }
            if self.http.auth0_audience.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("Config error: MCP_AUTH_MODE=oauth requires AUTH0_AUDIENCE");
            }
        }
        if self.transport == Transport::Http && self.http.server_pool_size == 0 {
            anyhow::bail!("Config error: MCP_SERVER_POOL_SIZE must be at least 1");
        }

        Ok(())
    }
}

//! Environment-variable parsing. All recognised variables are read exactly
//! once, here, and the resulting [`Config`] is immutable afterwards.

use super::{AuthMode, Config, DatabaseConfig, HttpConfig, LimitsConfig, SshConfig, Transport};
use anyhow::{bail, Context};

/// Parse the full configuration from the process environment.
pub fn load_config() -> anyhow::Result<Config> {
    let transport = match std::env::var("MCP_TRANSPORT").ok().as_deref() {
        None | Some("stdio") => Transport::Stdio,
        Some("http") => Transport::Http,
        Some(other) => bail!(
            "Config error: MCP_TRANSPORT must be 'stdio' or 'http', got '{}'",
            other
        ),
    };

    Ok(Config {
        transport,
        database: load_database_config()?,
        ssh: load_ssh_config()?,
        limits: load_limits_config()?,
        http: load_http_config()?,
    })
}

fn load_database_config() -> anyhow::Result<DatabaseConfig> {
    let mut db = DatabaseConfig::default();

    if let Ok(uri) = std::env::var("DATABASE_URI") {
        apply_database_uri(&mut db, &uri)?;
    }

    if let Ok(v) = std::env::var("DATABASE_HOST") {
        db.host = v;
    }
    if let Some(v) = parse_env("DATABASE_PORT")? {
        db.port = v;
    }
    if let Ok(v) = std::env::var("DATABASE_NAME") {
        db.name = Some(v);
    }
    if let Ok(v) = std::env::var("DATABASE_USER") {
        db.user = v;
    }
    if let Ok(v) = std::env::var("DATABASE_PASSWORD") {
        db.password = v;
    }
    if let Some(v) = parse_bool_env("DATABASE_SSL") {
        db.ssl = Some(v);
    }
    if let Ok(v) = std::env::var("DATABASE_SSL_CA") {
        db.ssl_ca = Some(expand_home(&v));
    }
    if let Some(v) = parse_bool_env("DATABASE_SSL_REJECT_UNAUTHORIZED") {
        db.ssl_reject_unauthorized = v;
    }

    Ok(db)
}

/// Parse a `postgres://` / `postgresql://` URI into the individual fields.
/// A `sslmode` query parameter is ignored with a warning: SSL is governed by
/// `DATABASE_SSL` and the auto-detection rule, not by the URI.
pub(crate) fn apply_database_uri(db: &mut DatabaseConfig, uri: &str) -> anyhow::Result<()> {
    let rest = uri
        .strip_prefix("postgresql://")
        .or_else(|| uri.strip_prefix("postgres://"))
        .with_context(|| {
            format!(
                "DATABASE_URI must start with postgresql:// or postgres://, got '{}'",
                crate::obfuscate::obfuscate(uri)
            )
        })?;

    let (rest, query) = match rest.split_once('?') {
        Some((r, q)) => (r, Some(q)),
        None => (rest, None),
    };
    if let Some(q) = query {
        if q.split('&').any(|kv| kv.starts_with("sslmode=")) {
            tracing::warn!(
                "DATABASE_URI contains sslmode; ignoring it (use DATABASE_SSL instead)"
            );
        }
    }

    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (rest, None),
    };
    if let Some(name) = path.filter(|p| !p.is_empty()) {
        db.name = Some(name.to_string());
    }

    let hostport = match authority.rsplit_once('@') {
        Some((userinfo, hostport)) => {
            match userinfo.split_once(':') {
                Some((user, pass)) => {
                    db.user = user.to_string();
                    db.password = pass.to_string();
                }
                None => db.user = userinfo.to_string(),
            }
            hostport
        }
        None => authority,
    };
    match hostport.rsplit_once(':') {
        Some((host, port)) => {
            db.host = host.to_string();
            db.port = port
                .parse()
                .with_context(|| format!("DATABASE_URI has an invalid port '{}'", port))?;
        }
        None if !hostport.is_empty() => db.host = hostport.to_string(),
        None => {}
    }
    Ok(())
}

fn load_ssh_config() -> anyhow::Result<Option<SshConfig>> {
    if !parse_bool_env("SSH_ENABLED").unwrap_or(false) {
        return Ok(None);
    }

    let mut ssh = SshConfig::default();
    if let Ok(v) = std::env::var("SSH_HOST") {
        ssh.host = v;
    }
    if let Some(v) = parse_env("SSH_PORT")? {
        ssh.port = v;
    }
    if let Ok(v) = std::env::var("SSH_USER") {
        ssh.user = v;
    }
    if let Ok(v) = std::env::var("SSH_PRIVATE_KEY_PATH") {
        ssh.private_key_path = Some(expand_home(&v));
    }
    if let Ok(v) = std::env::var("SSH_PRIVATE_KEY_PASSPHRASE") {
        ssh.private_key_passphrase = Some(v);
    }
    if let Ok(v) = std::env::var("SSH_PASSWORD") {
        ssh.password = Some(v);
    }
    if let Some(v) = parse_bool_env("SSH_STRICT_HOST_KEY") {
        ssh.strict_host_key = v;
    }
    if let Some(v) = parse_bool_env("SSH_TRUST_ON_FIRST_USE") {
        ssh.trust_on_first_use = v;
    }
    if let Ok(v) = std::env::var("SSH_KNOWN_HOSTS_PATH") {
        ssh.known_hosts_path = expand_home(&v);
    }
    if let Some(v) = parse_env("SSH_KEEPALIVE_INTERVAL")? {
        ssh.keepalive_interval_ms = v;
    }
    if let Some(v) = parse_env("SSH_MAX_RECONNECT_ATTEMPTS")? {
        ssh.max_reconnect_attempts = v;
    }
    Ok(Some(ssh))
}

fn load_limits_config() -> anyhow::Result<LimitsConfig> {
    let mut limits = LimitsConfig::default();
    if let Some(v) = parse_bool_env("READ_ONLY") {
        limits.read_only = v;
    }
    if let Some(v) = parse_env("QUERY_TIMEOUT")? {
        limits.query_timeout_ms = v;
    }
    if let Some(v) = parse_env("MAX_ROWS")? {
        limits.max_rows = v;
    }
    if let Some(v) = parse_env("MAX_CONCURRENT_QUERIES")? {
        limits.max_concurrent_queries = v;
    }
    if let Some(v) = parse_env("POOL_DRAIN_TIMEOUT_MS")? {
        limits.pool_drain_timeout_ms = v;
    }
    Ok(limits)
}

fn load_http_config() -> anyhow::Result<HttpConfig> {
    let mut http = HttpConfig::default();
    if let Some(v) = parse_env("PORT")? {
        http.port = v;
    }
    if let Ok(v) = std::env::var("MCP_HOST") {
        http.host = v;
    }
    http.auth_mode = match std::env::var("MCP_AUTH_MODE").ok().as_deref() {
        None | Some("none") => AuthMode::None,
        Some("oauth") => AuthMode::OAuth,
        Some(other) => bail!(
            "Config error: MCP_AUTH_MODE must be 'none' or 'oauth', got '{}'",
            other
        ),
    };
    if let Ok(v) = std::env::var("AUTH0_DOMAIN") {
        http.auth0_domain = Some(v);
    }
    if let Ok(v) = std::env::var("AUTH0_AUDIENCE") {
        http.auth0_audience = Some(v);
    }
    if let Some(v) = parse_bool_env("MCP_STATELESS") {
        http.stateless = v;
    }
    if let Some(v) = parse_env("MCP_SERVER_POOL_SIZE")? {
        http.server_pool_size = v;
    }
    if let Some(v) = parse_env("MCP_SESSION_TTL_MINUTES")? {
        http.session_ttl_minutes = v;
    }
    if let Some(v) = parse_env("MCP_SESSION_CLEANUP_INTERVAL_MS")? {
        http.session_cleanup_interval_ms = v;
    }
    if let Ok(v) = std::env::var("MCP_ALLOWED_ORIGINS") {
        http.allowed_origins = split_csv(&v);
    }
    if let Ok(v) = std::env::var("MCP_ALLOWED_HOSTS") {
        http.allowed_hosts = split_csv(&v);
    }
    if let Ok(v) = std::env::var("MCP_RESOURCE_DOCUMENTATION") {
        http.resource_documentation = Some(v);
    }
    Ok(http)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn parse_env<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => bail!("Config error: {} has an invalid value '{}'", key, raw),
        },
    }
}

/// `~/...` → `$HOME/...`. Paths without a leading tilde pass through.
pub(crate) fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}

pub(crate) fn default_known_hosts_path() -> String {
    expand_home("~/.ssh/known_hosts")
}

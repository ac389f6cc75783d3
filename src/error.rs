//! Error taxonomy shared across the crate.
//!
//! Tool handlers never surface these directly: every message destined for a
//! transport passes through [`crate::obfuscate::obfuscate`] first.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("Config error: {0}")]
    Config(String),

    /// SSH setup, host-key rejection, or reconnect exhaustion.
    #[error("SSH tunnel error: {0}")]
    Tunnel(String),

    /// SQL rejected by the safety validator. Never touches the database.
    #[error("{0}")]
    Validation(String),

    /// Database or driver error.
    #[error("{0}")]
    Query(String),

    /// No usable pool: init failed or a reconnect is in flight.
    #[error("{0}")]
    Pool(String),

    /// Missing or invalid bearer token.
    #[error("{0}")]
    Auth(String),

    /// Malformed request, missing session, wrong method.
    #[error("{0}")]
    Protocol(String),
}

impl ServerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServerError::Validation(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        ServerError::Query(msg.into())
    }

    pub fn pool(msg: impl Into<String>) -> Self {
        ServerError::Pool(msg.into())
    }

    pub fn tunnel(msg: impl Into<String>) -> Self {
        ServerError::Tunnel(msg.into())
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(e: sqlx::Error) -> Self {
        ServerError::Query(e.to_string())
    }
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

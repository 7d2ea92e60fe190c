// ── Proxy Atoms: Error Types ───────────────────────────────────────────────
// Single canonical error enum, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Network, Config…).
//   • `#[from]` wires std/external error conversions automatically.
//   • No variant carries key material in its message — keys are identified
//     by index everywhere in this crate, never by value.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML config parse failure.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Engine or proxy configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound authentication failure.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<String> for ProxyError {
    fn from(s: String) -> Self {
        ProxyError::Other(s)
    }
}

impl From<&str> for ProxyError {
    fn from(s: &str) -> Self {
        ProxyError::Other(s.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<ProxyError> for String {
    fn from(e: ProxyError) -> Self {
        e.to_string()
    }
}

use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the upstream movie API client.
///
/// Cloneable so a single failed request can be handed to every caller that
/// was waiting on it (see `query::QueryCache`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("upstream returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("not found")]
    NotFound,

    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The caller stopped waiting before the upstream answered.
    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http { status, .. } => StatusCode::from_u16(*status).ok(),
            ClientError::NotFound => Some(StatusCode::NOT_FOUND),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }
}

/// Durable favorites storage failed. Logged by the store, never returned to UI code.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize favorites: {0}")]
    Serialize(String),

    #[error("stored favorites are unreadable: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Configuration(err.to_string())
    }
}

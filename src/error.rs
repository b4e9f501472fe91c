//! Error taxonomy shared by every venue session and the router.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// Bad or expired credential. Never retried automatically.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Socket or stream dropped; retried by the owning session's backoff policy.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed or unexpected server frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("untranslatable symbol: {0}")]
    Symbol(String),

    /// A registered listener panicked while handling an event.
    #[error("listener failed: {0}")]
    Listener(String),

    #[error("no active venue session")]
    NotConnected,

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl FeedError {
    /// Whether the reconnect loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Network(_) | FeedError::Timeout(_) => true,
            FeedError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Maps a REST status code onto the taxonomy: 401/403 are credential problems.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => FeedError::Auth(format!("http {}: {}", status, body)),
            _ => FeedError::Http { status, body },
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FeedError::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return FeedError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return FeedError::Protocol(err.to_string());
        }
        FeedError::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                FeedError::from_status(status, "websocket upgrade rejected")
            }
            other => FeedError::Network(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Protocol(err.to_string())
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {surface} surface on {addr}: {source}")]
    Bind {
        surface: &'static str,
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

impl RelayError {
    pub fn invalid_setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }

    /// `true` for failures that only mean the peer went away politely.
    pub fn is_graceful_close(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(tungstenite::Error::ConnectionClosed)
                | Self::WebSocket(tungstenite::Error::AlreadyClosed)
        )
    }
}

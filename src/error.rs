use tokio_tungstenite::tungstenite;

/// Failures surfaced by the hub connection client.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Unable to connect to {url}: {source}")]
    CannotConnect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Authentication failed: {0}")]
    InvalidAuth(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Unexpected message from hub: {0}")]
    UnexpectedMessage(String),

    #[error("Failed to decode hub message: {0}")]
    Decode(#[from] serde_json::Error),

    /// A frame that was valid JSON but not a known message shape. `id` is
    /// kept so the command waiting on it can be failed.
    #[error("Malformed hub message: {source}")]
    Malformed {
        id: Option<u64>,
        #[source]
        source: serde_json::Error,
    },

    #[error("Command failed ({code}): {message}")]
    Command { code: String, message: String },
}

impl From<tungstenite::Error> for ConnectionError {
    fn from(err: tungstenite::Error) -> Self {
        Self::ConnectionLost(err.to_string())
    }
}

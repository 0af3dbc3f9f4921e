use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::ConnectionError;

pub type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WEBSOCKET_PATH: &str = "/api/websocket";

/// Long-lived token credentials for a hub.
#[derive(Clone)]
pub struct Auth {
    pub hass_url: String,
    pub access_token: String,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("hass_url", &self.hass_url)
            .finish_non_exhaustive()
    }
}

impl Auth {
    pub fn long_lived(hass_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            hass_url: hass_url.into(),
            access_token: access_token.into(),
        }
    }

    pub fn ws_url(&self) -> String {
        websocket_url(&self.hass_url)
    }
}

/// Maps a hub base url (`http://host:8123`) to its websocket endpoint
/// (`ws://host:8123/api/websocket`). Anything else passes through untouched.
pub fn websocket_url(hass_url: &str) -> String {
    let base = hass_url.trim_end_matches('/');
    let base = match base.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => base.to_string(),
    };
    if base.ends_with(WEBSOCKET_PATH) {
        base
    } else {
        format!("{base}{WEBSOCKET_PATH}")
    }
}

pub async fn connect_socket(url: &str) -> Result<HubSocket, ConnectionError> {
    let (socket, response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|source| ConnectionError::CannotConnect {
            url: url.to_string(),
            source,
        })?;
    tracing::debug!(url, status = %response.status(), "websocket connected");
    Ok(socket)
}

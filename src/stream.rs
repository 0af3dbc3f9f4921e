use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ConnectionError;
use crate::proto::HubMessage;

pub async fn send_json<S, T>(socket: &mut S, msg: &T) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    T: serde::Serialize,
{
    let text = serde_json::to_string(msg)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

/// Next JSON message from the hub, skipping control and binary frames.
/// `None` once the hub closes the socket.
pub async fn recv_json<S>(socket: &mut S) -> Option<Result<HubMessage, ConnectionError>>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = match socket.next().await? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e.into())),
        };
        match msg {
            Message::Text(text) => return Some(decode(&text)),
            Message::Close(frame) => {
                tracing::debug!(?frame, "hub closed websocket");
                return None;
            }
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

fn decode(text: &str) -> Result<HubMessage, ConnectionError> {
    let value: Value = serde_json::from_str(text)?;
    let id = value.get("id").and_then(Value::as_u64);
    serde_json::from_value(value).map_err(|source| ConnectionError::Malformed { id, source })
}

//! Authenticated websocket session with the hub.
//!
//! [`Connection::open`] performs the websocket and auth handshakes and then
//! hands the socket to a driver task. The driver owns the socket: it writes
//! commands queued by the handle and routes each incoming `result` or `event`
//! back to whoever issued the command with that id.

use std::collections::HashMap;

use futures::{Sink, Stream};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::net::{self, Auth, HubSocket};
use crate::proto::{AuthMessage, Command, CommandError, CommandFrame, HassEntity, HubMessage};
use crate::stream;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected(String),
}

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

enum Route {
    Result(Reply<Value>),
    /// Acked with the subscription id.
    Subscribe {
        ack: Reply<u64>,
        events: mpsc::UnboundedSender<Value>,
    },
    Events(mpsc::UnboundedSender<Value>),
    Unsubscribe {
        subscription: u64,
        reply: Reply<Value>,
    },
}

enum Request {
    Command { command: Command, route: Route },
    Close,
}

pub struct Connection {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    ha_version: Option<String>,
    driver: JoinHandle<()>,
}

impl Connection {
    /// Connects and authenticates. Does not retry.
    pub async fn open(auth: &Auth) -> Result<Self, ConnectionError> {
        let url = auth.ws_url();
        info!(%url, "connecting to hub");
        let mut socket = net::connect_socket(&url).await?;
        let ha_version = authenticate(&mut socket, &auth.access_token).await?;
        info!(
            ha_version = ha_version.as_deref().unwrap_or("unknown"),
            "authenticated with hub"
        );

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let driver = tokio::spawn(drive(socket, requests_rx, state_tx));

        Ok(Self {
            requests,
            state,
            ha_version,
            driver,
        })
    }

    pub fn ha_version(&self) -> Option<&str> {
        self.ha_version.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Resolves with the reason once the connection has dropped.
    pub async fn disconnected(&self) -> String {
        let mut state = self.state.clone();
        loop {
            if let ConnectionState::Disconnected(reason) = &*state.borrow_and_update() {
                return reason.clone();
            }
            if state.changed().await.is_err() {
                return "connection driver stopped".to_string();
            }
        }
    }

    pub async fn send_command(&self, command: Command) -> Result<Value, ConnectionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(command, Route::Result(reply))?;
        reply_rx.await.map_err(|_| self.lost())?
    }

    pub async fn get_states(&self) -> Result<Vec<HassEntity>, ConnectionError> {
        let states = self.send_command(Command::GetStates).await?;
        Ok(serde_json::from_value(states)?)
    }

    /// Subscribes to hub events, optionally narrowed to one event type.
    /// Returns once the hub has acknowledged the subscription.
    pub async fn subscribe_events(
        &self,
        event_type: Option<&str>,
    ) -> Result<Subscription<'_>, ConnectionError> {
        let (ack, ack_rx) = oneshot::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let command = Command::SubscribeEvents {
            event_type: event_type.map(str::to_owned),
        };
        self.request(
            command,
            Route::Subscribe {
                ack,
                events: events_tx,
            },
        )?;
        let id = ack_rx.await.map_err(|_| self.lost())??;
        debug!(id, ?event_type, "subscribed to events");
        Ok(Subscription {
            conn: self,
            id,
            events,
        })
    }

    /// Closes the socket and waits for the driver to finish.
    pub async fn close(self) {
        let _ = self.requests.send(Request::Close);
        if let Err(e) = self.driver.await {
            warn!(error = %e, "connection driver failed");
        }
    }

    /// Queues a command; the driver assigns its id as it goes on the wire.
    fn request(&self, command: Command, route: Route) -> Result<(), ConnectionError> {
        self.requests
            .send(Request::Command { command, route })
            .map_err(|_| self.lost())
    }

    pub(crate) fn lost(&self) -> ConnectionError {
        match self.state() {
            ConnectionState::Disconnected(reason) => ConnectionError::ConnectionLost(reason),
            ConnectionState::Connected => {
                ConnectionError::ConnectionLost("connection closed".to_string())
            }
        }
    }
}

/// Event stream for one `subscribe_events` command.
pub struct Subscription<'c> {
    conn: &'c Connection,
    id: u64,
    events: mpsc::UnboundedReceiver<Value>,
}

impl<'c> Subscription<'c> {
    /// Next event payload; `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.events.recv().await
    }

    pub async fn unsubscribe(self) -> Result<(), ConnectionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.conn.request(
            Command::UnsubscribeEvents {
                subscription: self.id,
            },
            Route::Unsubscribe {
                subscription: self.id,
                reply,
            },
        )?;
        reply_rx.await.map_err(|_| self.conn.lost())??;
        debug!(id = self.id, "unsubscribed from events");
        Ok(())
    }
}

async fn authenticate<S>(
    socket: &mut S,
    access_token: &str,
) -> Result<Option<String>, ConnectionError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    match next_message(socket).await? {
        HubMessage::AuthRequired { .. } => {}
        other => return Err(ConnectionError::UnexpectedMessage(format!("{other:?}"))),
    }

    stream::send_json(socket, &AuthMessage::Auth { access_token }).await?;

    match next_message(socket).await? {
        HubMessage::AuthOk { ha_version } => Ok(ha_version),
        HubMessage::AuthInvalid { message } => Err(ConnectionError::InvalidAuth(
            message.unwrap_or_else(|| "invalid access token".to_string()),
        )),
        other => Err(ConnectionError::UnexpectedMessage(format!("{other:?}"))),
    }
}

async fn next_message<S>(socket: &mut S) -> Result<HubMessage, ConnectionError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    stream::recv_json(socket).await.unwrap_or_else(|| {
        Err(ConnectionError::ConnectionLost(
            "hub closed the connection".to_string(),
        ))
    })
}

async fn drive(
    mut socket: HubSocket,
    mut requests: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<ConnectionState>,
) {
    let mut routes: HashMap<u64, Route> = HashMap::new();
    // the hub requires ids to increase in the order they are sent
    let mut next_id: u64 = 1;

    let reason = loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Request::Command { command, route }) => {
                    let id = next_id;
                    next_id += 1;
                    routes.insert(id, route);
                    let frame = CommandFrame { id, command: &command };
                    if let Err(e) = stream::send_json(&mut socket, &frame).await {
                        break e.to_string();
                    }
                }
                Some(Request::Close) | None => {
                    if let Err(e) = socket.close(None).await {
                        debug!(error = %e, "error closing websocket");
                    }
                    break "closed by client".to_string();
                }
            },
            incoming = stream::recv_json(&mut socket) => match incoming {
                Some(Ok(msg)) => dispatch(&mut routes, msg),
                Some(Err(ConnectionError::Decode(e))) => {
                    warn!(error = %e, "dropping undecodable hub message");
                }
                Some(Err(ConnectionError::Malformed { id, source })) => {
                    warn!(?id, error = %source, "dropping malformed hub message");
                    if let Some(id) = id {
                        fail_route(&mut routes, id, format!("malformed reply: {source}"));
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "hub closed the connection".to_string(),
            },
        }
    };

    info!(%reason, "disconnected from hub");
    state.send_replace(ConnectionState::Disconnected(reason));
    // pending commands fail and subscriptions end once their senders drop
    drop(routes);
}

fn dispatch(routes: &mut HashMap<u64, Route>, msg: HubMessage) {
    match msg {
        HubMessage::Result {
            id,
            success,
            result,
            error,
        } => {
            let Some(route) = routes.remove(&id) else {
                debug!(id, "result for unknown command");
                return;
            };
            let outcome = if success {
                Ok(result)
            } else {
                let error = error.unwrap_or_else(|| CommandError {
                    code: "unknown_error".to_string(),
                    message: "command failed".to_string(),
                });
                Err(ConnectionError::Command {
                    code: error.code,
                    message: error.message,
                })
            };
            match route {
                Route::Result(reply) => {
                    let _ = reply.send(outcome);
                }
                Route::Subscribe { ack, events } => {
                    let subscribed = outcome.is_ok();
                    if ack.send(outcome.map(|_| id)).is_ok() && subscribed {
                        routes.insert(id, Route::Events(events));
                    }
                }
                Route::Unsubscribe {
                    subscription,
                    reply,
                } => {
                    if outcome.is_ok() {
                        routes.remove(&subscription);
                    }
                    let _ = reply.send(outcome);
                }
                Route::Events(events) => {
                    debug!(id, "unexpected result for active subscription");
                    routes.insert(id, Route::Events(events));
                }
            }
        }
        HubMessage::Event { id, event } => match routes.get(&id) {
            Some(Route::Events(events)) => {
                if events.send(event).is_err() {
                    debug!(id, "subscription dropped, discarding events");
                    routes.remove(&id);
                }
            }
            _ => debug!(id, "event for unknown subscription"),
        },
        other => debug!(?other, "ignoring hub message"),
    }
}

/// Fails a pending command whose reply could not be read. Event routes stay.
fn fail_route(routes: &mut HashMap<u64, Route>, id: u64, reason: String) {
    let err = || ConnectionError::UnexpectedMessage(reason.clone());
    match routes.remove(&id) {
        Some(Route::Result(reply)) | Some(Route::Unsubscribe { reply, .. }) => {
            let _ = reply.send(Err(err()));
        }
        Some(Route::Subscribe { ack, .. }) => {
            let _ = ack.send(Err(err()));
        }
        Some(Route::Events(events)) => {
            routes.insert(id, Route::Events(events));
        }
        None => debug!(id, "malformed message for unknown id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(id: u64, success: bool) -> HubMessage {
        let error = if success {
            Value::Null
        } else {
            json!({"code": "not_found", "message": "nope"})
        };
        serde_json::from_value(json!({
            "id": id,
            "type": "result",
            "success": success,
            "result": {"ok": success},
            "error": error,
        }))
        .unwrap()
    }

    fn event(id: u64, n: u64) -> HubMessage {
        serde_json::from_value(json!({"id": id, "type": "event", "event": {"n": n}})).unwrap()
    }

    #[test]
    fn results_reach_the_issuing_command() {
        let mut routes = HashMap::new();
        let (reply, mut reply_rx) = oneshot::channel();
        routes.insert(3, Route::Result(reply));

        dispatch(&mut routes, result(3, true));

        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), json!({"ok": true}));
        assert!(routes.is_empty());
    }

    #[test]
    fn failed_results_become_command_errors() {
        let mut routes = HashMap::new();
        let (reply, mut reply_rx) = oneshot::channel();
        routes.insert(5, Route::Result(reply));

        dispatch(&mut routes, result(5, false));

        match reply_rx.try_recv().unwrap() {
            Err(ConnectionError::Command { code, .. }) => assert_eq!(code, "not_found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn acknowledged_subscription_receives_events() {
        let mut routes = HashMap::new();
        let (ack, mut ack_rx) = oneshot::channel();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        routes.insert(
            1,
            Route::Subscribe {
                ack,
                events: events_tx,
            },
        );

        dispatch(&mut routes, result(1, true));
        assert_eq!(ack_rx.try_recv().unwrap().unwrap(), 1);

        dispatch(&mut routes, event(1, 10));
        dispatch(&mut routes, event(2, 20));
        dispatch(&mut routes, event(1, 11));

        assert_eq!(events.try_recv().unwrap(), json!({"n": 10}));
        assert_eq!(events.try_recv().unwrap(), json!({"n": 11}));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn rejected_subscription_is_not_routed() {
        let mut routes = HashMap::new();
        let (ack, mut ack_rx) = oneshot::channel();
        let (events_tx, _events) = mpsc::unbounded_channel();
        routes.insert(
            4,
            Route::Subscribe {
                ack,
                events: events_tx,
            },
        );

        dispatch(&mut routes, result(4, false));

        assert!(ack_rx.try_recv().unwrap().is_err());
        assert!(routes.is_empty());
    }

    #[test]
    fn dropped_subscriber_is_forgotten() {
        let mut routes = HashMap::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        routes.insert(9, Route::Events(events_tx));
        drop(events);

        dispatch(&mut routes, event(9, 1));

        assert!(routes.is_empty());
    }

    #[test]
    fn acknowledged_unsubscribe_drops_the_event_route() {
        let mut routes = HashMap::new();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (reply, mut reply_rx) = oneshot::channel();
        routes.insert(2, Route::Events(events_tx));
        routes.insert(
            6,
            Route::Unsubscribe {
                subscription: 2,
                reply,
            },
        );

        dispatch(&mut routes, result(6, true));

        assert!(reply_rx.try_recv().unwrap().is_ok());
        assert!(routes.is_empty());
        assert!(events.try_recv().is_err());
        dispatch(&mut routes, event(2, 1));
        assert!(routes.is_empty());
    }

    #[test]
    fn rejected_unsubscribe_keeps_the_event_route() {
        let mut routes = HashMap::new();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (reply, mut reply_rx) = oneshot::channel();
        routes.insert(2, Route::Events(events_tx));
        routes.insert(
            6,
            Route::Unsubscribe {
                subscription: 2,
                reply,
            },
        );

        dispatch(&mut routes, result(6, false));

        assert!(reply_rx.try_recv().unwrap().is_err());
        assert!(matches!(routes.get(&2), Some(Route::Events(_))));
    }

    #[test]
    fn unreadable_reply_fails_its_command() {
        let mut routes = HashMap::new();
        let (reply, mut reply_rx) = oneshot::channel();
        let (events_tx, _events) = mpsc::unbounded_channel();
        routes.insert(3, Route::Result(reply));
        routes.insert(4, Route::Events(events_tx));

        fail_route(&mut routes, 3, "bad".to_string());
        fail_route(&mut routes, 4, "bad".to_string());

        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(ConnectionError::UnexpectedMessage(_))
        ));
        assert!(matches!(routes.get(&4), Some(Route::Events(_))));
    }
}

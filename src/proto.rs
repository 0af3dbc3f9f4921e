use std::collections::HashMap;

use serde_json::{Map, Value};

/// Messages pushed by the hub over the websocket.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<CommandError>,
    },
    Event {
        id: u64,
        event: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMessage<'a> {
    Auth { access_token: &'a str },
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    GetStates,
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    UnsubscribeEvents {
        subscription: u64,
    },
}

#[derive(Debug, serde::Serialize)]
pub struct CommandFrame<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub command: &'a Command,
}

/// A single entity as reported by `get_states` and `state_changed`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HassEntity {
    pub entity_id: String,
    pub state: String,
    /// Attributes, timestamps, context and whatever else the hub sends,
    /// carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Entity id to entity state.
pub type HassEntities = HashMap<String, HassEntity>;

pub const STATE_CHANGED: &str = "state_changed";

#[derive(Clone, Debug, serde::Deserialize)]
pub struct StateChangedEvent {
    pub event_type: String,
    pub data: StateChangedData,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub new_state: Option<HassEntity>,
}

use tracing::{debug, warn};

use crate::connection::{Connection, Subscription};
use crate::error::ConnectionError;
use crate::proto::{HassEntities, StateChangedData, StateChangedEvent, STATE_CHANGED};

/// Live view of every entity on the hub.
///
/// Seeded from `get_states` and kept current from `state_changed` events.
/// Each call to [`EntitySubscription::next`] yields the full collection: first
/// the initial load, then once per change.
pub struct EntitySubscription<'c> {
    events: Subscription<'c>,
    entities: HassEntities,
    initial_pending: bool,
}

pub async fn subscribe_entities(
    conn: &Connection,
) -> Result<EntitySubscription<'_>, ConnectionError> {
    // subscribe first so no change between the two commands is missed
    let events = conn.subscribe_events(Some(STATE_CHANGED)).await?;
    let states = conn.get_states().await?;
    debug!(count = states.len(), "loaded initial entity states");

    let entities = states
        .into_iter()
        .map(|entity| (entity.entity_id.clone(), entity))
        .collect();

    Ok(EntitySubscription {
        events,
        entities,
        initial_pending: true,
    })
}

impl<'c> EntitySubscription<'c> {
    pub async fn next(&mut self) -> Option<&HassEntities> {
        if std::mem::take(&mut self.initial_pending) {
            return Some(&self.entities);
        }
        loop {
            let event = self.events.next().await?;
            match serde_json::from_value::<StateChangedEvent>(event) {
                Ok(event) if event.event_type == STATE_CHANGED => {
                    apply_state_change(&mut self.entities, event.data);
                    return Some(&self.entities);
                }
                Ok(event) => debug!(event_type = %event.event_type, "ignoring event"),
                Err(e) => warn!(error = %e, "skipping malformed state_changed event"),
            }
        }
    }

    pub fn entities(&self) -> &HassEntities {
        &self.entities
    }

    pub async fn unsubscribe(self) -> Result<(), ConnectionError> {
        self.events.unsubscribe().await
    }
}

pub fn apply_state_change(entities: &mut HassEntities, change: StateChangedData) {
    match change.new_state {
        Some(state) => {
            entities.insert(change.entity_id, state);
        }
        None => {
            entities.remove(&change.entity_id);
        }
    }
}

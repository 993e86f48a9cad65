//! Entity state storage with domain indexing for Open Peer Power
//!
//! The StateStore holds the current state of every entity, maintains a
//! domain index for efficient queries, and fires `state_changed` /
//! `state_reported` events on the event bus.
//!
//! Single-writer discipline is the callers' contract (each entity writes
//! only its own key from the event loop); the store itself guarantees
//! per-key atomicity through its concurrent map.

use dashmap::DashMap;
use opp_core::events::{StateChangedData, StateReportedData};
use opp_core::{Context, EntityId, State};
use opp_event_bus::EventBus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// The state store tracks all entity states.
pub struct StateStore {
    /// All entity states keyed by entity_id string
    states: DashMap<String, State>,
    /// Index of entity_ids by domain
    domain_index: DashMap<String, Vec<String>>,
    /// Event bus for firing state change events
    event_bus: Arc<EventBus>,
}

impl StateStore {
    /// Create a new state store with the given event bus
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    /// Write the state of an entity.
    ///
    /// When the value and attributes are unchanged and `force_update` is
    /// false, only `last_reported` advances and a `state_reported` event
    /// fires; no `state_changed` event is produced. Every other write
    /// replaces the record and fires `state_changed` (with `last_changed`
    /// preserved for equal values).
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        force_update: bool,
        context: Context,
    ) -> State {
        let entity_id_str = entity_id.to_string();
        let domain = entity_id.domain().to_string();
        let state = state.into();

        let old_state = self.states.get(&entity_id_str).map(|s| s.clone());

        if let Some(existing) = &old_state {
            let unchanged = existing.state == state && existing.attributes == attributes;
            if unchanged && !force_update {
                // Same value re-reported: advance last_reported only
                let mut reported = existing.clone();
                let old_last_reported = reported.last_reported;
                reported.last_reported = Some(chrono::Utc::now());
                self.states.insert(entity_id_str, reported.clone());

                trace!(state = %reported.state, "State re-reported without change");
                self.event_bus.fire_typed(
                    StateReportedData {
                        entity_id,
                        new_state: reported.clone(),
                        old_last_reported,
                        last_reported: reported.last_reported.unwrap_or_else(chrono::Utc::now),
                    },
                    context,
                );
                return reported;
            }
        }

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(entity_id_str.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(domain)
                .or_default()
                .push(entity_id_str);
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        new_state
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value as a string, or None if the entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    /// Get all entity IDs for a domain
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Get all states for a domain
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Get all entity IDs
    pub fn all_entity_ids(&self) -> Vec<String> {
        self.states.iter().map(|r| r.key().clone()).collect()
    }

    /// Get all states
    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    /// Remove an entity's state.
    ///
    /// Fires a `state_changed` event with `new_state: None`.
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let entity_id_str = entity_id.to_string();
        let domain = entity_id.domain();

        let old_state = self.states.remove(&entity_id_str).map(|(_, s)| s);

        if let Some(ref state) = old_state {
            trace!("Removing entity state");

            if let Some(mut ids) = self.domain_index.get_mut(domain) {
                ids.retain(|id| id != &entity_id_str);
            }

            self.event_bus.fire_typed(
                StateChangedData {
                    entity_id: entity_id.clone(),
                    old_state: Some(state.clone()),
                    new_state: None,
                },
                context,
            );
        }

        old_state
    }

    /// Total number of entities with a state
    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use opp_core::events::StateChangedData;
    use serde_json::json;

    fn make_store() -> (Arc<EventBus>, StateStore) {
        let bus = Arc::new(EventBus::new());
        let store = StateStore::new(bus.clone());
        (bus, store)
    }

    #[test]
    fn test_set_and_get() {
        let (_, store) = make_store();
        let entity_id: EntityId = "light.living_room".parse().unwrap();
        let attrs = HashMap::from([("brightness".to_string(), json!(255))]);

        let state = store.set(entity_id, "on", attrs.clone(), false, Context::new());
        assert_eq!(state.state, "on");
        assert_eq!(state.attributes, attrs);

        assert_eq!(store.get_state("light.living_room").as_deref(), Some("on"));
    }

    #[tokio::test]
    async fn test_identical_write_fires_single_state_changed() {
        let (bus, store) = make_store();
        let mut rx = bus.subscribe_typed::<StateChangedData>();
        let entity_id: EntityId = "switch.pump".parse().unwrap();

        store.set(entity_id.clone(), "ON", HashMap::new(), false, Context::new());
        store.set(entity_id.clone(), "ON", HashMap::new(), false, Context::new());

        // Exactly one state_changed for two identical writes
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_update_fires_per_write() {
        let (bus, store) = make_store();
        let mut rx = bus.subscribe_typed::<StateChangedData>();
        let entity_id: EntityId = "switch.pump".parse().unwrap();

        store.set(entity_id.clone(), "ON", HashMap::new(), true, Context::new());
        store.set(entity_id.clone(), "ON", HashMap::new(), true, Context::new());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unchanged_write_fires_state_reported() {
        let (bus, store) = make_store();
        let mut rx = bus.subscribe_typed::<opp_core::events::StateReportedData>();
        let entity_id: EntityId = "sensor.temp".parse().unwrap();

        store.set(entity_id.clone(), "20", HashMap::new(), false, Context::new());
        store.set(entity_id.clone(), "20", HashMap::new(), false, Context::new());

        let reported = rx.try_recv().unwrap();
        assert_eq!(reported.data.entity_id, entity_id);
    }

    #[test]
    fn test_attribute_change_is_a_change() {
        let (bus, store) = make_store();
        let mut rx = bus.subscribe_typed::<StateChangedData>();
        let entity_id: EntityId = "sensor.temp".parse().unwrap();

        store.set(entity_id.clone(), "20", HashMap::new(), false, Context::new());
        store.set(
            entity_id,
            "20",
            HashMap::from([("battery".to_string(), json!(71))]),
            false,
            Context::new(),
        );

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_remove() {
        let (bus, store) = make_store();
        let entity_id: EntityId = "light.test".parse().unwrap();
        store.set(entity_id.clone(), "on", HashMap::new(), false, Context::new());

        let mut rx = bus.subscribe_typed::<StateChangedData>();
        let removed = store.remove(&entity_id, Context::new()).unwrap();
        assert_eq!(removed.state, "on");
        assert!(store.get("light.test").is_none());
        assert!(store.entity_ids("light").is_empty());

        let event = rx.try_recv().unwrap();
        assert!(event.data.new_state.is_none());
    }

    #[test]
    fn test_domain_index() {
        let (_, store) = make_store();
        store.set("light.a".parse().unwrap(), "on", HashMap::new(), false, Context::new());
        store.set("light.b".parse().unwrap(), "off", HashMap::new(), false, Context::new());
        store.set("switch.c".parse().unwrap(), "on", HashMap::new(), false, Context::new());

        assert_eq!(store.entity_ids("light").len(), 2);
        assert_eq!(store.entity_ids("switch").len(), 1);
        assert_eq!(store.entity_count(), 3);
    }
}

//! State types: the published `State` record and the typed `StateValue`
//! an entity reports before stringification.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::units::round_precision;
use crate::{Context, EntityId, MAX_STATE_LENGTH, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// A typed state value as reported by an entity, before it is rendered
/// into the string form the state store holds.
///
/// Floats are rounded to [`crate::units::FLOAT_PRECISION`] decimals when
/// rendered so that representation noise never shows up as a state change.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Str(String),
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl StateValue {
    /// Render into the canonical state string.
    ///
    /// Values exceeding [`MAX_STATE_LENGTH`] collapse to `unknown` with a
    /// warning, matching the store's length contract.
    pub fn render(&self) -> String {
        let rendered = match self {
            StateValue::Str(s) => s.clone(),
            StateValue::Float(f) => format_float(*f),
            StateValue::Int(i) => i.to_string(),
            StateValue::Bool(b) => b.to_string(),
        };
        if rendered.len() > MAX_STATE_LENGTH {
            warn!(
                length = rendered.len(),
                "State value exceeds maximum length, reporting unknown"
            );
            return STATE_UNKNOWN.to_string();
        }
        rendered
    }
}

fn format_float(f: f64) -> String {
    format!("{}", round_precision(f))
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::Str(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::Str(s)
    }
}

impl From<f64> for StateValue {
    fn from(f: f64) -> Self {
        StateValue::Float(f)
    }
}

impl From<i64> for StateValue {
    fn from(i: i64) -> Self {
        StateValue::Int(i)
    }
}

/// The state of an entity at a point in time.
///
/// Holds the rendered state string, the attribute mapping, and the
/// change/update/report timestamps the consumers rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g. "on", "21.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even if the value was unchanged
    pub last_updated: DateTime<Utc>,

    /// When the state was last reported by the integration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reported: Option<DateTime<Utc>>,

    /// Context of the write that produced this state
    pub context: Context,
}

impl State {
    /// Create a new state with current timestamps
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            last_reported: Some(now),
            context,
        }
    }

    /// Create an updated state, preserving `last_changed` when the value
    /// is unchanged.
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let new_state = new_state.into();
        let changed = self.state != new_state;

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed: if changed { now } else { self.last_changed },
            last_updated: now,
            last_reported: Some(now),
            context,
        }
    }

    /// Whether this record marks the entity unreachable
    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    /// Whether the value is not known
    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Deserialize an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are deliberately not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_value_render() {
        assert_eq!(StateValue::Str("on".into()).render(), "on");
        assert_eq!(StateValue::Int(42).render(), "42");
        assert_eq!(StateValue::Bool(true).render(), "true");
        assert_eq!(StateValue::Float(21.5).render(), "21.5");
    }

    #[test]
    fn test_state_value_float_precision() {
        // 0.1 + 0.2 must not leak representation noise into the state string
        assert_eq!(StateValue::Float(0.1 + 0.2).render(), "0.3");
    }

    #[test]
    fn test_overlong_state_becomes_unknown() {
        let long = "x".repeat(MAX_STATE_LENGTH + 1);
        assert_eq!(StateValue::Str(long).render(), STATE_UNKNOWN);
    }

    #[test]
    fn test_with_update_preserves_last_changed() {
        let id: EntityId = "sensor.temp".parse().unwrap();
        let first = State::new(id, "20", HashMap::new(), Context::new());
        let second = first.with_update("20", HashMap::new(), Context::new());
        assert_eq!(first.last_changed, second.last_changed);

        let third = second.with_update("21", HashMap::new(), Context::new());
        assert!(third.last_changed >= second.last_changed);
        assert_ne!(third.state, second.state);
    }

    #[test]
    fn test_unavailable_flag() {
        let id: EntityId = "sensor.temp".parse().unwrap();
        let state = State::new(id, STATE_UNAVAILABLE, HashMap::new(), Context::new());
        assert!(state.is_unavailable());
        assert!(!state.is_unknown());
    }
}

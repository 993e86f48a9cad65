//! Core types for Open Peer Power
//!
//! This crate provides the fundamental types used throughout the Open Peer
//! Power Rust implementation: EntityId, State, Event, Context, the shared
//! error taxonomy, and the unit system.

mod context;
mod entity_id;
mod error;
mod event;
mod state;
pub mod units;
mod util;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use error::OppError;
pub use event::{Event, EventData, EventOrigin, EventType};
pub use state::{State, StateValue};
pub use util::slugify;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State value for an entity that exists but cannot be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value for an entity whose value is not (yet) known
pub const STATE_UNKNOWN: &str = "unknown";

/// Attribute marking a state record as restored rather than live
pub const ATTR_RESTORED: &str = "restored";

/// Attribute key for the display unit
pub const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";

/// Attribute key for the friendly name
pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";

/// Attribute key for the icon
pub const ATTR_ICON: &str = "icon";

/// Attribute key for the device class
pub const ATTR_DEVICE_CLASS: &str = "device_class";

/// Attribute key for the supported-features bitmask
pub const ATTR_SUPPORTED_FEATURES: &str = "supported_features";

/// Attribute key for the assumed-state flag
pub const ATTR_ASSUMED_STATE: &str = "assumed_state";

/// Standard event types used by Open Peer Power
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for state reported (unchanged state was written)
    pub const STATE_REPORTED: &str = "state_reported";

    /// Event type for Open Peer Power start
    pub const OPENPEERPOWER_START: &str = "openpeerpower_start";

    /// Event type for Open Peer Power stop
    pub const OPENPEERPOWER_STOP: &str = "openpeerpower_stop";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for STATE_REPORTED events (when state is unchanged but reported)
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateReportedData {
        pub entity_id: EntityId,
        pub new_state: State,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub old_last_reported: Option<chrono::DateTime<chrono::Utc>>,
        pub last_reported: chrono::DateTime<chrono::Utc>,
    }

    impl EventData for StateReportedData {
        fn event_type() -> &'static str {
            STATE_REPORTED
        }
    }
}

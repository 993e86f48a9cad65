//! The `Entity` trait: what a platform implements per managed device.
//!
//! Presentation getters are all defaulted so a minimal entity only
//! implements `state()`. Lifecycle hooks receive the owning cell so they
//! can register teardown callbacks and trigger writes later.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opp_core::{OppError, StateValue};
use opp_registries::DeviceInfo;
use serde_json::Value;

use crate::cell::EntityCell;

/// How an entity's state gets refreshed.
///
/// `PushOnly` entities write state when their source pushes data to them;
/// `Polled` entities are asked to refresh on the platform's scan interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    PushOnly,
    Polled,
}

/// A single managed entity.
#[async_trait]
pub trait Entity: Send + Sync {
    /// Stable identifier within (domain, platform), used for registry
    /// correlation across restarts
    fn unique_id(&self) -> Option<String> {
        None
    }

    /// Friendly display name
    fn name(&self) -> Option<String> {
        None
    }

    /// Preferred object_id when generating an entity_id
    fn suggested_object_id(&self) -> Option<String> {
        None
    }

    /// Icon identifier (e.g. "mdi:thermometer")
    fn icon(&self) -> Option<String> {
        None
    }

    /// Device class (e.g. "temperature")
    fn device_class(&self) -> Option<String> {
        None
    }

    /// Unit the state value is expressed in
    fn unit_of_measurement(&self) -> Option<String> {
        None
    }

    /// Bitmask of supported features
    fn supported_features(&self) -> u32 {
        0
    }

    /// Whether the state is assumed rather than confirmed by the device
    fn assumed_state(&self) -> bool {
        false
    }

    /// Whether the entity can currently be reached
    fn available(&self) -> bool {
        true
    }

    /// Force a state_changed event even when the written state is
    /// identical to the previous one
    fn force_update(&self) -> bool {
        false
    }

    /// Description of the physical device this entity belongs to
    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }

    /// Attributes derived from the entity's capabilities, set once
    fn capability_attributes(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// Attributes derived from the current state
    fn state_attributes(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// Platform-specific extra attributes, merged last
    fn extra_state_attributes(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// The current state value; None publishes as `unknown`
    fn state(&self) -> Option<StateValue> {
        None
    }

    /// Whether this entity is polled or push-only
    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::PushOnly
    }

    /// Refresh state from the device. Only called for `Polled` entities
    /// and from explicit forced refreshes.
    async fn async_update(&self) -> Result<(), OppError> {
        Ok(())
    }

    /// Called after the entity is attached to the running instance but
    /// before the first state write. Subscribe to sources here and register
    /// teardown through [`EntityCell::async_on_remove`].
    async fn async_added_to_opp(&self, _cell: &Arc<EntityCell>) {}

    /// Called when the entity is about to be removed
    async fn async_will_remove_from_opp(&self) {}
}

//! Configurable mock entity for lifecycle and platform tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opp_core::{OppError, StateValue};
use opp_entity::{Entity, EntityCell, UpdatePolicy};
use serde_json::Value;

/// A mock entity with settable state and instrumented updates
pub struct MockEntity {
    unique_id: Option<String>,
    name: Option<String>,
    unit_of_measurement: Option<String>,
    device_class: Option<String>,
    force_update: bool,
    update_policy: UpdatePolicy,
    update_delay: Option<Duration>,
    /// When set, each update writes its sequence number as the state
    state_from_updates: bool,

    state: Mutex<Option<StateValue>>,
    extra_attributes: Mutex<HashMap<String, Value>>,
    available: AtomicBool,
    update_fails: AtomicBool,
    update_calls: AtomicUsize,
    /// Shared (in-flight, high-water) counters for concurrency assertions
    concurrency: Option<(Arc<AtomicUsize>, Arc<AtomicUsize>)>,
}

impl MockEntity {
    pub fn new() -> Self {
        Self {
            unique_id: None,
            name: None,
            unit_of_measurement: None,
            device_class: None,
            force_update: false,
            update_policy: UpdatePolicy::PushOnly,
            update_delay: None,
            state_from_updates: false,
            state: Mutex::new(None),
            extra_attributes: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            update_fails: AtomicBool::new(false),
            update_calls: AtomicUsize::new(0),
            concurrency: None,
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_state(self, state: impl Into<StateValue>) -> Self {
        *self.state.lock().unwrap() = Some(state.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn with_force_update(mut self) -> Self {
        self.force_update = true;
        self
    }

    pub fn polled(mut self) -> Self {
        self.update_policy = UpdatePolicy::Polled;
        self.state_from_updates = true;
        self
    }

    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = Some(delay);
        self
    }

    /// Track in-flight updates in shared counters: `current` holds the
    /// number running right now, `max` the high-water mark
    pub fn with_concurrency_gauge(
        mut self,
        current: Arc<AtomicUsize>,
        max: Arc<AtomicUsize>,
    ) -> Self {
        self.concurrency = Some((current, max));
        self
    }

    pub fn with_attribute(self, key: impl Into<String>, value: Value) -> Self {
        self.extra_attributes.lock().unwrap().insert(key.into(), value);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_state(&self, state: impl Into<StateValue>) {
        *self.state.lock().unwrap() = Some(state.into());
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_update_fails(&self, fails: bool) {
        self.update_fails.store(fails, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEntity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Entity for MockEntity {
    fn unique_id(&self) -> Option<String> {
        self.unique_id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn unit_of_measurement(&self) -> Option<String> {
        self.unit_of_measurement.clone()
    }

    fn device_class(&self) -> Option<String> {
        self.device_class.clone()
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn force_update(&self) -> bool {
        self.force_update
    }

    fn extra_state_attributes(&self) -> HashMap<String, Value> {
        self.extra_attributes.lock().unwrap().clone()
    }

    fn state(&self) -> Option<StateValue> {
        self.state.lock().unwrap().clone()
    }

    fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    async fn async_update(&self) -> Result<(), OppError> {
        let count = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((current, max)) = &self.concurrency {
            let in_flight = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(in_flight, Ordering::SeqCst);
        }

        if let Some(delay) = self.update_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((current, _)) = &self.concurrency {
            current.fetch_sub(1, Ordering::SeqCst);
        }

        if self.update_fails.load(Ordering::SeqCst) {
            return Err(OppError::Update("mock device unreachable".to_string()));
        }

        if self.state_from_updates {
            self.set_state(count as i64);
        }
        Ok(())
    }

    async fn async_added_to_opp(&self, _cell: &Arc<EntityCell>) {}
}

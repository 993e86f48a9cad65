//! The per-entity lifecycle cell
//!
//! An `EntityCell` owns everything the core tracks about one managed
//! entity: the lifecycle stage, the back-reference to the running instance,
//! the registry entry, teardown callbacks, and the single-flight update
//! guard. Entities themselves stay passive; all writes to the state store
//! go through the cell.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opp_core::units::{convert_temperature_str, TemperatureUnit};
use opp_core::{
    Context, EntityId, OppError, ATTR_ASSUMED_STATE, ATTR_DEVICE_CLASS, ATTR_FRIENDLY_NAME,
    ATTR_ICON, ATTR_RESTORED, ATTR_SUPPORTED_FEATURES, ATTR_UNIT_OF_MEASUREMENT,
    STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use opp_registries::EntityEntry;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::entity::Entity;
use crate::opp::OpenPeerPower;

/// How long a device refresh may run before a warning is logged.
///
/// The refresh is still awaited to completion after the warning; slow
/// devices are reported, never cancelled.
pub const SLOW_UPDATE_WARNING: Duration = Duration::from_secs(10);

/// Lifecycle stage of a managed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    /// Created, not yet handed to a platform
    Uninitialized,
    /// `add_to_platform_start` ran; hooks and first write pending
    Adding,
    /// Fully added; state writes flow
    Added,
    /// Removal in progress
    Removing,
    /// Removed; the cell is spent
    Removed,
}

struct CellInner {
    stage: LifecycleStage,
    opp: Option<Arc<OpenPeerPower>>,
    entity_id: Option<EntityId>,
    registry_entry: Option<Arc<EntityEntry>>,
    parallel_updates: Option<Arc<Semaphore>>,
}

impl CellInner {
    fn cleared() -> Self {
        Self {
            stage: LifecycleStage::Uninitialized,
            opp: None,
            entity_id: None,
            registry_entry: None,
            parallel_updates: None,
        }
    }
}

type RemoveCallback = Box<dyn FnOnce() + Send>;

/// The lifecycle cell for one entity
pub struct EntityCell {
    entity: Arc<dyn Entity>,
    platform_name: String,
    inner: Mutex<CellInner>,
    /// Teardown callbacks, drained LIFO on removal
    on_remove: Mutex<Vec<RemoveCallback>>,
    /// Single-flight guard for device refreshes
    update_staged: AtomicBool,
}

impl EntityCell {
    /// Create a cell for an entity managed by the named platform
    pub fn new(entity: Arc<dyn Entity>, platform_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            entity,
            platform_name: platform_name.into(),
            inner: Mutex::new(CellInner::cleared()),
            on_remove: Mutex::new(Vec::new()),
            update_staged: AtomicBool::new(false),
        })
    }

    /// The entity this cell manages
    pub fn entity(&self) -> &Arc<dyn Entity> {
        &self.entity
    }

    /// The platform that owns this cell
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// Current lifecycle stage
    pub fn stage(&self) -> LifecycleStage {
        self.inner
            .lock()
            .map(|i| i.stage)
            .unwrap_or(LifecycleStage::Uninitialized)
    }

    /// Assigned entity_id, if the cell has been attached
    pub fn entity_id(&self) -> Option<EntityId> {
        self.inner.lock().ok().and_then(|i| i.entity_id.clone())
    }

    /// The registry entry, if the entity is registered
    pub fn registry_entry(&self) -> Option<Arc<EntityEntry>> {
        self.inner.lock().ok().and_then(|i| i.registry_entry.clone())
    }

    fn entity_label(&self) -> String {
        self.entity
            .name()
            .or_else(|| self.entity.unique_id())
            .unwrap_or_else(|| format!("<{}>", self.platform_name))
    }

    /// Attach the cell to the running instance.
    ///
    /// Fails with `AlreadyAdded` when the cell is already attached and has
    /// not been aborted or removed in between.
    pub fn add_to_platform_start(
        &self,
        opp: Arc<OpenPeerPower>,
        entity_id: EntityId,
        registry_entry: Option<Arc<EntityEntry>>,
        parallel_updates: Option<Arc<Semaphore>>,
    ) -> Result<(), OppError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| OppError::Platform("entity cell lock poisoned".to_string()))?;

        match inner.stage {
            LifecycleStage::Uninitialized | LifecycleStage::Removed => {}
            _ => {
                return Err(OppError::AlreadyAdded {
                    entity_id: entity_id.to_string(),
                })
            }
        }

        inner.stage = LifecycleStage::Adding;
        inner.opp = Some(opp);
        inner.entity_id = Some(entity_id);
        inner.registry_entry = registry_entry;
        inner.parallel_updates = parallel_updates;
        Ok(())
    }

    /// Undo a failed add so the platform can retry.
    ///
    /// The added hook may already have registered teardown callbacks, so
    /// they are drained the same way removal drains them.
    pub fn add_to_platform_abort(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = CellInner::cleared();
        }
        self.run_remove_callbacks();
    }

    /// Finish the add: run the added hook, mark the cell live, publish the
    /// first state.
    pub async fn add_to_platform_finish(self: &Arc<Self>) -> Result<(), OppError> {
        self.entity.async_added_to_opp(self).await;

        if let Ok(mut inner) = self.inner.lock() {
            inner.stage = LifecycleStage::Added;
        }

        self.async_write_op_state().await
    }

    /// Register a teardown callback, run exactly once on removal.
    ///
    /// Callbacks run in reverse registration order.
    pub fn async_on_remove(&self, callback: impl FnOnce() + Send + 'static) {
        if let Ok(mut callbacks) = self.on_remove.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Publish the entity's current state to the state store.
    ///
    /// Computes the attribute map, applies customize overrides and the
    /// display-unit temperature conversion, and writes through with the
    /// entity's `force_update` flag. Does not suspend on I/O.
    pub async fn async_write_op_state(&self) -> Result<(), OppError> {
        let (opp, entity_id) = {
            let inner = self
                .inner
                .lock()
                .map_err(|_| OppError::Platform("entity cell lock poisoned".to_string()))?;

            let entity_id = inner.entity_id.clone().ok_or_else(|| {
                OppError::NoEntitySpecified {
                    entity: self.entity_label(),
                }
            })?;
            let opp = inner.opp.clone().ok_or_else(|| OppError::NoOppInstance {
                entity: self.entity_label(),
            })?;
            (opp, entity_id)
        };

        let entity = &self.entity;
        let mut state;
        let mut attributes: HashMap<String, Value>;

        if entity.available() {
            attributes = entity.capability_attributes();
            attributes.extend(entity.state_attributes());
            attributes.extend(entity.extra_state_attributes());

            state = entity
                .state()
                .map(|v| v.render())
                .unwrap_or_else(|| STATE_UNKNOWN.to_string());

            if let Some(unit) = entity.unit_of_measurement() {
                attributes.insert(ATTR_UNIT_OF_MEASUREMENT.to_string(), json!(unit));
            }
            if entity.supported_features() != 0 {
                attributes.insert(
                    ATTR_SUPPORTED_FEATURES.to_string(),
                    json!(entity.supported_features()),
                );
            }
            if entity.assumed_state() {
                attributes.insert(ATTR_ASSUMED_STATE.to_string(), json!(true));
            }
        } else {
            // Unreachable entity: identity attributes only
            state = STATE_UNAVAILABLE.to_string();
            attributes = HashMap::new();
        }

        if let Some(name) = entity.name() {
            attributes.insert(ATTR_FRIENDLY_NAME.to_string(), json!(name));
        }
        if let Some(icon) = entity.icon() {
            attributes.insert(ATTR_ICON.to_string(), json!(icon));
        }
        if let Some(device_class) = entity.device_class() {
            attributes.insert(ATTR_DEVICE_CLASS.to_string(), json!(device_class));
        }

        opp.customize.apply(&entity_id.to_string(), &mut attributes);

        // Convert temperature states whose unit disagrees with the
        // configured display unit, keeping the input's decimal precision
        if let Some(Value::String(unit)) = attributes.get(ATTR_UNIT_OF_MEASUREMENT) {
            if let Some(from) = TemperatureUnit::from_unit_str(unit) {
                let to = opp.units.temperature;
                if from != to {
                    if let Some(converted) = convert_temperature_str(&state, from, to) {
                        state = converted;
                        attributes.insert(
                            ATTR_UNIT_OF_MEASUREMENT.to_string(),
                            json!(to.as_unit_str()),
                        );
                    }
                }
            }
        }

        opp.states.set(
            entity_id,
            state,
            attributes,
            entity.force_update(),
            Context::new(),
        );
        Ok(())
    }

    /// Optionally refresh from the device, then publish state.
    ///
    /// Refresh failures are logged and abandoned; the previous state stays
    /// authoritative and no write happens.
    pub async fn async_update_op_state(&self, force_refresh: bool) -> Result<(), OppError> {
        if force_refresh {
            if let Err(err) = self.async_device_update(true).await {
                warn!(
                    entity = %self.entity_label(),
                    error = %err,
                    "Update failed, keeping previous state"
                );
                return Ok(());
            }
        }
        self.async_write_op_state().await
    }

    /// Run the entity's refresh with single-flight and parallelism control.
    ///
    /// A refresh already in flight makes concurrent calls return
    /// immediately. Refreshes exceeding [`SLOW_UPDATE_WARNING`] log a
    /// warning but are awaited to completion.
    pub async fn async_device_update(&self, warning: bool) -> Result<(), OppError> {
        if self.update_staged.swap(true, Ordering::Acquire) {
            debug!(
                entity = %self.entity_label(),
                "Update already in progress, skipping"
            );
            return Ok(());
        }

        let semaphore = self.inner.lock().ok().and_then(|i| i.parallel_updates.clone());
        let _permit = match &semaphore {
            Some(s) => s.acquire().await.ok(),
            None => None,
        };

        let result = if warning {
            let mut update = self.entity.async_update();
            match tokio::time::timeout(SLOW_UPDATE_WARNING, &mut update).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        entity = %self.entity_label(),
                        "Update is taking over {} seconds",
                        SLOW_UPDATE_WARNING.as_secs()
                    );
                    update.await
                }
            }
        } else {
            self.entity.async_update().await
        };

        self.update_staged.store(false, Ordering::Release);
        result
    }

    /// Remove the entity.
    ///
    /// Runs the will-remove hook, drains teardown callbacks in LIFO order
    /// with per-callback panic isolation, then either soft-removes the
    /// state (registered, non-disabled entity without `force_remove`:
    /// `unavailable` with a `restored` marker, preserving history) or
    /// purges the state record.
    pub async fn async_remove(&self, force_remove: bool) -> Result<(), OppError> {
        let (opp, entity_id, registry_entry) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| OppError::Platform("entity cell lock poisoned".to_string()))?;

            match inner.stage {
                LifecycleStage::Removing | LifecycleStage::Removed => return Ok(()),
                _ => inner.stage = LifecycleStage::Removing,
            }
            (
                inner.opp.clone(),
                inner.entity_id.clone(),
                inner.registry_entry.clone(),
            )
        };

        self.entity.async_will_remove_from_opp().await;
        self.run_remove_callbacks();

        if let Ok(mut inner) = self.inner.lock() {
            inner.stage = LifecycleStage::Removed;
        }

        if let (Some(opp), Some(entity_id)) = (opp, entity_id) {
            let keep_record = !force_remove
                && registry_entry
                    .as_ref()
                    .map(|entry| !entry.is_disabled())
                    .unwrap_or(false);

            if keep_record {
                let mut attributes = HashMap::new();
                attributes.insert(ATTR_RESTORED.to_string(), json!(true));
                if let Some(name) = self.entity.name() {
                    attributes.insert(ATTR_FRIENDLY_NAME.to_string(), json!(name));
                }
                opp.states.set(
                    entity_id,
                    STATE_UNAVAILABLE,
                    attributes,
                    false,
                    Context::new(),
                );
            } else {
                opp.states.remove(&entity_id, Context::new());
            }
        }

        Ok(())
    }

    /// Drain teardown callbacks, newest first. A panicking callback is
    /// logged and the rest still run.
    fn run_remove_callbacks(&self) {
        let callbacks: Vec<RemoveCallback> = self
            .on_remove
            .lock()
            .map(|mut cbs| cbs.drain(..).rev().collect())
            .unwrap_or_default();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(
                    entity = %self.entity_label(),
                    "Teardown callback panicked during removal"
                );
            }
        }
    }
}

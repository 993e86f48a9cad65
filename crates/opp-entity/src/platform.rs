//! Entity platform: batches entities for one (domain, platform) pair
//!
//! The platform correlates entities with the registry by unique_id,
//! generates entity_ids, orchestrates the add lifecycle, and drives the
//! polling loop for entities that declare `UpdatePolicy::Polled`.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use opp_core::{slugify, EntityId, OppError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cell::EntityCell;
use crate::entity::{Entity, UpdatePolicy};
use crate::opp::OpenPeerPower;

/// Default polling interval for platforms with polled entities
pub const SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// A platform managing the entities of one integration within one domain
pub struct EntityPlatform {
    opp: Arc<OpenPeerPower>,
    /// Entity domain, e.g. "sensor"
    domain: String,
    /// Integration providing the entities, e.g. "mqtt"
    platform_name: String,
    /// Managed cells keyed by entity_id, insertion-ordered
    entities: Mutex<IndexMap<String, Arc<EntityCell>>>,
    /// Optional cap on concurrent device refreshes
    parallel_updates: Option<Arc<Semaphore>>,
    scan_interval: Duration,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl EntityPlatform {
    pub fn new(
        opp: Arc<OpenPeerPower>,
        domain: impl Into<String>,
        platform_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opp,
            domain: domain.into(),
            platform_name: platform_name.into(),
            entities: Mutex::new(IndexMap::new()),
            parallel_updates: None,
            scan_interval: SCAN_INTERVAL,
            poll_task: Mutex::new(None),
        })
    }

    /// Build a platform with a bounded number of concurrent refreshes
    pub fn with_parallel_updates(
        opp: Arc<OpenPeerPower>,
        domain: impl Into<String>,
        platform_name: impl Into<String>,
        parallel_updates: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            opp,
            domain: domain.into(),
            platform_name: platform_name.into(),
            entities: Mutex::new(IndexMap::new()),
            parallel_updates: Some(Arc::new(Semaphore::new(parallel_updates))),
            scan_interval: SCAN_INTERVAL,
            poll_task: Mutex::new(None),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// Managed entity_ids in addition order
    pub fn entity_ids(&self) -> Vec<String> {
        self.entities
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of managed entities
    pub fn len(&self) -> usize {
        self.entities.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cell for a managed entity
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityCell>> {
        self.entities
            .lock()
            .ok()
            .and_then(|e| e.get(entity_id).cloned())
    }

    /// Add a batch of entities to the platform.
    ///
    /// Each entity is correlated with the registry by unique_id, given an
    /// entity_id, attached, and written once. Disabled registry entries are
    /// skipped with a debug log; duplicates and per-entity add failures are
    /// logged without failing the batch. Starts the polling loop if any
    /// added entity is `Polled`.
    pub async fn async_add_entities(
        self: &Arc<Self>,
        entities: Vec<Arc<dyn Entity>>,
    ) -> Result<(), OppError> {
        let mut any_polled = false;

        for entity in entities {
            match self.async_add_entity(entity).await {
                Ok(Some(cell)) => {
                    if cell.entity().update_policy() == UpdatePolicy::Polled {
                        any_polled = true;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        domain = %self.domain,
                        platform = %self.platform_name,
                        error = %err,
                        "Failed to add entity"
                    );
                }
            }
        }

        if any_polled {
            self.start_polling();
        }
        Ok(())
    }

    async fn async_add_entity(
        self: &Arc<Self>,
        entity: Arc<dyn Entity>,
    ) -> Result<Option<Arc<EntityCell>>, OppError> {
        let registry = &self.opp.registries.entities;

        let (entity_id, registry_entry) = if let Some(unique_id) = entity.unique_id() {
            let suggested = self.suggested_object_id(&entity, &unique_id);
            let entry = registry.get_or_create(&self.domain, &self.platform_name, &unique_id, &suggested);

            if entry.is_disabled() {
                debug!(
                    entity_id = %entry.entity_id,
                    "Not adding entity, disabled by {:?}",
                    entry.disabled_by
                );
                return Ok(None);
            }
            (entry.entity_id.clone(), Some(entry))
        } else {
            let suggested = entity
                .suggested_object_id()
                .or_else(|| entity.name().map(|n| slugify(&n)))
                .unwrap_or_else(|| self.platform_name.clone());
            let reserved = self.opp.states.all_entity_ids();
            (
                registry.generate_entity_id(&self.domain, &suggested, None, Some(&reserved)),
                None,
            )
        };

        {
            let entities = self
                .entities
                .lock()
                .map_err(|_| OppError::Platform("platform lock poisoned".to_string()))?;
            if entities.contains_key(&entity_id) {
                return Err(OppError::Platform(format!(
                    "entity_id {} already managed by platform {}",
                    entity_id, self.platform_name
                )));
            }
        }

        let parsed: EntityId = entity_id.parse()?;
        let cell = EntityCell::new(entity, self.platform_name.clone());
        cell.add_to_platform_start(
            self.opp.clone(),
            parsed,
            registry_entry,
            self.parallel_updates.clone(),
        )?;

        if let Err(err) = cell.add_to_platform_finish().await {
            cell.add_to_platform_abort();
            return Err(err);
        }

        if let Ok(mut entities) = self.entities.lock() {
            entities.insert(entity_id.clone(), cell.clone());
        }
        info!(entity_id = %entity_id, platform = %self.platform_name, "Added entity");
        Ok(Some(cell))
    }

    fn suggested_object_id(&self, entity: &Arc<dyn Entity>, unique_id: &str) -> String {
        entity
            .suggested_object_id()
            .or_else(|| entity.name().map(|n| slugify(&n)))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&format!("{} {}", self.platform_name, unique_id)))
    }

    /// Remove one entity from the platform
    pub async fn async_remove_entity(&self, entity_id: &str) -> Result<(), OppError> {
        self.remove_cell(entity_id, false).await
    }

    /// Remove one entity and purge its state record outright, skipping the
    /// soft-removal path even when a registry entry exists
    pub async fn async_purge_entity(&self, entity_id: &str) -> Result<(), OppError> {
        self.remove_cell(entity_id, true).await
    }

    async fn remove_cell(&self, entity_id: &str, force_remove: bool) -> Result<(), OppError> {
        let cell = self
            .entities
            .lock()
            .ok()
            .and_then(|mut e| e.shift_remove(entity_id));

        match cell {
            Some(cell) => cell.async_remove(force_remove).await,
            None => Err(OppError::Platform(format!(
                "entity_id {} not managed by platform {}",
                entity_id, self.platform_name
            ))),
        }
    }

    /// Unload the platform: stop polling and soft-remove every entity
    pub async fn async_reset(&self) {
        self.stop_polling();

        let cells: Vec<Arc<EntityCell>> = self
            .entities
            .lock()
            .map(|mut e| e.drain(..).map(|(_, c)| c).collect())
            .unwrap_or_default();

        for cell in cells {
            if let Err(err) = cell.async_remove(false).await {
                warn!(error = %err, "Failed to remove entity during reset");
            }
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let mut poll_task = match self.poll_task.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if poll_task.is_some() {
            return;
        }

        let weak: Weak<EntityPlatform> = Arc::downgrade(self);
        let scan_interval = self.scan_interval;

        *poll_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scan_interval);
            // The first tick fires immediately; entities were just written
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(platform) = weak.upgrade() else { break };

                let cells: Vec<Arc<EntityCell>> = platform
                    .entities
                    .lock()
                    .map(|e| {
                        e.values()
                            .filter(|c| c.entity().update_policy() == UpdatePolicy::Polled)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                drop(platform);

                // One failing entity never blocks its siblings
                for cell in cells {
                    if let Err(err) = cell.async_update_op_state(true).await {
                        warn!(
                            entity_id = ?cell.entity_id(),
                            error = %err,
                            "Polled update failed"
                        );
                    }
                }
            }
        }));
    }

    fn stop_polling(&self) {
        if let Ok(mut poll_task) = self.poll_task.lock() {
            if let Some(task) = poll_task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for EntityPlatform {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

//! Entity registry
//!
//! Tracks registered entities keyed by (domain, platform, unique_id) so a
//! device keeps its entity_id across restarts and re-announcements. Removed
//! entries are soft-deleted and restored when the same unique_id shows up
//! again.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storage, StorageFile, StorageResult};

/// Errors that can occur in the entity registry
#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),
}

/// Storage key for entity registry
pub const STORAGE_KEY: &str = "core.entity_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    /// Disabled by a config entry
    ConfigEntry,
    /// Disabled because its device is disabled
    Device,
    /// Disabled by the integration
    Integration,
    /// Disabled by the user
    User,
}

/// A registered entity entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal UUID
    pub id: String,
    /// Full entity ID (domain.object_id)
    pub entity_id: String,
    /// Platform-specific unique identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Platform that provides this entity
    pub platform: String,

    /// Parent device ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Config entry that created this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Platform default name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    /// Device class (e.g., "temperature", "humidity")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// Custom icon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Unit of measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    /// Bitmask of supported features
    #[serde(default)]
    pub supported_features: u32,

    /// Disable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modified timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    /// Create a new entity entry with minimal required fields
    pub fn new(
        entity_id: impl Into<String>,
        platform: impl Into<String>,
        unique_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            entity_id: entity_id.into(),
            unique_id,
            platform: platform.into(),
            device_id: None,
            config_entry_id: None,
            name: None,
            original_name: None,
            device_class: None,
            icon: None,
            unit_of_measurement: None,
            supported_features: 0,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Get the domain from entity_id
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or(&self.entity_id)
    }

    /// Get the object_id from entity_id
    pub fn object_id(&self) -> &str {
        self.entity_id.split('.').nth(1).unwrap_or(&self.entity_id)
    }

    /// Check if entity is disabled
    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }
}

/// Entity registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    /// All registered entities
    pub entities: Vec<EntityEntry>,
    /// Soft-deleted entities
    #[serde(default)]
    pub deleted_entities: Vec<EntityEntry>,
}

/// Entity registry
///
/// Lookups:
/// - entity_id (primary, insertion-ordered)
/// - (domain, platform, unique_id)
/// - device_id (multi)
///
/// Entries are `Arc<EntityEntry>` so reads don't clone the record.
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// Primary index, insertion-ordered
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// Index: (domain, platform, unique_id) -> entity_id
    by_unique_id: DashMap<(String, String, String), String>,

    /// Index: device_id -> set of entity_ids
    by_device_id: DashMap<String, HashSet<String>>,

    /// Soft-deleted entries keyed by (domain, platform, unique_id)
    deleted: RwLock<IndexMap<(String, String, String), Arc<EntityEntry>>>,
}

fn unique_key(domain: &str, platform: &str, unique_id: &str) -> (String, String, String) {
    (
        domain.to_string(),
        platform.to_string(),
        unique_id.to_string(),
    )
}

impl EntityRegistry {
    /// Create a new entity registry
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_device_id: DashMap::new(),
            deleted: RwLock::new(IndexMap::new()),
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<EntityRegistryData>(STORAGE_KEY).await? {
            info!(
                "Loading {} entities from storage (v{}.{})",
                storage_file.data.entities.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.entities {
                self.index_entry(Arc::new(entry));
            }

            for entry in storage_file.data.deleted_entities {
                let key = unique_key(
                    entry.domain(),
                    &entry.platform,
                    entry.unique_id.as_deref().unwrap_or_default(),
                );
                if let Ok(mut deleted) = self.deleted.write() {
                    deleted.insert(key, Arc::new(entry));
                }
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let entities: Vec<EntityEntry> = self
            .by_entity_id
            .read()
            .map(|e| e.values().map(|v| (**v).clone()).collect())
            .unwrap_or_default();

        let deleted_entities: Vec<EntityEntry> = self
            .deleted
            .read()
            .map(|d| d.values().map(|v| (**v).clone()).collect())
            .unwrap_or_default();

        let data = EntityRegistryData {
            entities,
            deleted_entities,
        };

        let storage_file =
            StorageFile::new(STORAGE_KEY, data, STORAGE_VERSION, STORAGE_MINOR_VERSION);

        self.storage.save(&storage_file).await?;
        debug!(
            "Saved {} entities to storage",
            self.by_entity_id.read().map(|e| e.len()).unwrap_or(0)
        );
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.insert(
                unique_key(entry.domain(), &entry.platform, unique_id),
                entity_id.clone(),
            );
        }

        if let Some(ref device_id) = entry.device_id {
            self.by_device_id
                .entry(device_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&unique_key(entry.domain(), &entry.platform, unique_id));
        }

        if let Some(ref device_id) = entry.device_id {
            if let Some(mut ids) = self.by_device_id.get_mut(device_id) {
                ids.remove(&entry.entity_id);
            }
        }
    }

    /// Get entity by entity_id
    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    /// Get entity by (domain, platform, unique_id)
    pub fn get_by_unique_id(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
    ) -> Option<Arc<EntityEntry>> {
        self.by_unique_id
            .get(&unique_key(domain, platform, unique_id))
            .and_then(|entity_id| self.get(&entity_id))
    }

    /// Get all entities for a device
    pub fn get_by_device_id(&self, device_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_device_id
            .get(device_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get or create an entity entry.
    ///
    /// Looks up by (domain, platform, unique_id) first, then restores a
    /// soft-deleted entry under that key, and finally creates a fresh one
    /// with a generated entity_id based on `suggested_object_id`.
    pub fn get_or_create(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
        suggested_object_id: &str,
    ) -> Arc<EntityEntry> {
        if let Some(existing) = self.get_by_unique_id(domain, platform, unique_id) {
            debug!("Found existing entity by unique_id: {}", existing.entity_id);
            return existing;
        }

        let deleted_key = unique_key(domain, platform, unique_id);
        let deleted_entry = self
            .deleted
            .write()
            .ok()
            .and_then(|mut d| d.shift_remove(&deleted_key));
        if let Some(deleted_entry) = deleted_entry {
            // Keep the original id and created_at across the restore
            let mut restored = (*deleted_entry).clone();
            restored.entity_id =
                self.generate_entity_id(domain, deleted_entry.object_id(), None, None);
            restored.modified_at = Utc::now();

            let arc_entry = Arc::new(restored);
            self.index_entry(Arc::clone(&arc_entry));

            info!("Restored deleted entity: {}", arc_entry.entity_id);
            return arc_entry;
        }

        let entity_id = self.generate_entity_id(domain, suggested_object_id, None, None);
        let entry = EntityEntry::new(&entity_id, platform, Some(unique_id.to_string()));

        let arc_entry = Arc::new(entry);
        self.index_entry(Arc::clone(&arc_entry));

        info!("Registered new entity: {}", entity_id);
        arc_entry
    }

    /// Update an entity entry.
    ///
    /// Clones the record, applies the closure, and re-indexes under a new
    /// `Arc`.
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let arc_entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id));

        if let Some(arc_entry) = arc_entry {
            let mut entry = (*arc_entry).clone();
            self.unindex_entry(&entry);

            f(&mut entry);
            entry.modified_at = Utc::now();

            let new_arc = Arc::new(entry);
            self.index_entry(Arc::clone(&new_arc));

            Ok(new_arc)
        } else {
            Err(EntityRegistryError::NotFound(entity_id.to_string()))
        }
    }

    /// Remove an entity (soft delete).
    ///
    /// The entry moves to the deleted set keyed by (domain, platform,
    /// unique_id) so a later `get_or_create` can restore it.
    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let arc_entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id));

        if let Some(arc_entry) = arc_entry {
            self.unindex_entry(&arc_entry);

            let key = unique_key(
                arc_entry.domain(),
                &arc_entry.platform,
                arc_entry.unique_id.as_deref().unwrap_or_default(),
            );
            if let Ok(mut deleted) = self.deleted.write() {
                deleted.insert(key, Arc::clone(&arc_entry));
            }
            info!("Removed entity: {}", entity_id);
            Some(arc_entry)
        } else {
            None
        }
    }

    /// Purge an entity completely, skipping the soft-delete set
    pub fn purge(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let arc_entry = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id));

        if let Some(arc_entry) = arc_entry {
            self.unindex_entry(&arc_entry);
            info!("Purged entity: {}", entity_id);
            Some(arc_entry)
        } else {
            None
        }
    }

    /// Check if an entity_id is registered
    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(entity_id))
            .unwrap_or(false)
    }

    /// Check if an entity with the given key is in the deleted set
    pub fn is_deleted(&self, domain: &str, platform: &str, unique_id: &str) -> bool {
        self.deleted
            .read()
            .map(|d| d.contains_key(&unique_key(domain, platform, unique_id)))
            .unwrap_or(false)
    }

    /// Get all entity IDs (insertion order)
    pub fn entity_ids(&self) -> Vec<String> {
        self.by_entity_id
            .read()
            .map(|idx| idx.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Get count of registered entities
    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all entries (insertion order)
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Generate an entity_id that doesn't collide with any registered or
    /// reserved id.
    ///
    /// Tries `{domain}.{suggested_object_id}` first, then appends `_2`,
    /// `_3`, and so on. `current_entity_id` is excluded from the conflict
    /// check so an entity keeps its own id; `reserved_ids` lets the caller
    /// block ids the state store already holds.
    pub fn generate_entity_id(
        &self,
        domain: &str,
        suggested_object_id: &str,
        current_entity_id: Option<&str>,
        reserved_ids: Option<&[String]>,
    ) -> String {
        let preferred = format!("{}.{}", domain, suggested_object_id);

        let is_available = |entity_id: &str| -> bool {
            if current_entity_id == Some(entity_id) {
                return true;
            }
            if self.is_registered(entity_id) {
                return false;
            }
            if let Some(reserved) = reserved_ids {
                if reserved.iter().any(|r| r == entity_id) {
                    return false;
                }
            }
            true
        };

        if is_available(&preferred) {
            return preferred;
        }

        let mut tries = 1;
        loop {
            tries += 1;
            let test_id = format!("{}_{}", preferred, tries);
            if is_available(&test_id) {
                return test_id;
            }
            if tries > 10_000 {
                return format!(
                    "{}.{}_{}",
                    domain,
                    suggested_object_id,
                    Utc::now().timestamp_millis()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_registry() -> (TempDir, EntityRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, EntityRegistry::new(storage))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (_dir, registry) = make_registry();

        let first = registry.get_or_create("sensor", "mqtt", "abc123", "outside_temp");
        let second = registry.get_or_create("sensor", "mqtt", "abc123", "other_name");

        assert_eq!(first.entity_id, "sensor.outside_temp");
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_entity_id_collision_suffixing() {
        let (_dir, registry) = make_registry();

        let a = registry.get_or_create("sensor", "mqtt", "uid_a", "temp");
        let b = registry.get_or_create("sensor", "mqtt", "uid_b", "temp");
        let c = registry.get_or_create("sensor", "mqtt", "uid_c", "temp");

        assert_eq!(a.entity_id, "sensor.temp");
        assert_eq!(b.entity_id, "sensor.temp_2");
        assert_eq!(c.entity_id, "sensor.temp_3");
    }

    #[test]
    fn test_generate_entity_id_respects_reserved() {
        let (_dir, registry) = make_registry();
        let reserved = vec!["light.kitchen".to_string()];

        let id = registry.generate_entity_id("light", "kitchen", None, Some(&reserved));
        assert_eq!(id, "light.kitchen_2");
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let (_dir, registry) = make_registry();

        let original = registry.get_or_create("sensor", "mqtt", "abc123", "outside_temp");
        let original_id = original.id.clone();

        registry.remove(&original.entity_id);
        assert!(!registry.is_registered("sensor.outside_temp"));
        assert!(registry.is_deleted("sensor", "mqtt", "abc123"));

        let restored = registry.get_or_create("sensor", "mqtt", "abc123", "whatever");
        assert_eq!(restored.id, original_id);
        assert_eq!(restored.entity_id, "sensor.outside_temp");
        assert!(!registry.is_deleted("sensor", "mqtt", "abc123"));
    }

    #[test]
    fn test_purge_skips_soft_delete() {
        let (_dir, registry) = make_registry();

        let entry = registry.get_or_create("sensor", "mqtt", "abc123", "outside_temp");
        registry.purge(&entry.entity_id);

        assert!(!registry.is_deleted("sensor", "mqtt", "abc123"));

        let recreated = registry.get_or_create("sensor", "mqtt", "abc123", "outside_temp");
        assert_ne!(recreated.id, entry.id);
    }

    #[test]
    fn test_update_reindexes() {
        let (_dir, registry) = make_registry();

        let entry = registry.get_or_create("sensor", "mqtt", "abc123", "outside_temp");
        registry
            .update(&entry.entity_id, |e| {
                e.device_id = Some("device1".to_string());
            })
            .unwrap();

        let by_device = registry.get_by_device_id("device1");
        assert_eq!(by_device.len(), 1);
        assert_eq!(by_device[0].entity_id, "sensor.outside_temp");
    }

    #[test]
    fn test_update_missing_entity() {
        let (_dir, registry) = make_registry();
        assert!(registry.update("sensor.none", |_| {}).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        let registry = EntityRegistry::new(storage.clone());
        registry.get_or_create("sensor", "mqtt", "abc123", "outside_temp");
        registry.get_or_create("light", "mqtt", "def456", "kitchen");
        registry.remove("light.kitchen");
        registry.save().await.unwrap();

        let registry2 = EntityRegistry::new(storage);
        registry2.load().await.unwrap();

        assert_eq!(registry2.len(), 1);
        assert!(registry2.is_registered("sensor.outside_temp"));
        assert!(registry2.is_deleted("light", "mqtt", "def456"));
    }
}

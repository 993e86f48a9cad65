//! Open Peer Power registries
//!
//! Persistent registries for entities and devices, stored as versioned JSON
//! under the `.storage/` directory.

pub mod device_registry;
pub mod entity_registry;
pub mod storage;

pub use storage::{Storage, StorageError, StorageFile, StorageResult};

pub use entity_registry::{DisabledBy, EntityEntry, EntityRegistry, EntityRegistryData};

pub use device_registry::{
    format_mac, DeviceConnection, DeviceEntry, DeviceIdentifier, DeviceInfo, DeviceRegistry,
    DeviceRegistryData, CONNECTION_NETWORK_MAC,
};

use std::sync::Arc;

/// All registries bundled together
pub struct Registries {
    pub storage: Arc<Storage>,
    pub entities: EntityRegistry,
    pub devices: DeviceRegistry,
}

impl Registries {
    /// Create new registries with the given config directory
    pub fn new(config_dir: impl AsRef<std::path::Path>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));

        Self {
            entities: EntityRegistry::new(storage.clone()),
            devices: DeviceRegistry::new(storage.clone()),
            storage,
        }
    }

    /// Load all registries from storage
    pub async fn load_all(&self) -> StorageResult<()> {
        self.entities.load().await?;
        self.devices.load().await?;
        Ok(())
    }

    /// Save all registries to storage
    pub async fn save_all(&self) -> StorageResult<()> {
        self.entities.save().await?;
        self.devices.save().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registries_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(temp_dir.path());

        let entity = registries
            .entities
            .get_or_create("sensor", "mqtt", "uid1", "outside_temp");

        let device = registries
            .devices
            .get_or_create(
                &DeviceInfo {
                    identifiers: vec![DeviceIdentifier::new("mqtt", "bridge1")],
                    name: Some("Bridge".to_string()),
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        registries
            .entities
            .update(&entity.entity_id, |e| {
                e.device_id = Some(device.id.clone());
            })
            .unwrap();

        registries.save_all().await.unwrap();

        let registries2 = Registries::new(temp_dir.path());
        registries2.load_all().await.unwrap();

        assert_eq!(registries2.entities.len(), 1);
        assert_eq!(registries2.devices.len(), 1);
        assert_eq!(
            registries2.entities.get_by_device_id(&device.id).len(),
            1
        );
    }
}

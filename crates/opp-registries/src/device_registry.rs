//! Device registry
//!
//! Tracks devices by their identifiers and connections. A device announced
//! twice with overlapping identifiers merges into the existing entry, and
//! `via_device` references resolve to the parent hub's registry id.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storage, StorageFile, StorageResult};

/// Storage key for device registry
pub const STORAGE_KEY: &str = "core.device_registry";
/// Connection type for network MAC addresses
pub const CONNECTION_NETWORK_MAC: &str = "mac";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// A device identifier (domain, id) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    /// Create a key for indexing
    pub fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A device connection (type, value) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self(conn_type.into(), id.into())
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    /// Create a key for indexing
    pub fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }

    /// Create a normalized connection (MAC addresses lowercased and
    /// colon-separated)
    pub fn normalized(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        let ct = conn_type.into();
        let raw_id = id.into();
        let normalized_id = if ct == CONNECTION_NETWORK_MAC {
            format_mac(&raw_id)
        } else {
            raw_id
        };
        Self(ct, normalized_id)
    }
}

/// Normalize a MAC address to lowercase colon-separated form.
///
/// Accepts colon, dash, dot, and bare-hex notations; anything else is
/// returned unchanged.
pub fn format_mac(mac: &str) -> String {
    if mac.len() == 17 && mac.chars().filter(|c| *c == ':').count() == 5 {
        return mac.to_lowercase();
    }

    let stripped = if mac.len() == 17 && mac.chars().filter(|c| *c == '-').count() == 5 {
        mac.replace('-', "")
    } else if mac.len() == 14 && mac.chars().filter(|c| *c == '.').count() == 2 {
        mac.replace('.', "")
    } else if mac.len() == 12 && mac.chars().all(|c| c.is_ascii_hexdigit()) {
        mac.to_string()
    } else {
        return mac.to_string();
    };

    stripped
        .to_lowercase()
        .as_bytes()
        .chunks(2)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(":")
}

/// Normalize a slice of connections
pub fn normalize_connections(connections: &[DeviceConnection]) -> Vec<DeviceConnection> {
    connections
        .iter()
        .map(|c| DeviceConnection::normalized(c.connection_type(), c.id()))
        .collect()
}

/// Device description supplied by a platform when registering a device
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub identifiers: Vec<DeviceIdentifier>,
    pub connections: Vec<DeviceConnection>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
    pub suggested_area: Option<String>,
    pub configuration_url: Option<String>,
    /// Identifier of the parent hub device
    pub via_device: Option<DeviceIdentifier>,
}

impl DeviceInfo {
    /// A device must be addressable by at least one identifier or
    /// connection
    pub fn is_addressable(&self) -> bool {
        !self.identifiers.is_empty() || !self.connections.is_empty()
    }
}

/// A registered device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal UUID
    pub id: String,

    /// Unique identifiers by domain (e.g., [["mqtt", "bedroom_bridge"]])
    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    /// Connection info (e.g., [["mac", "aa:bb:cc:dd:ee:ff"]])
    #[serde(default)]
    pub connections: Vec<DeviceConnection>,

    /// Associated config entries
    #[serde(default)]
    pub config_entries: Vec<String>,

    /// Device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Manufacturer name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    /// Model name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Software/firmware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    /// Hardware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,

    /// Suggested area name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_area: Option<String>,

    /// URL for device configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,

    /// Parent device (for devices behind a hub)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_device_id: Option<String>,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Last modified timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    /// Create a new device entry
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            connections: Vec::new(),
            config_entries: Vec::new(),
            name: name.map(|s| s.to_string()),
            manufacturer: None,
            model: None,
            sw_version: None,
            hw_version: None,
            suggested_area: None,
            configuration_url: None,
            via_device_id: None,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Device registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    /// All registered devices
    pub devices: Vec<DeviceEntry>,
}

/// Device registry
///
/// Lookups:
/// - id (primary)
/// - identifier
/// - connection
/// - via_device_id (children, multi)
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    /// Primary index: device_id -> DeviceEntry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// Index: identifier key -> device_id
    by_identifier: DashMap<String, String>,

    /// Index: connection key -> device_id
    by_connection: DashMap<String, String>,

    /// Index: via_device_id -> set of device_ids (child devices)
    by_via_device_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_connection: DashMap::new(),
            by_via_device_id: DashMap::new(),
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<DeviceRegistryData>(STORAGE_KEY).await? {
            info!(
                "Loading {} devices from storage (v{}.{})",
                storage_file.data.devices.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let data = DeviceRegistryData {
            devices: self.by_id.iter().map(|r| (**r.value()).clone()).collect(),
        };

        let storage_file =
            StorageFile::new(STORAGE_KEY, data, STORAGE_VERSION, STORAGE_MINOR_VERSION);

        self.storage.save(&storage_file).await?;
        debug!("Saved {} devices to storage", self.by_id.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();

        for identifier in &entry.identifiers {
            self.by_identifier
                .insert(identifier.key(), device_id.clone());
        }

        for connection in &entry.connections {
            self.by_connection
                .insert(connection.key(), device_id.clone());
        }

        if let Some(ref via_device_id) = entry.via_device_id {
            self.by_via_device_id
                .entry(via_device_id.clone())
                .or_default()
                .insert(device_id.clone());
        }

        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }

        for connection in &entry.connections {
            self.by_connection.remove(&connection.key());
        }

        if let Some(ref via_device_id) = entry.via_device_id {
            if let Some(mut ids) = self.by_via_device_id.get_mut(via_device_id) {
                ids.remove(&entry.id);
            }
        }

        self.by_id.remove(&entry.id);
    }

    /// Get device by ID
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Get device by identifier
    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = format!("{}:{}", domain, id);
        self.by_identifier
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    /// Get device by connection
    pub fn get_by_connection(&self, conn_type: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let normalized_id = if conn_type == CONNECTION_NETWORK_MAC {
            format_mac(id)
        } else {
            id.to_string()
        };
        let key = format!("{}:{}", conn_type, normalized_id);
        self.by_connection
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    /// Get all child devices (connected via this device)
    pub fn get_children(&self, device_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_via_device_id
            .get(device_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Get or create a device.
    ///
    /// Matches any of the supplied identifiers or connections against
    /// existing devices. On a match, missing identifiers, connections, the
    /// config entry, and updated info fields are merged in. Returns None
    /// when the description has neither identifiers nor connections.
    pub fn get_or_create(
        &self,
        info: &DeviceInfo,
        config_entry_id: Option<&str>,
    ) -> Option<Arc<DeviceEntry>> {
        if !info.is_addressable() {
            return None;
        }

        let connections = normalize_connections(&info.connections);

        // Resolve the parent hub before touching indexes
        let via_device_id = info
            .via_device
            .as_ref()
            .and_then(|v| self.get_by_identifier(v.domain(), v.id()))
            .map(|parent| parent.id.clone());

        let existing = info
            .identifiers
            .iter()
            .find_map(|i| self.get_by_identifier(i.domain(), i.id()))
            .or_else(|| {
                connections
                    .iter()
                    .find_map(|c| self.get_by_connection(c.connection_type(), c.id()))
            });

        if let Some(existing) = existing {
            debug!("Found existing device: {}", existing.id);
            let device_id = existing.id.clone();
            return self
                .update(&device_id, |e| {
                    for ident in &info.identifiers {
                        if !e.identifiers.contains(ident) {
                            e.identifiers.push(ident.clone());
                        }
                    }
                    for conn in &connections {
                        if !e.connections.contains(conn) {
                            e.connections.push(conn.clone());
                        }
                    }
                    if let Some(ce_id) = config_entry_id {
                        if !e.config_entries.iter().any(|c| c == ce_id) {
                            e.config_entries.push(ce_id.to_string());
                        }
                    }
                    merge_info_fields(e, info);
                    if via_device_id.is_some() {
                        e.via_device_id = via_device_id.clone();
                    }
                })
                .or_else(|| self.get(&device_id));
        }

        let mut entry = DeviceEntry::new(info.name.as_deref());
        entry.identifiers = info.identifiers.clone();
        entry.connections = connections;
        entry.manufacturer = info.manufacturer.clone();
        entry.model = info.model.clone();
        entry.sw_version = info.sw_version.clone();
        entry.hw_version = info.hw_version.clone();
        entry.suggested_area = info.suggested_area.clone();
        entry.configuration_url = info.configuration_url.clone();
        entry.via_device_id = via_device_id;
        if let Some(ce_id) = config_entry_id {
            entry.config_entries.push(ce_id.to_string());
        }

        let arc_entry = Arc::new(entry);
        self.index_entry(Arc::clone(&arc_entry));

        info!("Registered new device: {:?} ({})", info.name, arc_entry.id);
        Some(arc_entry)
    }

    /// Update a device entry
    pub fn update<F>(&self, device_id: &str, f: F) -> Option<Arc<DeviceEntry>>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let arc_entry = self.by_id.get(device_id).map(|r| Arc::clone(r.value()))?;
        self.unindex_entry(&arc_entry);

        let mut entry = (*arc_entry).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let new_arc = Arc::new(entry);
        self.index_entry(Arc::clone(&new_arc));
        Some(new_arc)
    }

    /// Remove a device from the registry.
    ///
    /// Child devices keep their entry but lose the dangling
    /// `via_device_id` reference.
    pub async fn async_remove_device(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let arc_entry = self.by_id.get(device_id).map(|r| Arc::clone(r.value()))?;
        self.unindex_entry(&arc_entry);

        for child in self.get_children(device_id) {
            self.update(&child.id, |e| {
                e.via_device_id = None;
            });
        }
        self.by_via_device_id.remove(device_id);

        info!("Removed device: {}", device_id);
        Some(arc_entry)
    }
}

fn merge_info_fields(entry: &mut DeviceEntry, info: &DeviceInfo) {
    if info.name.is_some() {
        entry.name = info.name.clone();
    }
    if info.manufacturer.is_some() {
        entry.manufacturer = info.manufacturer.clone();
    }
    if info.model.is_some() {
        entry.model = info.model.clone();
    }
    if info.sw_version.is_some() {
        entry.sw_version = info.sw_version.clone();
    }
    if info.hw_version.is_some() {
        entry.hw_version = info.hw_version.clone();
    }
    if info.configuration_url.is_some() {
        entry.configuration_url = info.configuration_url.clone();
    }
}

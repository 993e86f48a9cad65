//! The `device` block of a discovery payload
//!
//! Maps the wire format onto a [`DeviceInfo`] for the device registry.
//! Identifiers accept a single string or a list; connections are
//! [type, id] pairs; `via_device` names the parent hub by its MQTT
//! identifier.

use opp_registries::{DeviceConnection, DeviceIdentifier, DeviceInfo};
use serde::{Deserialize, Deserializer};

/// Identifier domain for devices announced over MQTT discovery
pub const MQTT_DOMAIN: &str = "mqtt";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, deserialize_with = "string_or_list")]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub connections: Vec<(String, String)>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
    pub suggested_area: Option<String>,
    pub configuration_url: Option<String>,
    pub via_device: Option<String>,
}

impl DeviceConfig {
    /// Build the registry-facing description.
    ///
    /// Returns `None` when the block carries neither identifiers nor
    /// connections, since such a device cannot be addressed.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        let info = DeviceInfo {
            identifiers: self
                .identifiers
                .iter()
                .map(|id| DeviceIdentifier::new(MQTT_DOMAIN, id))
                .collect(),
            connections: self
                .connections
                .iter()
                .map(|(conn_type, id)| DeviceConnection::new(conn_type, id))
                .collect(),
            name: self.name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            sw_version: self.sw_version.clone(),
            hw_version: self.hw_version.clone(),
            suggested_area: self.suggested_area.clone(),
            configuration_url: self.configuration_url.clone(),
            via_device: self
                .via_device
                .as_ref()
                .map(|id| DeviceIdentifier::new(MQTT_DOMAIN, id)),
        };
        info.is_addressable().then_some(info)
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(id) => vec![id],
        StringOrList::Many(ids) => ids,
    })
}

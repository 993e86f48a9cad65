//! Sensor discovery payload schema and validation

use serde::Deserialize;

use crate::availability::{
    default_payload_available, default_payload_not_available, AvailabilityConfig,
    AvailabilityEntry, AvailabilityMode,
};
use crate::device::DeviceConfig;
use crate::error::ConfigError;
use crate::template::ValueTemplate;
use crate::topic::valid_subscribe_topic;

fn default_name() -> Option<String> {
    Some("MQTT Sensor".to_string())
}

/// Configuration for one MQTT sensor, as carried by a discovery payload
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSensorConfig {
    #[serde(default = "default_name")]
    pub name: Option<String>,
    pub state_topic: String,
    pub unique_id: Option<String>,
    pub object_id: Option<String>,
    pub device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub qos: u8,
    pub value_template: Option<String>,
    /// Seconds after the last received value before the state expires
    pub expire_after: Option<u64>,

    pub json_attributes_topic: Option<String>,
    pub json_attributes_template: Option<String>,

    pub availability_topic: Option<String>,
    #[serde(default = "default_payload_available")]
    pub payload_available: String,
    #[serde(default = "default_payload_not_available")]
    pub payload_not_available: String,
    pub availability: Option<Vec<AvailabilityEntry>>,
    #[serde(default)]
    pub availability_mode: AvailabilityMode,

    pub device: Option<DeviceConfig>,
}

impl MqttSensorConfig {
    /// Parse and validate a discovery payload
    pub fn from_payload(payload: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(payload).map_err(|e| ConfigError::Payload(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field rules the schema cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.availability_topic.is_some() && self.availability.is_some() {
            return Err(ConfigError::Exclusive);
        }

        valid_subscribe_topic(&self.state_topic)?;
        if let Some(topic) = &self.json_attributes_topic {
            valid_subscribe_topic(topic)?;
        }
        if let Some(topic) = &self.availability_topic {
            valid_subscribe_topic(topic)?;
        }
        if let Some(entries) = &self.availability {
            for entry in entries {
                valid_subscribe_topic(&entry.topic)?;
            }
        }

        if let Some(source) = &self.value_template {
            ValueTemplate::new(source.as_str())?;
        }
        if let Some(source) = &self.json_attributes_template {
            ValueTemplate::new(source.as_str())?;
        }
        Ok(())
    }

    /// Resolve the two availability forms into one configuration
    pub fn availability_config(&self) -> Option<AvailabilityConfig> {
        if let Some(entries) = &self.availability {
            return Some(AvailabilityConfig {
                entries: entries.clone(),
                mode: self.availability_mode,
            });
        }
        self.availability_topic.as_ref().map(|topic| AvailabilityConfig {
            entries: vec![AvailabilityEntry {
                topic: topic.clone(),
                payload_available: self.payload_available.clone(),
                payload_not_available: self.payload_not_available.clone(),
            }],
            mode: self.availability_mode,
        })
    }
}

//! MQTT integration for Open Peer Power
//!
//! Covers the broker transport ([`MqttClient`]), in-process routing with
//! retained replay ([`MessageRouter`]), declarative per-entity
//! subscriptions, discovery of announced components ([`MqttDiscovery`]),
//! and the sensor platform built on top of all of it.

pub mod attributes;
pub mod availability;
pub mod client;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod router;
pub mod sensor;
pub mod subscription;
pub mod template;
pub mod topic;

pub use availability::{AvailabilityConfig, AvailabilityEntry, AvailabilityMode, AvailabilityTracker};
pub use client::{MqttClient, MqttConfig};
pub use config::MqttSensorConfig;
pub use device::DeviceConfig;
pub use discovery::{
    signal_discovery_new, signal_discovery_updated, DiscoveryKey, MqttDiscovery,
    DISCOVERY_PREFIX,
};
pub use error::ConfigError;
pub use router::{message_handler, Message, MessageHandler, MessageRouter, Subscription};
pub use sensor::{async_setup_sensor_platform, MqttSensor, MqttSensorPlatform, SENSOR_COMPONENT};
pub use subscription::{
    async_subscribe_topics, async_unsubscribe_topics, SubscriptionState, TopicRequest,
};
pub use template::ValueTemplate;
pub use topic::{topic_matches_filter, valid_publish_topic, valid_subscribe_topic, valid_topic};

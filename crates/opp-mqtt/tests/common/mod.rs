//! Shared test harness: a running instance with discovery and the sensor
//! platform wired to an in-process message router.

use std::sync::Arc;

use opp_entity::OpenPeerPower;
use opp_mqtt::{
    async_setup_sensor_platform, MessageRouter, MqttDiscovery, MqttSensorPlatform,
    DISCOVERY_PREFIX,
};
use serde_json::Value;
use tempfile::TempDir;

pub struct TestMqtt {
    pub opp: Arc<OpenPeerPower>,
    pub router: Arc<MessageRouter>,
    pub discovery: Arc<MqttDiscovery>,
    pub platform: Arc<MqttSensorPlatform>,
    _config_dir: TempDir,
}

impl TestMqtt {
    pub async fn new() -> Self {
        let config_dir = TempDir::new().expect("temp config dir");
        let opp = OpenPeerPower::new(config_dir.path());
        let router = MessageRouter::new();
        let discovery = MqttDiscovery::async_start(&router, opp.dispatcher.clone())
            .await
            .expect("discovery start");
        let platform =
            async_setup_sensor_platform(opp.clone(), router.clone(), discovery.clone()).await;

        Self {
            opp,
            router,
            discovery,
            platform,
            _config_dir: config_dir,
        }
    }

    /// Publish a non-retained message, awaiting all handlers
    pub async fn publish(&self, topic: &str, payload: &str) {
        self.router
            .async_publish(topic, payload, 0, false)
            .await
            .expect("publish");
    }

    /// Announce a sensor config on the discovery tree
    pub async fn announce(&self, object_id: &str, config: &Value) {
        let topic = format!("{}/sensor/{}/config", DISCOVERY_PREFIX, object_id);
        self.publish(&topic, &config.to_string()).await;
    }

    /// Publish an empty config payload, removing the announced sensor
    pub async fn retract(&self, object_id: &str) {
        let topic = format!("{}/sensor/{}/config", DISCOVERY_PREFIX, object_id);
        self.publish(&topic, "").await;
    }

    pub fn assert_state(&self, entity_id: &str, expected: &str) {
        let state = self.opp.states.get_state(entity_id);
        assert_eq!(
            state.as_deref(),
            Some(expected),
            "Expected entity {} to be in state '{}', but was {:?}",
            entity_id,
            expected,
            state
        );
    }
}

//! The MQTT sensor platform
//!
//! `MqttSensor` turns payloads on a state topic into entity state,
//! applying the value template, availability tracking, JSON attribute
//! sidecar, and value expiry. `MqttSensorPlatform` wires discovery
//! signals to sensor creation, config updates, and removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use opp_core::StateValue;
use opp_entity::{
    signal_handler, Entity, EntityCell, EntityPlatform, OpenPeerPower, SignalGuard,
};
use opp_registries::DeviceInfo;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attributes::parse_json_attributes;
use crate::availability::AvailabilityTracker;
use crate::config::MqttSensorConfig;
use crate::discovery::{signal_discovery_new, signal_discovery_updated, MqttDiscovery};
use crate::error::ConfigError;
use crate::router::{message_handler, Message, MessageRouter};
use crate::subscription::{
    async_subscribe_topics, async_unsubscribe_topics, SubscriptionState, TopicRequest,
};
use crate::template::ValueTemplate;

/// Discovery component this platform answers for
pub const SENSOR_COMPONENT: &str = "sensor";

struct SensorInner {
    router: Arc<MessageRouter>,
    config: RwLock<MqttSensorConfig>,
    value_template: RwLock<Option<ValueTemplate>>,
    attributes_template: RwLock<Option<ValueTemplate>>,
    availability: RwLock<Option<AvailabilityTracker>>,
    state: RwLock<Option<String>>,
    attributes: RwLock<HashMap<String, Value>>,
    /// Set when the last value outlived `expire_after`
    expired: AtomicBool,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
    cell: RwLock<Option<Weak<EntityCell>>>,
    subscriptions: tokio::sync::Mutex<SubscriptionState>,
}

impl SensorInner {
    fn rebuild_from_config(&self, config: MqttSensorConfig) -> Result<(), ConfigError> {
        let value_template = config
            .value_template
            .as_deref()
            .map(ValueTemplate::new)
            .transpose()?;
        let attributes_template = config
            .json_attributes_template
            .as_deref()
            .map(ValueTemplate::new)
            .transpose()?;
        let availability = config.availability_config().map(AvailabilityTracker::new);
        // Status reported so far survives a config rebuild
        let previous = self
            .availability
            .read()
            .ok()
            .and_then(|a| a.as_ref().map(|tracker| tracker.snapshot()));
        if let (Some(tracker), Some(previous)) = (&availability, &previous) {
            tracker.seed(previous);
        }

        if let Ok(mut slot) = self.value_template.write() {
            *slot = value_template;
        }
        if let Ok(mut slot) = self.attributes_template.write() {
            *slot = attributes_template;
        }
        if let Ok(mut slot) = self.availability.write() {
            *slot = availability;
        }
        if let Ok(mut slot) = self.config.write() {
            *slot = config;
        }
        Ok(())
    }

    fn config(&self) -> MqttSensorConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    /// Reconcile subscriptions with the current config
    async fn subscribe_topics(self: &Arc<Self>) -> Result<(), ConfigError> {
        let config = self.config();
        let mut requests = HashMap::new();

        let inner = Arc::clone(self);
        requests.insert(
            "state_topic".to_string(),
            TopicRequest {
                topic: config.state_topic.clone(),
                qos: config.qos,
                handler: message_handler(move |message: Message| {
                    let inner = Arc::clone(&inner);
                    async move { inner.handle_state_message(message).await }
                }),
            },
        );

        if let Some(topic) = &config.json_attributes_topic {
            let inner = Arc::clone(self);
            requests.insert(
                "json_attributes_topic".to_string(),
                TopicRequest {
                    topic: topic.clone(),
                    qos: config.qos,
                    handler: message_handler(move |message: Message| {
                        let inner = Arc::clone(&inner);
                        async move { inner.handle_attributes_message(message).await }
                    }),
                },
            );
        }

        let availability_topics: Vec<String> = self
            .availability
            .read()
            .ok()
            .map(|availability| {
                availability
                    .iter()
                    .flat_map(|a| a.topics().map(|e| e.topic.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (index, topic) in availability_topics.into_iter().enumerate() {
            let inner = Arc::clone(self);
            requests.insert(
                format!("availability_{}", index),
                TopicRequest {
                    topic,
                    qos: config.qos,
                    handler: message_handler(move |message: Message| {
                        let inner = Arc::clone(&inner);
                        async move { inner.handle_availability_message(message).await }
                    }),
                },
            );
        }

        let mut subscriptions = self.subscriptions.lock().await;
        async_subscribe_topics(&self.router, &mut subscriptions, requests).await
    }

    async fn handle_state_message(self: Arc<Self>, message: Message) {
        let template = self
            .value_template
            .read()
            .ok()
            .and_then(|t| t.clone());
        let value = match template {
            Some(template) => match template.render(&message.payload) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        topic = %message.topic,
                        error = %err,
                        "Error rendering value template, payload dropped"
                    );
                    return;
                }
            },
            None => message.payload,
        };

        if let Ok(mut state) = self.state.write() {
            *state = Some(value);
        }
        self.expired.store(false, Ordering::SeqCst);
        self.schedule_expiry();
        self.write_op_state().await;
    }

    async fn handle_attributes_message(self: Arc<Self>, message: Message) {
        let template = self
            .attributes_template
            .read()
            .ok()
            .and_then(|t| t.clone());
        if let Some(parsed) = parse_json_attributes(&message.payload, template.as_ref()) {
            if let Ok(mut attributes) = self.attributes.write() {
                *attributes = parsed;
            }
            self.write_op_state().await;
        }
    }

    async fn handle_availability_message(self: Arc<Self>, message: Message) {
        let recognized = self
            .availability
            .read()
            .ok()
            .map(|availability| {
                availability
                    .as_ref()
                    .map(|a| a.on_message(&message.topic, &message.payload))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if recognized {
            self.write_op_state().await;
        }
    }

    /// Restart the expiry timer for the value just received
    fn schedule_expiry(self: &Arc<Self>) {
        let expire_after = self.config.read().ok().and_then(|c| c.expire_after);

        let mut task = match self.expiry_task.lock() {
            Ok(task) => task,
            Err(_) => return,
        };
        if let Some(old) = task.take() {
            old.abort();
        }

        let Some(seconds) = expire_after else { return };
        let weak = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let Some(inner) = weak.upgrade() else { return };
            debug!("Sensor value expired");
            inner.expired.store(true, Ordering::SeqCst);
            inner.write_op_state().await;
        }));
    }

    fn stop_expiry(&self) {
        if let Ok(mut task) = self.expiry_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    async fn write_op_state(&self) {
        let cell = self
            .cell
            .read()
            .ok()
            .and_then(|c| c.as_ref().and_then(Weak::upgrade));
        if let Some(cell) = cell {
            if let Err(err) = cell.async_write_op_state().await {
                warn!(error = %err, "Failed to publish sensor state");
            }
        }
    }
}

/// A sensor fed by MQTT messages
pub struct MqttSensor {
    inner: Arc<SensorInner>,
}

impl MqttSensor {
    pub fn new(
        config: MqttSensorConfig,
        router: Arc<MessageRouter>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let inner = Arc::new(SensorInner {
            router,
            config: RwLock::new(config.clone()),
            value_template: RwLock::new(None),
            attributes_template: RwLock::new(None),
            availability: RwLock::new(None),
            state: RwLock::new(None),
            attributes: RwLock::new(HashMap::new()),
            expired: AtomicBool::new(false),
            expiry_task: Mutex::new(None),
            cell: RwLock::new(None),
            subscriptions: tokio::sync::Mutex::new(SubscriptionState::new()),
        });
        inner.rebuild_from_config(config)?;
        Ok(Arc::new(Self { inner }))
    }

    /// The entity_id assigned at attach time
    pub fn entity_id(&self) -> Option<String> {
        self.inner
            .cell
            .read()
            .ok()
            .and_then(|c| c.as_ref().and_then(Weak::upgrade))
            .and_then(|cell| cell.entity_id())
            .map(|id| id.to_string())
    }

    /// Swap in a new discovery config: templates and availability are
    /// rebuilt, subscriptions reconciled, and the state republished
    pub async fn async_apply_config(&self, config: MqttSensorConfig) -> Result<(), ConfigError> {
        self.inner.rebuild_from_config(config)?;

        // A held value follows the new expire_after window, not the one it
        // arrived under
        let holds_value = self
            .inner
            .state
            .read()
            .map(|s| s.is_some())
            .unwrap_or(false);
        if holds_value && !self.inner.expired.load(Ordering::SeqCst) {
            self.inner.schedule_expiry();
        }

        self.inner.subscribe_topics().await?;
        self.inner.write_op_state().await;
        Ok(())
    }
}

#[async_trait]
impl Entity for MqttSensor {
    fn unique_id(&self) -> Option<String> {
        self.inner.config.read().ok().and_then(|c| c.unique_id.clone())
    }

    fn name(&self) -> Option<String> {
        self.inner.config.read().ok().and_then(|c| c.name.clone())
    }

    fn suggested_object_id(&self) -> Option<String> {
        self.inner.config.read().ok().and_then(|c| c.object_id.clone())
    }

    fn icon(&self) -> Option<String> {
        self.inner.config.read().ok().and_then(|c| c.icon.clone())
    }

    fn device_class(&self) -> Option<String> {
        self.inner.config.read().ok().and_then(|c| c.device_class.clone())
    }

    fn unit_of_measurement(&self) -> Option<String> {
        self.inner
            .config
            .read()
            .ok()
            .and_then(|c| c.unit_of_measurement.clone())
    }

    fn force_update(&self) -> bool {
        self.inner.config.read().map(|c| c.force_update).unwrap_or(false)
    }

    fn available(&self) -> bool {
        if self.inner.expired.load(Ordering::SeqCst) {
            return false;
        }
        self.inner
            .availability
            .read()
            .ok()
            .map(|availability| {
                availability.as_ref().map(|a| a.available()).unwrap_or(true)
            })
            .unwrap_or(false)
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.inner
            .config
            .read()
            .ok()
            .and_then(|c| c.device.as_ref().and_then(|d| d.device_info()))
    }

    fn extra_state_attributes(&self) -> HashMap<String, Value> {
        self.inner
            .attributes
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> Option<StateValue> {
        self.inner
            .state
            .read()
            .ok()
            .and_then(|s| s.clone())
            .map(StateValue::Str)
    }

    async fn async_added_to_opp(&self, cell: &Arc<EntityCell>) {
        if let Ok(mut slot) = self.inner.cell.write() {
            *slot = Some(Arc::downgrade(cell));
        }
        if let Err(err) = self.inner.subscribe_topics().await {
            warn!(error = %err, "Failed to subscribe sensor topics");
        }
    }

    async fn async_will_remove_from_opp(&self) {
        self.inner.stop_expiry();
        let mut subscriptions = self.inner.subscriptions.lock().await;
        async_unsubscribe_topics(&mut subscriptions);
    }
}

struct DiscoveredSensor {
    entity_id: String,
    sensor: Arc<MqttSensor>,
    device_id: Option<String>,
    /// Last applied config, for skipping no-op updates
    last_config: Value,
    _update_guard: SignalGuard,
}

/// Discovery-driven lifecycle for MQTT sensors
pub struct MqttSensorPlatform {
    opp: Arc<OpenPeerPower>,
    platform: Arc<EntityPlatform>,
    router: Arc<MessageRouter>,
    discovery: Arc<MqttDiscovery>,
    discovered: Mutex<HashMap<String, DiscoveredSensor>>,
    _new_guard: Mutex<Option<SignalGuard>>,
}

/// Register the sensor component with discovery and start answering its
/// signals
pub async fn async_setup_sensor_platform(
    opp: Arc<OpenPeerPower>,
    router: Arc<MessageRouter>,
    discovery: Arc<MqttDiscovery>,
) -> Arc<MqttSensorPlatform> {
    discovery.register_validator(SENSOR_COMPONENT, |payload| {
        MqttSensorConfig::from_payload(payload).map(|_| ())
    });

    let platform = Arc::new(MqttSensorPlatform {
        platform: EntityPlatform::new(opp.clone(), SENSOR_COMPONENT, "mqtt"),
        opp: opp.clone(),
        router,
        discovery,
        discovered: Mutex::new(HashMap::new()),
        _new_guard: Mutex::new(None),
    });

    let weak = Arc::downgrade(&platform);
    let guard = opp.dispatcher.async_dispatcher_connect(
        signal_discovery_new(SENSOR_COMPONENT),
        signal_handler(move |envelope| {
            let weak = weak.clone();
            async move {
                if let Some(platform) = weak.upgrade() {
                    platform.async_discover(envelope).await;
                }
            }
        }),
    );
    if let Ok(mut slot) = platform._new_guard.lock() {
        *slot = Some(guard);
    }
    platform
}

impl MqttSensorPlatform {
    /// The underlying entity platform
    pub fn entity_platform(&self) -> &Arc<EntityPlatform> {
        &self.platform
    }

    /// Number of discovery-managed sensors
    pub fn len(&self) -> usize {
        self.discovered.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn async_discover(self: &Arc<Self>, envelope: Value) {
        let Some(hash) = envelope.get("discovery_hash").and_then(Value::as_str) else {
            return;
        };
        let hash = hash.to_string();
        let already_known = self
            .discovered
            .lock()
            .map(|d| d.contains_key(&hash))
            .unwrap_or(false);
        if already_known {
            return;
        }

        let config_value = envelope.get("config").cloned().unwrap_or(Value::Null);
        let config: MqttSensorConfig = match serde_json::from_value(config_value.clone()) {
            Ok(config) => config,
            Err(err) => {
                warn!(key = %hash, error = %err, "Discarding discovery payload");
                self.discovery.forget(&hash);
                return;
            }
        };

        let device_id = config
            .device
            .as_ref()
            .and_then(|d| d.device_info())
            .and_then(|info| self.opp.registries.devices.get_or_create(&info, None))
            .map(|device| device.id.clone());

        let sensor = match MqttSensor::new(config, self.router.clone()) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!(key = %hash, error = %err, "Invalid sensor config");
                self.discovery.forget(&hash);
                return;
            }
        };

        if let Err(err) = self
            .platform
            .async_add_entities(vec![sensor.clone() as Arc<dyn Entity>])
            .await
        {
            warn!(key = %hash, error = %err, "Failed to add discovered sensor");
            self.discovery.forget(&hash);
            return;
        }
        let Some(entity_id) = sensor.entity_id() else {
            warn!(key = %hash, "Discovered sensor was not attached");
            self.discovery.forget(&hash);
            return;
        };

        // Link the registry entry to the announced device
        if let Some(device_id) = &device_id {
            let device_id = device_id.clone();
            if let Err(err) = self.opp.registries.entities.update(&entity_id, move |entry| {
                entry.device_id = Some(device_id);
            }) {
                warn!(
                    entity_id = %entity_id,
                    error = %err,
                    "Failed to link entity to device"
                );
            }
        }

        let weak = Arc::downgrade(self);
        let update_hash = hash.clone();
        let update_guard = self.opp.dispatcher.async_dispatcher_connect(
            signal_discovery_updated(&hash),
            signal_handler(move |payload| {
                let weak = weak.clone();
                let hash = update_hash.clone();
                async move {
                    if let Some(platform) = weak.upgrade() {
                        platform.async_discovery_update(&hash, payload).await;
                    }
                }
            }),
        );

        info!(key = %hash, entity_id = %entity_id, "Added discovered sensor");
        if let Ok(mut discovered) = self.discovered.lock() {
            discovered.insert(
                hash,
                DiscoveredSensor {
                    entity_id,
                    sensor,
                    device_id,
                    last_config: config_value,
                    _update_guard: update_guard,
                },
            );
        }
    }

    async fn async_discovery_update(self: &Arc<Self>, hash: &str, envelope: Value) {
        if envelope.is_null() {
            self.async_remove_discovered(hash).await;
            return;
        }

        let config_value = envelope.get("config").cloned().unwrap_or(Value::Null);
        let config: MqttSensorConfig = match serde_json::from_value(config_value.clone()) {
            Ok(config) => config,
            Err(err) => {
                warn!(key = %hash, error = %err, "Discarding config update");
                return;
            }
        };

        // An identical payload is a no-op: nothing to re-apply
        let sensor = self.discovered.lock().ok().and_then(|mut d| {
            let entry = d.get_mut(hash)?;
            if entry.last_config == config_value {
                debug!(key = %hash, "Unchanged sensor config, skipping");
                return None;
            }
            entry.last_config = config_value.clone();
            Some(Arc::clone(&entry.sensor))
        });
        if let Some(sensor) = sensor {
            debug!(key = %hash, "Applying updated sensor config");
            if let Err(err) = sensor.async_apply_config(config).await {
                warn!(key = %hash, error = %err, "Failed to apply config update");
            }
        }
    }

    /// Tear down a sensor removed by an empty discovery payload: the
    /// entity and its registry entry are purged, and the device entry
    /// goes too once no other entity references it.
    async fn async_remove_discovered(self: &Arc<Self>, hash: &str) {
        let Some(removed) = self
            .discovered
            .lock()
            .ok()
            .and_then(|mut d| d.remove(hash))
        else {
            return;
        };

        info!(key = %hash, entity_id = %removed.entity_id, "Removing discovered sensor");
        if let Err(err) = self.platform.async_purge_entity(&removed.entity_id).await {
            warn!(error = %err, "Failed to remove sensor entity");
        }
        self.opp.registries.entities.purge(&removed.entity_id);

        if let Some(device_id) = removed.device_id {
            if self.opp.registries.entities.get_by_device_id(&device_id).is_empty() {
                debug!(device_id = %device_id, "Removing orphaned device");
                self.opp.registries.devices.async_remove_device(&device_id).await;
            }
        }
    }
}

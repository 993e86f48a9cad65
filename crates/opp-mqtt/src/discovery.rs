//! MQTT discovery
//!
//! Devices announce themselves by publishing a retained JSON config to
//! `openpeerpower/<component>/[<node_id>/]<object_id>/config`. The first
//! valid payload for a key fires the per-component "new" signal; later
//! payloads fire the per-key "updated" signal; an empty payload fires the
//! updated signal with a null payload, telling the entity to remove
//! itself. Malformed payloads are logged and leave the key's state
//! untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use opp_entity::Dispatcher;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::router::{message_handler, Message, MessageRouter, Subscription};

/// Topic prefix discovery listens under
pub const DISCOVERY_PREFIX: &str = "openpeerpower";

/// Signal fired when a config for a new key arrives
pub fn signal_discovery_new(component: &str) -> String {
    format!("mqtt_discovery_new_{}", component)
}

/// Signal fired when the config for a known key changes or is removed
pub fn signal_discovery_updated(hash: &str) -> String {
    format!("mqtt_discovery_updated_{}", hash)
}

/// Identity of one discovered config topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryKey {
    pub component: String,
    pub node_id: Option<String>,
    pub object_id: String,
}

impl DiscoveryKey {
    /// Parse a config topic under the discovery prefix
    pub fn from_topic(topic: &str) -> Option<Self> {
        let suffix = topic.strip_prefix(DISCOVERY_PREFIX)?.strip_prefix('/')?;
        let levels: Vec<&str> = suffix.split('/').collect();
        match levels.as_slice() {
            [component, object_id, "config"] => Some(Self {
                component: component.to_string(),
                node_id: None,
                object_id: object_id.to_string(),
            }),
            [component, node_id, object_id, "config"] => Some(Self {
                component: component.to_string(),
                node_id: Some(node_id.to_string()),
                object_id: object_id.to_string(),
            }),
            _ => None,
        }
    }

    /// Stable identity string, used to key the updated signal
    pub fn hash(&self) -> String {
        match &self.node_id {
            Some(node_id) => format!("{} {} {}", self.component, node_id, self.object_id),
            None => format!("{} {}", self.component, self.object_id),
        }
    }
}

type Validator = Arc<dyn Fn(&str) -> Result<(), ConfigError> + Send + Sync>;

/// Listens on the discovery topic tree and turns config payloads into
/// dispatcher signals
pub struct MqttDiscovery {
    dispatcher: Arc<Dispatcher>,
    /// Keys with a live config
    discovered: Mutex<HashSet<String>>,
    /// Per-component payload validators, registered by platforms
    validators: Mutex<HashMap<String, Validator>>,
    _subscriptions: Mutex<Vec<Subscription>>,
}

impl MqttDiscovery {
    /// Subscribe to the discovery tree and start processing
    pub async fn async_start(
        router: &Arc<MessageRouter>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Self>, ConfigError> {
        let discovery = Arc::new(Self {
            dispatcher,
            discovered: Mutex::new(HashSet::new()),
            validators: Mutex::new(HashMap::new()),
            _subscriptions: Mutex::new(Vec::new()),
        });

        let mut subscriptions = Vec::new();
        for filter in [
            format!("{}/+/+/config", DISCOVERY_PREFIX),
            format!("{}/+/+/+/config", DISCOVERY_PREFIX),
        ] {
            let weak: Weak<MqttDiscovery> = Arc::downgrade(&discovery);
            let subscription = router
                .async_subscribe(
                    &filter,
                    0,
                    message_handler(move |message: Message| {
                        let weak = weak.clone();
                        async move {
                            if let Some(discovery) = weak.upgrade() {
                                discovery.process(message).await;
                            }
                        }
                    }),
                )
                .await?;
            subscriptions.push(subscription);
        }
        if let Ok(mut subs) = discovery._subscriptions.lock() {
            *subs = subscriptions;
        }

        info!(prefix = %DISCOVERY_PREFIX, "MQTT discovery started");
        Ok(discovery)
    }

    /// Register the payload validator for a component. Payloads for
    /// components without a validator are ignored.
    pub fn register_validator<F>(&self, component: &str, validator: F)
    where
        F: Fn(&str) -> Result<(), ConfigError> + Send + Sync + 'static,
    {
        if let Ok(mut validators) = self.validators.lock() {
            validators.insert(component.to_string(), Arc::new(validator));
        }
    }

    /// Whether a key currently has a live config
    pub fn is_discovered(&self, hash: &str) -> bool {
        self.discovered
            .lock()
            .map(|d| d.contains(hash))
            .unwrap_or(false)
    }

    /// Forget a key without signalling, for entities torn down by their
    /// platform rather than by an empty payload
    pub fn forget(&self, hash: &str) {
        if let Ok(mut discovered) = self.discovered.lock() {
            discovered.remove(hash);
        }
    }

    async fn process(&self, message: Message) {
        let Some(key) = DiscoveryKey::from_topic(&message.topic) else {
            return;
        };
        let hash = key.hash();

        if message.payload.is_empty() {
            let was_discovered = self
                .discovered
                .lock()
                .map(|mut d| d.remove(&hash))
                .unwrap_or(false);
            if was_discovered {
                info!(key = %hash, "Component removed by empty discovery payload");
                self.dispatcher
                    .async_dispatcher_send(&signal_discovery_updated(&hash), Value::Null)
                    .await;
            }
            return;
        }

        let validator = self
            .validators
            .lock()
            .ok()
            .and_then(|v| v.get(&key.component).map(Arc::clone));
        let Some(validator) = validator else {
            debug!(component = %key.component, "Ignoring unsupported discovery component");
            return;
        };

        if let Err(err) = validator(&message.payload) {
            warn!(
                topic = %message.topic,
                error = %err,
                "Invalid discovery payload, ignoring"
            );
            return;
        }

        let payload: Value = match serde_json::from_str(&message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic = %message.topic, error = %err, "Unparsable discovery payload");
                return;
            }
        };

        let envelope = json!({
            "discovery_hash": hash,
            "discovery_topic": message.topic,
            "config": payload,
        });

        let newly_discovered = self
            .discovered
            .lock()
            .map(|mut d| d.insert(hash.clone()))
            .unwrap_or(false);

        if newly_discovered {
            info!(key = %hash, "Found new component");
            self.dispatcher
                .async_dispatcher_send(&signal_discovery_new(&key.component), envelope)
                .await;
        } else {
            debug!(key = %hash, "Component config updated");
            self.dispatcher
                .async_dispatcher_send(&signal_discovery_updated(&hash), envelope)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_without_node_id() {
        let key =
            DiscoveryKey::from_topic("openpeerpower/sensor/garden_temp/config").unwrap();
        assert_eq!(key.component, "sensor");
        assert_eq!(key.node_id, None);
        assert_eq!(key.object_id, "garden_temp");
        assert_eq!(key.hash(), "sensor garden_temp");
    }

    #[test]
    fn test_key_with_node_id() {
        let key =
            DiscoveryKey::from_topic("openpeerpower/sensor/node1/temp/config").unwrap();
        assert_eq!(key.node_id.as_deref(), Some("node1"));
        assert_eq!(key.hash(), "sensor node1 temp");
    }

    #[test]
    fn test_non_config_topics_rejected() {
        assert!(DiscoveryKey::from_topic("openpeerpower/sensor/garden/state").is_none());
        assert!(DiscoveryKey::from_topic("other/sensor/garden/config").is_none());
        assert!(DiscoveryKey::from_topic("openpeerpower/sensor/config").is_none());
    }
}

//! In-process MQTT message routing
//!
//! The `MessageRouter` is the seam between the broker transport and
//! everything above it: subscribers register wildcard filters, publishes
//! fan out to matching handlers in subscription order, and retained
//! messages replay to late subscribers. The broker client attaches through
//! a bridge channel and mirrors filter subscriptions to the wire; tests
//! drive the router directly without a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::topic::{topic_matches_filter, valid_publish_topic, valid_subscribe_topic};

/// An MQTT message as seen by subscribers
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// An async handler for inbound messages
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`]
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Commands the router sends to the attached broker client
#[derive(Debug)]
pub enum BridgeCommand {
    Subscribe { filter: String, qos: u8 },
    Unsubscribe { filter: String },
}

struct RouterSubscription {
    id: u64,
    filter: String,
    qos: u8,
    handler: MessageHandler,
}

/// Filter-keyed message fan-out with retained replay
pub struct MessageRouter {
    /// Active subscriptions in registration order
    subscriptions: Mutex<Vec<RouterSubscription>>,
    /// Last retained payload per topic
    retained: Mutex<HashMap<String, Message>>,
    next_id: AtomicU64,
    /// Total subscriptions ever registered
    subscribe_count: AtomicU64,
    bridge: Mutex<Option<mpsc::UnboundedSender<BridgeCommand>>>,
}

impl MessageRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: Mutex::new(Vec::new()),
            retained: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            subscribe_count: AtomicU64::new(0),
            bridge: Mutex::new(None),
        })
    }

    /// Attach the broker client. Returns the receiving end of the bridge
    /// and replays every active filter so the wire catches up.
    pub fn attach_bridge(&self) -> mpsc::UnboundedReceiver<BridgeCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(subscriptions) = self.subscriptions.lock() {
            for sub in subscriptions.iter() {
                let _ = tx.send(BridgeCommand::Subscribe {
                    filter: sub.filter.clone(),
                    qos: sub.qos,
                });
            }
        }
        if let Ok(mut bridge) = self.bridge.lock() {
            *bridge = Some(tx);
        }
        rx
    }

    fn bridge_send(&self, command: BridgeCommand) {
        if let Ok(bridge) = self.bridge.lock() {
            if let Some(tx) = bridge.as_ref() {
                let _ = tx.send(command);
            }
        }
    }

    /// Subscribe a handler to a topic filter.
    ///
    /// Retained messages matching the filter replay immediately. The
    /// subscription lives until the returned guard is dropped.
    pub async fn async_subscribe(
        self: &Arc<Self>,
        filter: &str,
        qos: u8,
        handler: MessageHandler,
    ) -> Result<Subscription, ConfigError> {
        valid_subscribe_topic(filter)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribe_count.fetch_add(1, Ordering::Relaxed);
        trace!(filter = %filter, qos, "Subscribing");

        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(RouterSubscription {
                id,
                filter: filter.to_string(),
                qos,
                handler: Arc::clone(&handler),
            });
        }
        self.bridge_send(BridgeCommand::Subscribe {
            filter: filter.to_string(),
            qos,
        });

        let replay: Vec<Message> = self
            .retained
            .lock()
            .map(|retained| {
                retained
                    .values()
                    .filter(|m| topic_matches_filter(filter, &m.topic))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for message in replay {
            handler(message).await;
        }

        Ok(Subscription {
            router: Arc::downgrade(self),
            id,
            filter: filter.to_string(),
        })
    }

    /// Deliver a message to every matching subscriber, in subscription
    /// order. A retained message is stored for replay; a retained empty
    /// payload clears the stored message.
    pub async fn async_publish(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<(), ConfigError> {
        valid_publish_topic(topic)?;

        let message = Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
        };

        if retain {
            if let Ok(mut retained) = self.retained.lock() {
                if payload.is_empty() {
                    retained.remove(topic);
                } else {
                    retained.insert(topic.to_string(), message.clone());
                }
            }
        }

        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .lock()
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .filter(|s| topic_matches_filter(&s.filter, topic))
                    .map(|s| Arc::clone(&s.handler))
                    .collect()
            })
            .unwrap_or_default();

        trace!(topic = %topic, handlers = handlers.len(), "Routing message");
        for handler in handlers {
            handler(message.clone()).await;
        }
        Ok(())
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Total subscriptions ever registered, live or since dropped
    pub fn total_subscribe_calls(&self) -> u64 {
        self.subscribe_count.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: u64, filter: &str) {
        let last_for_filter = self
            .subscriptions
            .lock()
            .map(|mut subscriptions| {
                subscriptions.retain(|s| s.id != id);
                !subscriptions.iter().any(|s| s.filter == filter)
            })
            .unwrap_or(false);

        if last_for_filter {
            debug!(filter = %filter, "Last subscriber gone, unsubscribing from broker");
            self.bridge_send(BridgeCommand::Unsubscribe {
                filter: filter.to_string(),
            });
        }
    }
}

/// Cancels a router subscription when dropped
pub struct Subscription {
    router: Weak<MessageRouter>,
    id: u64,
    filter: String,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.id, &self.filter);
        }
    }
}

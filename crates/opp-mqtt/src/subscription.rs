//! Declarative subscription management for entities
//!
//! An entity declares the set of topics it wants as named requests; the
//! helper diffs that set against what is already held and only touches the
//! subscriptions that changed. A request whose (topic, qos) pair is
//! unchanged keeps its existing subscription untouched, so a config
//! republish with identical topics causes zero broker traffic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::router::{MessageHandler, MessageRouter, Subscription};

/// A named topic request from an entity
pub struct TopicRequest {
    pub topic: String,
    pub qos: u8,
    pub handler: MessageHandler,
}

struct ActiveSubscription {
    topic: String,
    qos: u8,
    _subscription: Subscription,
}

/// The subscriptions an entity currently holds, keyed by request name
#[derive(Default)]
pub struct SubscriptionState {
    active: HashMap<String, ActiveSubscription>,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Reconcile held subscriptions with the requested set.
///
/// Requests absent from the new set are dropped, changed (topic, qos)
/// pairs are resubscribed, and unchanged pairs are left alone.
pub async fn async_subscribe_topics(
    router: &Arc<MessageRouter>,
    state: &mut SubscriptionState,
    requests: HashMap<String, TopicRequest>,
) -> Result<(), ConfigError> {
    state.active.retain(|key, _| requests.contains_key(key));

    for (key, request) in requests {
        if let Some(active) = state.active.get(&key) {
            if active.topic == request.topic && active.qos == request.qos {
                continue;
            }
        }

        let subscription = router
            .async_subscribe(&request.topic, request.qos, request.handler)
            .await?;
        // Insert replaces (and thereby drops) any stale subscription
        state.active.insert(
            key,
            ActiveSubscription {
                topic: request.topic,
                qos: request.qos,
                _subscription: subscription,
            },
        );
    }
    Ok(())
}

/// Drop every held subscription
pub fn async_unsubscribe_topics(state: &mut SubscriptionState) {
    state.active.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::message_handler;

    fn noop_request(topic: &str, qos: u8) -> TopicRequest {
        TopicRequest {
            topic: topic.to_string(),
            qos,
            handler: message_handler(|_| async {}),
        }
    }

    #[tokio::test]
    async fn test_unchanged_request_not_resubscribed() {
        let router = MessageRouter::new();
        let mut state = SubscriptionState::new();

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/state", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();
        assert_eq!(router.total_subscribe_calls(), 1);

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/state", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();

        assert_eq!(router.total_subscribe_calls(), 1);
        assert_eq!(router.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_changed_topic_resubscribes() {
        let router = MessageRouter::new();
        let mut state = SubscriptionState::new();

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/old", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/new", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();

        assert_eq!(router.total_subscribe_calls(), 2);
        // The old subscription was dropped
        assert_eq!(router.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_removed_request_unsubscribes() {
        let router = MessageRouter::new();
        let mut state = SubscriptionState::new();

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/state", 0));
        requests.insert("attrs".to_string(), noop_request("sensor/attrs", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();
        assert_eq!(state.len(), 2);

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/state", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();

        assert_eq!(state.len(), 1);
        assert_eq!(router.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let router = MessageRouter::new();
        let mut state = SubscriptionState::new();

        let mut requests = HashMap::new();
        requests.insert("state".to_string(), noop_request("sensor/state", 0));
        async_subscribe_topics(&router, &mut state, requests).await.unwrap();

        async_unsubscribe_topics(&mut state);
        assert!(state.is_empty());
        assert_eq!(router.subscription_count(), 0);
    }
}

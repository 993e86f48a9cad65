//! Signal-keyed dispatcher
//!
//! Loosely couples producers and consumers by string signal: MQTT discovery
//! announces new and updated configs through signals, and platforms connect
//! handlers without either side holding a direct reference. Delivery is
//! sequential per send; disconnection happens when the returned guard is
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::trace;

/// An async handler for a signal
pub type SignalHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`SignalHandler`]
pub fn signal_handler<F, Fut>(f: F) -> SignalHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Signal-keyed pub/sub dispatcher
#[derive(Default)]
pub struct Dispatcher {
    targets: Mutex<HashMap<String, Vec<(u64, SignalHandler)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a handler to a signal.
    ///
    /// The connection lives until the returned guard is dropped.
    pub fn async_dispatcher_connect(
        self: &Arc<Self>,
        signal: impl Into<String>,
        handler: SignalHandler,
    ) -> SignalGuard {
        let signal = signal.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        trace!(signal = %signal, "Connecting dispatcher handler");
        if let Ok(mut targets) = self.targets.lock() {
            targets.entry(signal.clone()).or_default().push((id, handler));
        }

        SignalGuard {
            dispatcher: Arc::downgrade(self),
            signal,
            id,
        }
    }

    /// Send a payload to every handler connected to a signal.
    ///
    /// Handlers run sequentially in connection order.
    pub async fn async_dispatcher_send(&self, signal: &str, payload: Value) {
        let handlers: Vec<SignalHandler> = self
            .targets
            .lock()
            .ok()
            .and_then(|targets| {
                targets
                    .get(signal)
                    .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            })
            .unwrap_or_default();

        trace!(signal = %signal, handlers = handlers.len(), "Dispatching signal");
        for handler in handlers {
            handler(payload.clone()).await;
        }
    }

    /// Number of handlers connected to a signal
    pub fn handler_count(&self, signal: &str) -> usize {
        self.targets
            .lock()
            .ok()
            .and_then(|t| t.get(signal).map(|hs| hs.len()))
            .unwrap_or(0)
    }

    fn disconnect(&self, signal: &str, id: u64) {
        if let Ok(mut targets) = self.targets.lock() {
            if let Some(handlers) = targets.get_mut(signal) {
                handlers.retain(|(hid, _)| *hid != id);
                if handlers.is_empty() {
                    targets.remove(signal);
                }
            }
        }
    }
}

/// Disconnects a dispatcher handler when dropped
pub struct SignalGuard {
    dispatcher: Weak<Dispatcher>,
    signal: String,
    id: u64,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.disconnect(&self.signal, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_connect_and_send() {
        let dispatcher = Arc::new(Dispatcher::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let _guard = dispatcher.async_dispatcher_connect(
            "test_signal",
            signal_handler(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        dispatcher
            .async_dispatcher_send("test_signal", json!({"k": 1}))
            .await;
        dispatcher
            .async_dispatcher_send("other_signal", json!({}))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_drop_disconnects() {
        let dispatcher = Arc::new(Dispatcher::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let guard = dispatcher.async_dispatcher_connect(
            "test_signal",
            signal_handler(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        assert_eq!(dispatcher.handler_count("test_signal"), 1);
        drop(guard);
        assert_eq!(dispatcher.handler_count("test_signal"), 0);

        dispatcher.async_dispatcher_send("test_signal", json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_delivery_order() {
        let dispatcher = Arc::new(Dispatcher::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        let _g1 = dispatcher.async_dispatcher_connect(
            "sig",
            signal_handler(move |_| {
                let o = o1.clone();
                async move {
                    o.lock().unwrap().push(1);
                }
            }),
        );
        let o2 = order.clone();
        let _g2 = dispatcher.async_dispatcher_connect(
            "sig",
            signal_handler(move |_| {
                let o = o2.clone();
                async move {
                    o.lock().unwrap().push(2);
                }
            }),
        );

        dispatcher.async_dispatcher_send("sig", json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}

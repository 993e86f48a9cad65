//! Broker transport over rumqttc
//!
//! `MqttClient` attaches the router to a real broker: the event loop
//! feeds inbound publishes into the router, and a bridge task mirrors the
//! router's filter subscriptions to the wire. Connection setup waits for
//! the broker acknowledgement so callers can retry later when the broker
//! is down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opp_core::OppError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::router::{BridgeCommand, MessageRouter};

/// Gives each client instance a unique default client id
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keepalive: Duration::from_secs(30),
        }
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// A connected broker client bound to a [`MessageRouter`]
pub struct MqttClient {
    client: AsyncClient,
    event_task: JoinHandle<()>,
    bridge_task: JoinHandle<()>,
}

impl MqttClient {
    /// Connect to the broker and bind the router.
    ///
    /// Fails with `ConfigEntryNotReady` when the broker does not
    /// acknowledge within the connect timeout.
    pub async fn async_connect(
        config: MqttConfig,
        router: Arc<MessageRouter>,
    ) -> Result<Self, OppError> {
        let client_id = config.client_id.clone().unwrap_or_else(|| {
            format!(
                "openpeerpower-{}",
                CLIENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
            )
        });

        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(config.keepalive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        Self::await_connack(&mut event_loop, &router).await?;
        info!(host = %config.host, port = config.port, "Connected to MQTT broker");

        let bridge_rx = router.attach_bridge();
        let bridge_client = client.clone();
        let bridge_task = tokio::spawn(async move {
            let mut bridge_rx = bridge_rx;
            while let Some(command) = bridge_rx.recv().await {
                let result = match command {
                    BridgeCommand::Subscribe { filter, qos } => {
                        debug!(filter = %filter, "Subscribing on broker");
                        bridge_client.subscribe(filter, qos_from_u8(qos)).await
                    }
                    BridgeCommand::Unsubscribe { filter } => {
                        debug!(filter = %filter, "Unsubscribing on broker");
                        bridge_client.unsubscribe(filter).await
                    }
                };
                if let Err(err) = result {
                    warn!(error = %err, "Broker subscription change failed");
                }
            }
        });

        let event_task = tokio::spawn(Self::run_event_loop(event_loop, router));

        Ok(Self {
            client,
            event_task,
            bridge_task,
        })
    }

    /// Poll until the broker acknowledges the connection, feeding any
    /// early publishes to the router
    async fn await_connack(
        event_loop: &mut EventLoop,
        router: &Arc<MessageRouter>,
    ) -> Result<(), OppError> {
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, event_loop.poll())
                .await
                .map_err(|_| {
                    OppError::ConfigEntryNotReady("timed out waiting for broker".to_string())
                })?;
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    Self::route_publish(router, publish).await;
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(OppError::ConfigEntryNotReady(format!(
                        "broker connection failed: {}",
                        err
                    )))
                }
            }
        }
    }

    async fn run_event_loop(mut event_loop: EventLoop, router: Arc<MessageRouter>) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    Self::route_publish(&router, publish).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "MQTT connection error, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn route_publish(router: &Arc<MessageRouter>, publish: rumqttc::Publish) {
        let payload = match String::from_utf8(publish.payload.to_vec()) {
            Ok(payload) => payload,
            Err(_) => {
                warn!(topic = %publish.topic, "Dropping non-UTF-8 payload");
                return;
            }
        };
        let message_retained = publish.retain;
        if let Err(err) = router
            .async_publish(&publish.topic, &payload, publish.qos as u8, message_retained)
            .await
        {
            warn!(topic = %publish.topic, error = %err, "Failed to route inbound message");
        }
    }

    /// Publish to the broker
    pub async fn async_publish(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<(), OppError> {
        self.client
            .publish(topic, qos_from_u8(qos), retain, payload)
            .await
            .map_err(|err| OppError::Platform(format!("mqtt publish failed: {}", err)))
    }

    /// Disconnect and stop the background tasks
    pub async fn async_disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "Disconnect failed, connection may already be down");
        }
        self.event_task.abort();
        self.bridge_task.abort();
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.event_task.abort();
        self.bridge_task.abort();
    }
}

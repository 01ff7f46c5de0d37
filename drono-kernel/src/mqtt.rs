/**
 * MQTT BRIDGE - mirrors kernel events to a broker
 *
 * ROLE: a bus subscriber on channel `mqtt` that publishes every event as JSON
 * to `{prefix}/{event type}`, plus one inbound topic,
 * `{prefix}/request-status`, that triggers a manual full refresh.
 *
 * CONNECTION: rumqttc event loop in its own task. Connection state and
 * reconnects are reported to the HealthTracker; the request topic is
 * re-subscribed on every ConnAck. While the broker is unreachable, events
 * that do not fit the client's request queue are dropped.
 */

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::Subscriber;
use crate::config::MqttConf;
use crate::error::DeliveryError;
use crate::events::KernelEvent;
use crate::kernel::Kernel;

pub const MQTT_CHANNEL: &str = "mqtt";

/// Where the bridge sends serialized events. Implemented by the rumqttc client.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeliveryError>;
}

#[async_trait]
impl EventPublisher for AsyncClient {
    async fn publish_event(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeliveryError> {
        // The request queue only drains while the event loop is connected.
        // A full queue drops this event and keeps the bridge subscribed.
        if let Err(e) = self.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            warn!("[mqtt] broker queue unavailable, dropping {}: {}", topic, e);
        }
        Ok(())
    }
}

pub fn event_topic(prefix: &str, event: &KernelEvent) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), event.kind())
}

pub fn request_status_topic(prefix: &str) -> String {
    format!("{}/request-status", prefix.trim_end_matches('/'))
}

pub struct MqttBridge<P> {
    publisher: P,
    topic_prefix: String,
}

impl<P: EventPublisher> MqttBridge<P> {
    pub fn new(publisher: P, topic_prefix: impl Into<String>) -> Self {
        Self {
            publisher,
            topic_prefix: topic_prefix.into(),
        }
    }
}

#[async_trait]
impl<P: EventPublisher> Subscriber<KernelEvent> for MqttBridge<P> {
    fn name(&self) -> &str {
        "mqtt-bridge"
    }

    async fn deliver(&self, event: &KernelEvent) -> Result<(), DeliveryError> {
        let payload = serde_json::to_vec(event).map_err(|e| DeliveryError::Transport(e.to_string()))?;
        self.publisher
            .publish_event(&event_topic(&self.topic_prefix, event), payload)
            .await
    }
}

/// Connects to the broker, subscribes the bridge to the bus and drives the
/// event loop until the process exits.
pub fn spawn_mqtt_bridge(cfg: &MqttConf, kernel: Kernel) -> anyhow::Result<JoinHandle<()>> {
    anyhow::ensure!(
        !cfg.client_id.is_empty() && !cfg.client_id.starts_with(' '),
        "invalid MQTT client id {:?}",
        cfg.client_id
    );

    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    let request_topic = request_status_topic(&cfg.topic_prefix);
    kernel.bus.subscribe(
        MQTT_CHANNEL,
        Arc::new(MqttBridge::new(client.clone(), cfg.topic_prefix.clone())),
    );
    kernel.health.mark_mqtt_connecting();
    info!("[mqtt] bridging events to {}:{}", cfg.host, cfg.port);

    Ok(tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    kernel.health.mark_mqtt_connected();
                    if let Err(e) = client.try_subscribe(request_topic.as_str(), QoS::AtLeastOnce) {
                        warn!("[mqtt] subscribe {} failed: {}", request_topic, e);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == request_topic => {
                    debug!("[mqtt] status refresh requested");
                    let kernel = kernel.clone();
                    tokio::spawn(async move {
                        kernel.broadcaster.request_full_refresh().await;
                    });
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => kernel.health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    warn!("[mqtt] connection error: {}", e);
                    kernel.health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }))
}

/*!
Client MQTT simulé pour tests sans broker

Implémente `EventPublisher`: le pont MQTT du kernel publie ici et chaque
message est enregistré pour les assertions. Le client peut aussi simuler une
connexion perdue.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use drono_kernel::error::DeliveryError;
use drono_kernel::mqtt::EventPublisher;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published: Arc<Mutex<Vec<MockMessage>>>,
    offline: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toute publication échoue tant que le client est hors ligne.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier message d'un topic, décodé en JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl EventPublisher for MockMqttClient {
    async fn publish_event(&self, topic: &str, payload: Vec<u8>) -> Result<(), DeliveryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeliveryError::Transport("connection lost".into()));
        }
        log::debug!("[mock-mqtt] {} ({} bytes)", topic, payload.len());
        self.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

/*!
Test Harness pour le kernel Drono

Câble un `Kernel` complet sur une `MockProbe`:
- abonnés d'enregistrement pour inspecter les événements du bus
- abonné défaillant pour vérifier le retrait automatique
- attente bornée des événements (compatible avec le temps simulé de tokio)
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use drono_kernel::bus::{Subscriber, SubscriberHandle};
use drono_kernel::config::KernelConfig;
use drono_kernel::error::DeliveryError;
use drono_kernel::events::KernelEvent;
use drono_kernel::Kernel;

use crate::mock_probe::MockProbe;

/// Abonné qui garde tout ce qu'il reçoit.
pub struct RecordingSubscriber {
    name: String,
    events: Mutex<Vec<KernelEvent>>,
}

impl RecordingSubscriber {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<KernelEvent> {
        self.events.lock().clone()
    }

    /// Événements dont le `type` vaut `kind`.
    pub fn of_kind(&self, kind: &str) -> Vec<KernelEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl Subscriber<KernelEvent> for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, message: &KernelEvent) -> Result<(), DeliveryError> {
        self.events.lock().push(message.clone());
        Ok(())
    }
}

/// Abonné dont chaque livraison échoue.
#[derive(Default)]
pub struct FailingSubscriber {
    attempts: AtomicUsize,
}

impl FailingSubscriber {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber<KernelEvent> for FailingSubscriber {
    fn name(&self) -> &str {
        "failing"
    }

    async fn deliver(&self, _message: &KernelEvent) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Disconnected)
    }
}

/// Kernel complet sur probe scriptée.
pub struct TestHarness {
    pub probe: Arc<MockProbe>,
    pub kernel: Kernel,
}

impl TestHarness {
    /// Config par défaut sans pacing sur le bus.
    pub fn new() -> Self {
        let mut cfg = KernelConfig::default();
        cfg.broadcast.pacing_ms = 0;
        Self::with_config(cfg)
    }

    pub fn with_config(cfg: KernelConfig) -> Self {
        env_logger::try_init().ok();

        let probe = Arc::new(MockProbe::new());
        let kernel = Kernel::build(&cfg, probe.clone(), probe.clone(), probe.clone());
        Self { probe, kernel }
    }

    /// Abonne un enregistreur à `channel`.
    pub fn record(&self, channel: &str) -> (SubscriberHandle, Arc<RecordingSubscriber>) {
        let recorder = RecordingSubscriber::new(format!("recorder:{}", channel));
        let handle = self.kernel.bus.subscribe(channel, recorder.clone());
        (handle, recorder)
    }

    /// Démarre le worker de la file du bus.
    pub fn start_bus(&self) {
        let _ = self.kernel.bus.spawn_worker();
    }

    /// Attend que `recorder` ait reçu au moins `count` événements du type `kind`.
    pub async fn wait_for(
        &self,
        recorder: &RecordingSubscriber,
        kind: &str,
        count: usize,
        within: Duration,
    ) -> Vec<KernelEvent> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let seen = recorder.of_kind(kind);
            if seen.len() >= count || tokio::time::Instant::now() >= deadline {
                if seen.len() < count {
                    log::warn!("timed out waiting for {} x {} (got {})", count, kind, seen.len());
                }
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

//! Wiring of the core components.
//!
//! `Kernel` is a bundle of shared handles; cloning it is cheap and every clone
//! talks to the same cache, bus and broadcaster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcaster::{BroadcastConfig, StatusBroadcaster};
use crate::bus::ChannelBus;
use crate::cache::DeviceCache;
use crate::commands::{CommandExecutor, CommandOutcome, CommandParams, DeviceAction};
use crate::config::KernelConfig;
use crate::error::CommandError;
use crate::events::KernelEvent;
use crate::fanout::FanOutScheduler;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{DeviceInfo, DeviceStatus};
use crate::probe::{DeviceDirectory, Probe};
use crate::reconcile::Reconciler;

#[derive(Clone)]
pub struct Kernel {
    pub cache: Arc<DeviceCache>,
    pub fanout: Arc<FanOutScheduler>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub bus: Arc<ChannelBus<KernelEvent>>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub executor: Arc<dyn CommandExecutor>,
    pub health: HealthTracker,
}

impl Kernel {
    pub fn build(
        cfg: &KernelConfig,
        probe: Arc<dyn Probe>,
        directory: Arc<dyn DeviceDirectory>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let cache = Arc::new(DeviceCache::new(
            probe,
            Reconciler::standard(None),
            cfg.cache.policy(),
            cfg.probes.timeouts(),
        ));
        let fanout = Arc::new(FanOutScheduler::new(
            cache.clone(),
            cfg.fanout.max_concurrent,
            Duration::from_millis(cfg.fanout.refresh_deadline_ms),
        ));
        let bus = Arc::new(ChannelBus::new(Duration::from_millis(cfg.broadcast.pacing_ms)));
        let broadcaster = Arc::new(StatusBroadcaster::new(
            fanout.clone(),
            directory.clone(),
            bus.clone(),
            BroadcastConfig::standard(cfg.broadcast.automatic, cfg.broadcast.interval_secs),
        ));

        Self {
            cache,
            fanout,
            broadcaster,
            bus,
            directory,
            executor,
            health: HealthTracker::new(),
        }
    }

    /// Spawns the bus worker and the broadcaster loop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        if let Some(worker) = self.bus.spawn_worker() {
            handles.push(worker);
        }
        handles.push(self.broadcaster.spawn());
        info!("[kernel] background tasks started");
        handles
    }

    /// Current device listing; empty when the directory is unreachable.
    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        match self.directory.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("[kernel] device listing failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Lists devices and queues a `device_list` event.
    pub async fn scan_devices(&self) -> Vec<DeviceInfo> {
        let devices = self.list_devices().await;
        info!("[kernel] scan found {} devices", devices.len());
        self.bus.enqueue(KernelEvent::device_list(devices.clone()));
        devices
    }

    pub async fn all_statuses(&self) -> BTreeMap<String, DeviceStatus> {
        let ids = self.broadcaster.device_ids().await;
        self.fanout.refresh_all(&ids, false).await
    }

    pub async fn device_status(&self, device_id: &str, force_full: bool) -> DeviceStatus {
        self.cache.get_status(device_id, force_full).await
    }

    /// Runs `command` on one device and queues a `command_result` event.
    /// A successful command is followed by a forced refresh of that device.
    pub async fn execute_command(
        &self,
        device_id: &str,
        command: &str,
        params: &CommandParams,
    ) -> Result<CommandOutcome, CommandError> {
        let action: DeviceAction = command.parse()?;
        let outcome = self.executor.execute(device_id, action, params).await;
        info!(
            "[kernel] {} on {}: {}",
            action,
            device_id,
            if outcome.success { "ok" } else { "failed" }
        );

        self.bus.enqueue(KernelEvent::CommandResult {
            device_id: device_id.to_string(),
            command: action.to_string(),
            result: outcome.clone(),
        });
        if outcome.success {
            self.cache.get_status(device_id, true).await;
        }
        Ok(outcome)
    }

    pub fn health(&self) -> KernelHealth {
        self.health
            .get_health(&self.cache, &self.bus, self.broadcaster.config())
    }
}

/**
 * STATUS BROADCASTER - periodic refresh turned into minimal diff events
 *
 * ROLE: while automatic mode is on, every `interval` it refreshes all known
 * devices, keeps only the records that changed since the last emission and
 * queues one partial `status_update` on the bus.
 *
 * CONFIG: a `BroadcastConfig` held in a watch channel. `set_config` and
 * `set_extended_interval` replace it in one step; the loop reads it at the
 * start of each cycle and wakes up early when it changes.
 *
 * ORDERING: cycles never overlap. The change detector is locked for the whole
 * cycle, and a manual full refresh takes the same lock.
 */

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::ChannelBus;
use crate::events::KernelEvent;
use crate::fanout::FanOutScheduler;
use crate::models::DeviceStatus;
use crate::probe::DeviceDirectory;

pub const MIN_INTERVAL_SECS: u64 = 5;
pub const MAX_INTERVAL_SECS: u64 = 3600;
pub const EXTENDED_MIN_INTERVAL_SECS: u64 = 60;
pub const EXTENDED_MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastConfig {
    pub automatic: bool,
    /// Seconds between two cycles.
    pub interval: u64,
}

impl BroadcastConfig {
    /// Standard mode: interval clamped to 5 s..=1 h.
    pub fn standard(automatic: bool, interval_secs: u64) -> Self {
        Self {
            automatic,
            interval: interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS),
        }
    }

    /// Extended mode: interval clamped to 1 min..=24 h, automatic updates off.
    pub fn extended(minutes: u64) -> Self {
        Self {
            automatic: false,
            interval: minutes
                .saturating_mul(60)
                .clamp(EXTENDED_MIN_INTERVAL_SECS, EXTENDED_MAX_INTERVAL_SECS),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn to_event(&self) -> KernelEvent {
        KernelEvent::StatusUpdateConfig {
            automatic: self.automatic,
            interval: self.interval,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// "1 hour(s) and 30 minute(s)", "15 minute(s)", "45 seconds".
pub fn describe_interval(secs: u64) -> String {
    if secs >= 3600 {
        let minutes = (secs % 3600) / 60;
        if minutes > 0 {
            format!("{} hour(s) and {} minute(s)", secs / 3600, minutes)
        } else {
            format!("{} hour(s)", secs / 3600)
        }
    } else if secs >= 60 {
        format!("{} minute(s)", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

/// Remembers what was last emitted per device.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last_broadcasted: HashMap<String, DeviceStatus>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that are new or differ from the last emission; those become the
    /// new baseline. `last_update` alone never counts as a change.
    pub fn diff(&mut self, current: &BTreeMap<String, DeviceStatus>) -> BTreeMap<String, DeviceStatus> {
        let mut changed = BTreeMap::new();
        for (id, status) in current {
            let unchanged = self
                .last_broadcasted
                .get(id)
                .is_some_and(|prev| prev.same_telemetry(status));
            if !unchanged {
                self.last_broadcasted.insert(id.clone(), status.clone());
                changed.insert(id.clone(), status.clone());
            }
        }
        changed
    }

    /// Makes every record in `current` the new baseline.
    pub fn record_all(&mut self, current: &BTreeMap<String, DeviceStatus>) {
        for (id, status) in current {
            self.last_broadcasted.insert(id.clone(), status.clone());
        }
    }

    pub fn last(&self, device_id: &str) -> Option<&DeviceStatus> {
        self.last_broadcasted.get(device_id)
    }
}

pub struct StatusBroadcaster {
    fanout: Arc<FanOutScheduler>,
    directory: Arc<dyn DeviceDirectory>,
    bus: Arc<ChannelBus<KernelEvent>>,
    config: watch::Sender<BroadcastConfig>,
    detector: Mutex<ChangeDetector>,
}

impl StatusBroadcaster {
    pub fn new(
        fanout: Arc<FanOutScheduler>,
        directory: Arc<dyn DeviceDirectory>,
        bus: Arc<ChannelBus<KernelEvent>>,
        initial: BroadcastConfig,
    ) -> Self {
        let (config, _) = watch::channel(initial);
        Self {
            fanout,
            directory,
            bus,
            config,
            detector: Mutex::new(ChangeDetector::new()),
        }
    }

    pub fn config(&self) -> BroadcastConfig {
        *self.config.borrow()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<BroadcastConfig> {
        self.config.subscribe()
    }

    pub fn set_config(&self, automatic: bool, interval_secs: u64) -> BroadcastConfig {
        self.apply(BroadcastConfig::standard(automatic, interval_secs))
    }

    pub fn set_extended_interval(&self, minutes: u64) -> BroadcastConfig {
        self.apply(BroadcastConfig::extended(minutes))
    }

    fn apply(&self, cfg: BroadcastConfig) -> BroadcastConfig {
        self.config.send_replace(cfg);
        info!(
            "[broadcaster] automatic updates {}, interval {}",
            if cfg.automatic { "enabled" } else { "disabled" },
            describe_interval(cfg.interval)
        );
        self.bus.enqueue(cfg.to_event());
        cfg
    }

    /// Ids from the directory, or the cache's ids when the directory fails.
    pub async fn device_ids(&self) -> Vec<String> {
        match self.directory.list_devices().await {
            Ok(devices) => devices.into_iter().map(|d| d.id).collect(),
            Err(e) => {
                warn!("[broadcaster] device listing failed, using cached ids: {}", e);
                self.fanout.cache().known_devices()
            }
        }
    }

    /// One automatic cycle. Returns the number of devices in the emitted diff.
    pub async fn run_cycle(&self) -> usize {
        let mut detector = self.detector.lock().await;
        let ids = self.device_ids().await;
        let statuses = self.fanout.refresh_all(&ids, false).await;
        let changed = detector.diff(&statuses);
        let count = changed.len();
        if count > 0 {
            debug!("[broadcaster] {} of {} devices changed", count, statuses.len());
            self.bus.enqueue(KernelEvent::status_update(changed, true));
        }
        count
    }

    /// Forced full refresh of every device, emitted whole with `is_partial=false`.
    pub async fn request_full_refresh(&self) -> BTreeMap<String, DeviceStatus> {
        let mut detector = self.detector.lock().await;
        let ids = self.device_ids().await;
        let statuses = self.fanout.refresh_all(&ids, true).await;
        detector.record_all(&statuses);
        info!("[broadcaster] manual full refresh of {} devices", statuses.len());
        self.bus.enqueue(KernelEvent::status_update(statuses.clone(), false));
        statuses
    }

    /// Background loop. A panicking cycle is logged and the loop carries on.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut config_rx = self.config.subscribe();
        tokio::spawn(async move {
            loop {
                let cfg = *config_rx.borrow_and_update();
                if cfg.automatic {
                    match AssertUnwindSafe(this.run_cycle()).catch_unwind().await {
                        Ok(changed) => debug!("[broadcaster] cycle done, {} changed", changed),
                        Err(_) => error!("[broadcaster] status cycle panicked"),
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(cfg.period()) => {}
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

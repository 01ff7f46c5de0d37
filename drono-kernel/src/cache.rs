/**
 * PER-DEVICE CACHE - last reconciled status plus the staleness policy
 *
 * ROLE: single owner of every device's `DeviceStatus`. Callers get copies;
 * only this module writes entries.
 *
 * POLICY (per get_status call):
 * - within QUICK_TTL of the last update and not forced: cached copy, no probe
 * - otherwise liveness first; a dead device collapses to `stopped` and owes
 *   a full check on its return
 * - alive and within FULL_TTL of the last full check: quick path, only the
 *   running flag moves and a paused record stays paused
 * - otherwise full reconciliation from the snapshot sources
 *
 * CONCURRENCY: entries are replaced whole (`Arc` swap under a short write
 * lock, never held across a probe). Two concurrent refreshes of the same
 * device race benignly: the last writer wins with an equally valid record.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::extract::SourceKind;
use crate::models::{DeviceStatus, RunState};
use crate::probe::{Probe, ProbeTimeouts};
use crate::reconcile::{Reconciler, SourceProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Minimum spacing between any two probes of one device.
    pub quick_ttl: Duration,
    /// Minimum spacing between two full reconciliations of one device.
    pub full_ttl: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            quick_ttl: Duration::from_secs(5),
            full_ttl: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: Arc<DeviceStatus>,
    pub last_status_update: Instant,
    /// `None` until the first full reconciliation.
    pub last_full_check: Option<Instant>,
}

pub struct DeviceCache {
    probe: Arc<dyn Probe>,
    reconciler: Reconciler,
    policy: StalenessPolicy,
    timeouts: ProbeTimeouts,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

enum Liveness {
    Alive,
    Gone,
    Unknown,
}

impl DeviceCache {
    pub fn new(
        probe: Arc<dyn Probe>,
        reconciler: Reconciler,
        policy: StalenessPolicy,
        timeouts: ProbeTimeouts,
    ) -> Self {
        Self {
            probe,
            reconciler,
            policy,
            timeouts,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    /// Best-effort status of one device. Never fails; see the module header for the policy.
    pub async fn get_status(&self, device_id: &str, force_full: bool) -> DeviceStatus {
        let existing = self.entry(device_id);

        if let Some(entry) = &existing {
            if !force_full && entry.last_status_update.elapsed() < self.policy.quick_ttl {
                return (*entry.status).clone();
            }
        }

        let mut next = match &existing {
            Some(entry) => (*entry.status).clone(),
            None => DeviceStatus::new(device_id, OffsetDateTime::now_utc()),
        };
        let last_full_check = existing.as_ref().and_then(|e| e.last_full_check);

        match self.liveness(device_id).await {
            Liveness::Unknown => return next,
            Liveness::Gone => {
                next.status = RunState::Stopped;
                next.is_running = false;
                debug!("[cache] {} not alive", device_id);
                // Full check as soon as it comes back.
                self.store(device_id, next.clone(), None);
                return next;
            }
            Liveness::Alive => {}
        }

        next.is_running = true;
        if next.status != RunState::Paused {
            next.status = RunState::Running;
        }

        let full_due = force_full
            || last_full_check.map_or(true, |at| at.elapsed() >= self.policy.full_ttl);
        if !full_due {
            debug!("[cache] quick refresh for {}", device_id);
            self.store(device_id, next.clone(), last_full_check);
            return next;
        }

        info!("[cache] full refresh for {}", device_id);
        let sources = ProbeSources {
            probe: self.probe.as_ref(),
            device_id,
            timeouts: self.timeouts,
        };
        let reconciled = self
            .reconciler
            .reconcile(&next, &sources, OffsetDateTime::now_utc())
            .await;
        self.store(device_id, reconciled.clone(), Some(Instant::now()));
        reconciled
    }

    async fn liveness(&self, device_id: &str) -> Liveness {
        match timeout(self.timeouts.liveness, self.probe.is_alive(device_id)).await {
            Ok(Ok(true)) => Liveness::Alive,
            Ok(Ok(false)) => Liveness::Gone,
            Ok(Err(ProbeError::Timeout(_))) | Err(_) => {
                debug!("[cache] liveness probe for {} timed out", device_id);
                Liveness::Unknown
            }
            Ok(Err(e)) => {
                debug!("[cache] liveness probe for {} failed: {}", device_id, e);
                Liveness::Gone
            }
        }
    }

    fn store(&self, device_id: &str, status: DeviceStatus, last_full_check: Option<Instant>) {
        let entry = CacheEntry {
            status: Arc::new(status),
            last_status_update: Instant::now(),
            last_full_check,
        };
        self.entries.write().insert(device_id.to_string(), entry);
    }

    pub fn entry(&self, device_id: &str) -> Option<CacheEntry> {
        self.entries.read().get(device_id).cloned()
    }

    /// Last stored record, without probing.
    pub fn cached(&self, device_id: &str) -> Option<DeviceStatus> {
        self.entry(device_id).map(|e| (*e.status).clone())
    }

    /// Ids with an entry, sorted.
    pub fn known_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Snapshot sources of one device, each behind its own deadline.
struct ProbeSources<'a> {
    probe: &'a dyn Probe,
    device_id: &'a str,
    timeouts: ProbeTimeouts,
}

#[async_trait]
impl SourceProvider for ProbeSources<'_> {
    async fn fetch(&self, source: SourceKind) -> Option<Vec<u8>> {
        let id = self.device_id;
        let result = match source {
            SourceKind::ConfigSnapshot => {
                timeout(self.timeouts.snapshot, self.probe.fetch_config_snapshot(id)).await
            }
            SourceKind::StatusSnapshot => {
                timeout(self.timeouts.snapshot, self.probe.fetch_status_snapshot(id)).await
            }
            SourceKind::LogTail => {
                timeout(self.timeouts.log_tail, self.probe.fetch_log_tail(id)).await
            }
        };
        match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                debug!("[cache] {} {} probe failed: {}", id, source.as_str(), e);
                None
            }
            Err(_) => {
                debug!("[cache] {} {} probe timed out", id, source.as_str());
                None
            }
        }
    }
}

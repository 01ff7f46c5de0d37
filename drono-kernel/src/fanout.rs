//! Fan-out scheduler.
//!
//! Refreshes many devices at once through the cache, admitting at most
//! `max_concurrent` refreshes at a time. Callers beyond the cap wait for a
//! permit; there is no worker pool.
//!
//! Every requested id gets exactly one entry in the result. A refresh that
//! overruns its deadline or panics falls back to the last cached record (or a
//! fresh idle one) without touching any other device's result.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::cache::DeviceCache;
use crate::models::DeviceStatus;

pub struct FanOutScheduler {
    cache: Arc<DeviceCache>,
    gate: Semaphore,
    max_concurrent: usize,
    deadline: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FanOutScheduler {
    /// `max_concurrent` of 0 is raised to 1.
    pub fn new(cache: Arc<DeviceCache>, max_concurrent: usize, deadline: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            cache,
            gate: Semaphore::new(max_concurrent),
            max_concurrent,
            deadline,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Highest number of refreshes observed holding a permit at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    pub async fn refresh_all(
        &self,
        device_ids: &[String],
        force_full: bool,
    ) -> BTreeMap<String, DeviceStatus> {
        let unique: BTreeSet<&str> = device_ids.iter().map(String::as_str).collect();
        let refreshes = unique.into_iter().map(|id| async move {
            (id.to_string(), self.refresh_one(id, force_full).await)
        });
        join_all(refreshes).await.into_iter().collect()
    }

    async fn refresh_one(&self, device_id: &str, force_full: bool) -> DeviceStatus {
        let Ok(_permit) = self.gate.acquire().await else {
            return self.fallback(device_id);
        };

        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);

        let refresh = AssertUnwindSafe(self.cache.get_status(device_id, force_full)).catch_unwind();
        let result = tokio::time::timeout(self.deadline, refresh).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                error!("[fanout] refresh of {} panicked", device_id);
                self.fallback(device_id)
            }
            Err(_) => {
                warn!("[fanout] refresh of {} exceeded {:?}", device_id, self.deadline);
                self.fallback(device_id)
            }
        }
    }

    fn fallback(&self, device_id: &str) -> DeviceStatus {
        self.cache
            .cached(device_id)
            .unwrap_or_else(|| DeviceStatus::new(device_id, OffsetDateTime::now_utc()))
    }
}

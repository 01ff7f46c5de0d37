//! Probe adapter: read-only queries against a device's external state.
//!
//! The core only depends on the [`Probe`] and [`DeviceDirectory`] traits.
//! [`adb::AdbTransport`] implements both over the `adb` command line.

pub mod adb;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProbeError;
use crate::models::DeviceInfo;

pub use adb::AdbTransport;

#[async_trait]
pub trait Probe: Send + Sync {
    /// Whether the device's task process is up.
    async fn is_alive(&self, device_id: &str) -> Result<bool, ProbeError>;

    /// Structured key/value dump of the app's configuration.
    async fn fetch_config_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError>;

    /// JSON status file the app writes while running.
    async fn fetch_status_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError>;

    /// Most recent lines of the device log.
    async fn fetch_log_tail(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError>;
}

/// Lists the devices currently reachable through the transport.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ProbeError>;
}

/// Per-probe deadlines. Liveness is the shortest since it runs on every refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    pub liveness: Duration,
    pub snapshot: Duration,
    pub log_tail: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            liveness: Duration::from_secs(2),
            snapshot: Duration::from_secs(5),
            log_tail: Duration::from_secs(3),
        }
    }
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What the device's task is doing, as far as the evidence goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Reconciled status of one device.
///
/// Records are immutable once published by the cache: every refresh builds a
/// complete replacement and swaps it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: RunState,
    pub is_running: bool,
    pub current_iteration: u64,
    pub total_iterations: u64,
    pub percentage: f64,
    pub url: String,
    pub min_interval: u64,
    pub max_interval: u64,
    pub delay_min: u64,
    pub delay_max: u64,
    /// Seconds of active run time.
    pub elapsed_time: u64,
    /// Seconds until the run completes at the current iteration rate.
    pub estimated_remaining: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
}

impl DeviceStatus {
    /// Initial record for a device nothing has been learned about yet.
    pub fn new(device_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            status: RunState::Idle,
            is_running: false,
            current_iteration: 0,
            total_iterations: 0,
            percentage: 0.0,
            url: String::new(),
            min_interval: 0,
            max_interval: 0,
            delay_min: 1,
            delay_max: 2,
            elapsed_time: 0,
            estimated_remaining: 0,
            last_update: now,
        }
    }

    /// Field-by-field equality of everything a subscriber cares about.
    /// `last_update` moves on every reconciliation and is left out.
    pub fn same_telemetry(&self, other: &DeviceStatus) -> bool {
        self.device_id == other.device_id
            && self.status == other.status
            && self.is_running == other.is_running
            && self.current_iteration == other.current_iteration
            && self.total_iterations == other.total_iterations
            && self.percentage == other.percentage
            && self.url == other.url
            && self.min_interval == other.min_interval
            && self.max_interval == other.max_interval
            && self.delay_min == other.delay_min
            && self.delay_max == other.delay_max
            && self.elapsed_time == other.elapsed_time
            && self.estimated_remaining == other.estimated_remaining
    }
}

/// A device as reported by the directory (`adb devices -l`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub model: String,
    pub state: String,
    pub battery: String,
}

impl DeviceInfo {
    pub fn online(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: "Unknown".to_string(),
            state: "online".to_string(),
            battery: "Unknown".to_string(),
        }
    }
}

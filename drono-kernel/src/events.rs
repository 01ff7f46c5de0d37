//! Events pushed to subscribers.
//!
//! Wire shape is `{"type": "<snake_case variant>", "data": {...}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::commands::CommandOutcome;
use crate::models::{DeviceInfo, DeviceStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum KernelEvent {
    StatusUpdate {
        devices_status: BTreeMap<String, DeviceStatus>,
        is_partial: bool,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    DeviceList {
        devices: Vec<DeviceInfo>,
        count: usize,
    },
    StatusUpdateConfig {
        automatic: bool,
        interval: u64,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    DeviceStatus {
        device_id: String,
        status: DeviceStatus,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    CommandResult {
        device_id: String,
        command: String,
        result: CommandOutcome,
    },
    Error {
        message: String,
    },
}

impl KernelEvent {
    pub fn status_update(devices_status: BTreeMap<String, DeviceStatus>, is_partial: bool) -> Self {
        KernelEvent::StatusUpdate {
            devices_status,
            is_partial,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn device_list(devices: Vec<DeviceInfo>) -> Self {
        let count = devices.len();
        KernelEvent::DeviceList { devices, count }
    }

    pub fn error(message: impl Into<String>) -> Self {
        KernelEvent::Error { message: message.into() }
    }

    /// The `type` tag, also used as the MQTT topic suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::StatusUpdate { .. } => "status_update",
            KernelEvent::DeviceList { .. } => "device_list",
            KernelEvent::StatusUpdateConfig { .. } => "status_update_config",
            KernelEvent::DeviceStatus { .. } => "device_status",
            KernelEvent::CommandResult { .. } => "command_result",
            KernelEvent::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/**
 * KERNEL CONFIG - YAML file plus environment overrides
 *
 * ROLE: one `KernelConfig` for the whole process. Every section has defaults,
 * so a partial file (or no file at all) still yields a usable config.
 *
 * LOADING: path from `DRONO_KERNEL_CONFIG`, else `kernel.yaml`. A missing or
 * invalid file is logged and replaced by the defaults. `DRONO_API_KEY`
 * overrides `api_key`.
 */

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::cache::StalenessPolicy;
use crate::error::ConfigError;
use crate::probe::ProbeTimeouts;

pub const CONFIG_PATH_ENV: &str = "DRONO_KERNEL_CONFIG";
pub const API_KEY_ENV: &str = "DRONO_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub api_key: Option<String>,
    pub adb: AdbConf,
    pub cache: CacheConf,
    pub probes: ProbeConf,
    pub fanout: FanoutConf,
    pub broadcast: BroadcastConf,
    pub mqtt: Option<MqttConf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".into(),
            api_key: None,
            adb: AdbConf::default(),
            cache: CacheConf::default(),
            probes: ProbeConf::default(),
            fanout: FanoutConf::default(),
            broadcast: BroadcastConf::default(),
            mqtt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConf {
    /// Program used to reach devices; may carry leading args (`"adb -H host"`).
    pub binary: String,
    pub package: String,
    pub activity: Option<String>,
    pub prefs_path: Option<String>,
    pub status_path: Option<String>,
    pub log_lines: u32,
    /// Read app-private files through `su -c`.
    pub use_root: bool,
}

impl Default for AdbConf {
    fn default() -> Self {
        Self {
            binary: "adb".into(),
            package: "com.example.imtbf.debug".into(),
            activity: None,
            prefs_path: None,
            status_path: None,
            log_lines: 20,
            use_root: true,
        }
    }
}

impl AdbConf {
    pub fn activity_name(&self) -> String {
        self.activity
            .clone()
            .unwrap_or_else(|| "com.example.imtbf.presentation.activities.MainActivity".into())
    }

    pub fn prefs_file(&self) -> String {
        self.prefs_path.clone().unwrap_or_else(|| {
            format!(
                "/data/data/{}/shared_prefs/instagram_traffic_simulator_prefs.xml",
                self.package
            )
        })
    }

    pub fn status_file(&self) -> String {
        self.status_path
            .clone()
            .unwrap_or_else(|| format!("/data/data/{}/files/status.json", self.package))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    pub quick_ttl_ms: u64,
    pub full_ttl_ms: u64,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self { quick_ttl_ms: 5_000, full_ttl_ms: 15_000 }
    }
}

impl CacheConf {
    pub fn policy(&self) -> StalenessPolicy {
        StalenessPolicy {
            quick_ttl: Duration::from_millis(self.quick_ttl_ms),
            full_ttl: Duration::from_millis(self.full_ttl_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConf {
    pub liveness_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub log_tail_timeout_ms: u64,
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 2_000,
            snapshot_timeout_ms: 5_000,
            log_tail_timeout_ms: 3_000,
        }
    }
}

impl ProbeConf {
    pub fn timeouts(&self) -> ProbeTimeouts {
        ProbeTimeouts {
            liveness: Duration::from_millis(self.liveness_timeout_ms),
            snapshot: Duration::from_millis(self.snapshot_timeout_ms),
            log_tail: Duration::from_millis(self.log_tail_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConf {
    pub max_concurrent: usize,
    /// Upper bound on one device's refresh once it holds a slot.
    pub refresh_deadline_ms: u64,
}

impl Default for FanoutConf {
    fn default() -> Self {
        Self { max_concurrent: 3, refresh_deadline_ms: 20_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConf {
    pub automatic: bool,
    pub interval_secs: u64,
    /// Delay between two drains of the bus queue.
    pub pacing_ms: u64,
    /// Per-WebSocket outbound queue length before the client counts as lagging.
    pub subscriber_queue: usize,
}

impl Default for BroadcastConf {
    fn default() -> Self {
        Self {
            automatic: false,
            interval_secs: 3600,
            pacing_ms: 100,
            subscriber_queue: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "drono".into()
}

fn default_client_id() -> String {
    "drono-kernel".into()
}

/// Parses a YAML document. Blank input means "all defaults".
pub fn parse_config(text: &str) -> Result<KernelConfig, ConfigError> {
    if text.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    Ok(serde_yaml::from_str(text)?)
}

pub async fn read_config(path: impl AsRef<Path>) -> Result<KernelConfig, ConfigError> {
    let text = fs::read_to_string(path).await?;
    parse_config(&text)
}

/// Loads the process config. Never fails: problems fall back to defaults.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match read_config(&path).await {
            Ok(cfg) => {
                info!("[config] loaded {}", path);
                cfg
            }
            Err(e) => {
                warn!("[config] invalid {}: {}, using defaults", path, e);
                KernelConfig::default()
            }
        }
    } else {
        warn!("[config] no {}, using defaults", path);
        KernelConfig::default()
    };

    if let Ok(key) = std::env::var(API_KEY_ENV) {
        cfg.api_key = Some(key);
    }
    cfg.api_key = cfg.api_key.filter(|k| !k.is_empty());
    cfg
}

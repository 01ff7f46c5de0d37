//! ADB transport.
//!
//! Every query is one `adb` invocation with its own deadline. The child is
//! killed if the deadline passes, so a wedged device never pins a process.

use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DeviceDirectory, Probe, ProbeTimeouts};
use crate::commands::{
    broadcast_extras, CommandExecutor, CommandOutcome, CommandParams, DeviceAction, Strategy,
    StrategyChain,
};
use crate::config::AdbConf;
use crate::error::{CommandError, ProbeError};
use crate::models::DeviceInfo;

const UNKNOWN: &str = "Unknown";

#[derive(Clone)]
pub struct AdbTransport {
    inner: Arc<AdbInner>,
}

struct AdbInner {
    program: String,
    base_args: Vec<String>,
    conf: AdbConf,
    timeouts: ProbeTimeouts,
}

impl AdbTransport {
    pub fn new(conf: AdbConf, timeouts: ProbeTimeouts) -> Result<Self, ProbeError> {
        let mut words = shell_words::split(&conf.binary)
            .map_err(|e| ProbeError::Unavailable(format!("bad adb binary {:?}: {}", conf.binary, e)))?;
        if words.is_empty() {
            return Err(ProbeError::Unavailable("empty adb binary".into()));
        }
        let program = words.remove(0);
        Ok(Self {
            inner: Arc::new(AdbInner {
                program,
                base_args: words,
                conf,
                timeouts,
            }),
        })
    }

    pub fn conf(&self) -> &AdbConf {
        &self.inner.conf
    }

    /// Runs `adb version`; fails when the binary is missing or broken.
    pub async fn check_available(&self) -> Result<String, ProbeError> {
        let out = self.run_checked(&["version"], self.inner.timeouts.snapshot).await?;
        let version = String::from_utf8_lossy(&out)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        info!("[adb] {}", version);
        Ok(version)
    }

    async fn run(&self, args: &[&str], deadline: Duration) -> Result<Output, ProbeError> {
        let child = Command::new(&self.inner.program)
            .args(&self.inner.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProbeError::Timeout(deadline)),
        }
    }

    async fn run_checked(&self, args: &[&str], deadline: Duration) -> Result<Vec<u8>, ProbeError> {
        let output = self.run(args, deadline).await?;
        if !output.status.success() {
            return Err(ProbeError::Exited {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn shell(&self, device_id: &str, command: &str, deadline: Duration) -> Result<Vec<u8>, ProbeError> {
        debug!("[adb] {} shell {}", device_id, command);
        self.run_checked(&["-s", device_id, "shell", command], deadline).await
    }

    fn read_file_command(&self, path: &str) -> String {
        let cat = format!("cat {}", shell_words::quote(path));
        if self.inner.conf.use_root {
            format!("su -c {}", shell_words::quote(&cat))
        } else {
            cat
        }
    }

    async fn read_file(&self, device_id: &str, path: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        let out = self
            .shell(device_id, &self.read_file_command(path), self.inner.timeouts.snapshot)
            .await?;
        Ok(non_blank(out))
    }

    async fn describe(&self, device_id: String) -> DeviceInfo {
        let deadline = self.inner.timeouts.snapshot;
        let (model, battery) = futures::join!(
            self.shell(&device_id, "getprop ro.product.model", deadline),
            self.shell(&device_id, "dumpsys battery", deadline),
        );
        let model = model
            .ok()
            .map(|out| String::from_utf8_lossy(&out).trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| UNKNOWN.into());
        let battery = battery
            .ok()
            .and_then(|out| parse_battery_level(&String::from_utf8_lossy(&out)))
            .unwrap_or_else(|| UNKNOWN.into());

        DeviceInfo {
            model,
            battery,
            ..DeviceInfo::online(device_id)
        }
    }

    /// Ordered ways of delivering `action` to the app.
    pub fn command_chain(&self, action: DeviceAction) -> StrategyChain {
        let broadcast = self.strategy("command-broadcast", command_broadcast);
        match action {
            DeviceAction::Start => StrategyChain::new()
                .then(broadcast)
                .then(self.strategy("activity-launch", activity_launch)),
            DeviceAction::Stop => StrategyChain::new()
                .then(broadcast)
                .then(self.strategy("force-stop", force_stop)),
            DeviceAction::Pause | DeviceAction::Resume | DeviceAction::Reload => {
                StrategyChain::new().then(broadcast)
            }
        }
    }

    fn strategy(&self, name: &'static str, build: BuildCommand) -> ShellStrategy {
        ShellStrategy {
            name,
            transport: self.clone(),
            build,
        }
    }
}

fn non_blank(out: Vec<u8>) -> Option<Vec<u8>> {
    (!out.iter().all(u8::is_ascii_whitespace)).then_some(out)
}

#[async_trait]
impl Probe for AdbTransport {
    async fn is_alive(&self, device_id: &str) -> Result<bool, ProbeError> {
        let cmd = format!("pidof {}", shell_words::quote(&self.inner.conf.package));
        // pidof exits non-zero when nothing matches; only stdout matters.
        let output = self
            .run(&["-s", device_id, "shell", &cmd], self.inner.timeouts.liveness)
            .await?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn fetch_config_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        self.read_file(device_id, &self.inner.conf.prefs_file()).await
    }

    async fn fetch_status_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        self.read_file(device_id, &self.inner.conf.status_file()).await
    }

    async fn fetch_log_tail(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        let lines = self.inner.conf.log_lines.to_string();
        let out = self
            .run_checked(
                &["-s", device_id, "logcat", "-d", "-t", &lines, "-v", "brief"],
                self.inner.timeouts.log_tail,
            )
            .await?;
        Ok(non_blank(out))
    }
}

#[async_trait]
impl DeviceDirectory for AdbTransport {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ProbeError> {
        let out = self
            .run_checked(&["devices", "-l"], self.inner.timeouts.snapshot)
            .await?;
        let ids = parse_device_list(&String::from_utf8_lossy(&out));
        Ok(join_all(ids.into_iter().map(|id| self.describe(id))).await)
    }
}

#[async_trait]
impl CommandExecutor for AdbTransport {
    async fn execute(&self, device_id: &str, action: DeviceAction, params: &CommandParams) -> CommandOutcome {
        self.command_chain(action).run(device_id, action, params).await
    }
}

type BuildCommand = fn(&AdbConf, DeviceAction, &CommandParams) -> String;

/// A strategy that is a single `adb shell` command line.
struct ShellStrategy {
    name: &'static str,
    transport: AdbTransport,
    build: BuildCommand,
}

#[async_trait]
impl Strategy for ShellStrategy {
    fn name(&self) -> &str {
        self.name
    }

    async fn attempt(&self, device_id: &str, action: DeviceAction, params: &CommandParams) -> Result<String, CommandError> {
        let cmd = (self.build)(self.transport.conf(), action, params);
        let out = self
            .transport
            .shell(device_id, &cmd, self.transport.inner.timeouts.snapshot)
            .await?;
        let text = String::from_utf8_lossy(&out);
        // `am` reports most failures on stdout with a zero exit code.
        if let Some(line) = text
            .lines()
            .find(|l| l.starts_with("Error") || l.contains("Exception"))
        {
            return Err(CommandError::Rejected(line.trim().to_string()));
        }
        let first = text.lines().next().unwrap_or_default().trim();
        Ok(if first.is_empty() {
            format!("{} ok", self.name)
        } else {
            format!("{}: {}", self.name, first)
        })
    }
}

/// `am broadcast` to the app's command receiver, with params as extras.
pub fn command_broadcast(conf: &AdbConf, action: DeviceAction, params: &CommandParams) -> String {
    format!(
        "am broadcast -a {pkg}.COMMAND --es command {cmd}{extras} -p {pkg}",
        pkg = conf.package,
        cmd = action.broadcast_name(),
        extras = broadcast_extras(params),
    )
}

/// Explicit activity launch carrying the run settings as intent extras.
pub fn activity_launch(conf: &AdbConf, _action: DeviceAction, params: &CommandParams) -> String {
    let int = |key: &str, default: i64| params.get(key).and_then(|v| v.as_i64()).unwrap_or(default);
    let url = params
        .get("url")
        .and_then(|v| v.as_str())
        .unwrap_or("https://example.com");
    format!(
        "am start -n {}/{} --es custom_url {} --ei iterations {} --ei min_interval {} \
         --ei max_interval {} --ei delay_min {} --ei delay_max {} --ez load_from_intent true",
        conf.package,
        conf.activity_name(),
        shell_words::quote(url),
        int("iterations", 100),
        int("min_interval", 1),
        int("max_interval", 2),
        int("delay_min", 0),
        int("delay_max", 0),
    )
}

pub fn force_stop(conf: &AdbConf, _action: DeviceAction, _params: &CommandParams) -> String {
    format!("am force-stop {}", conf.package)
}

/// Ids of attached devices in the `device` state, from `adb devices -l`.
pub fn parse_device_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            (parts.next()? == "device").then(|| id.to_string())
        })
        .collect()
}

/// `level: 87` from `dumpsys battery`, as `"87%"`.
pub fn parse_battery_level(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("level:"))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| format!("{}%", v))
}

//! Device commands.
//!
//! An action is carried out by an ordered [`StrategyChain`]: each strategy is
//! one way of getting the action onto the device, and the chain stops at the
//! first one that succeeds. The core only looks at [`CommandOutcome::success`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::CommandError;

pub type CommandParams = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Start,
    Stop,
    Pause,
    Resume,
    Reload,
}

impl DeviceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAction::Start => "start",
            DeviceAction::Stop => "stop",
            DeviceAction::Pause => "pause",
            DeviceAction::Resume => "resume",
            DeviceAction::Reload => "reload",
        }
    }

    /// Command name understood by the app's broadcast receiver.
    pub fn broadcast_name(&self) -> &'static str {
        match self {
            DeviceAction::Reload => "reload_url",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceAction {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(DeviceAction::Start),
            "stop" => Ok(DeviceAction::Stop),
            "pause" => Ok(DeviceAction::Pause),
            "resume" => Ok(DeviceAction::Resume),
            "reload" | "reload_url" => Ok(DeviceAction::Reload),
            _ => Err(CommandError::UnknownAction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

/// Issues control actions against a device.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        device_id: &str,
        action: DeviceAction,
        params: &CommandParams,
    ) -> CommandOutcome;
}

/// One way of delivering an action. `Ok` carries a short human-readable note.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(
        &self,
        device_id: &str,
        action: DeviceAction,
        params: &CommandParams,
    ) -> Result<String, CommandError>;
}

#[derive(Default)]
pub struct StrategyChain {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Tries each strategy in order and reports the first success, or every failure.
    pub async fn run(
        &self,
        device_id: &str,
        action: DeviceAction,
        params: &CommandParams,
    ) -> CommandOutcome {
        if self.strategies.is_empty() {
            return CommandOutcome::failed(CommandError::NoStrategy(action.to_string()).to_string());
        }

        let mut failures = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match strategy.attempt(device_id, action, params).await {
                Ok(note) => {
                    debug!("[commands] {} {} via {}", device_id, action, strategy.name());
                    return CommandOutcome::ok(note);
                }
                Err(e) => {
                    debug!("[commands] {} {} via {} failed: {}", device_id, action, strategy.name(), e);
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        warn!("[commands] {} {} failed on every strategy", device_id, action);
        CommandOutcome::failed(failures.join("; "))
    }
}

/// `am` intent extras for a parameter map: booleans as `--ez`, integers as
/// `--ei`, anything else as a shell-quoted `--es`.
pub fn broadcast_extras(params: &CommandParams) -> String {
    let mut out = String::new();
    for (key, value) in params {
        let key = shell_words::quote(key);
        let extra = match value {
            Value::Bool(b) => format!(" --ez {} {}", key, b),
            Value::Number(n) if n.is_i64() || n.is_u64() => format!(" --ei {} {}", key, n),
            Value::String(s) => format!(" --es {} {}", key, shell_words::quote(s)),
            Value::Null => continue,
            other => format!(" --es {} {}", key, shell_words::quote(&other.to_string())),
        };
        out.push_str(&extra);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: &'static str,
        succeed: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Strategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt(
            &self,
            _device_id: &str,
            action: DeviceAction,
            _params: &CommandParams,
        ) -> Result<String, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(format!("{} sent {}", self.name, action))
            } else {
                Err(CommandError::Rejected(self.name.to_string()))
            }
        }
    }

    fn params(value: Value) -> CommandParams {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("start".parse::<DeviceAction>().unwrap(), DeviceAction::Start);
        assert_eq!(" Pause ".parse::<DeviceAction>().unwrap(), DeviceAction::Pause);
        assert_eq!("reload_url".parse::<DeviceAction>().unwrap(), DeviceAction::Reload);
        assert!(matches!(
            "reboot".parse::<DeviceAction>(),
            Err(CommandError::UnknownAction(_))
        ));
        assert_eq!(DeviceAction::Reload.broadcast_name(), "reload_url");
        assert_eq!(DeviceAction::Resume.broadcast_name(), "resume");
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = StrategyChain::new()
            .then(Scripted { name: "broadcast", succeed: false, calls: calls.clone() })
            .then(Scripted { name: "activity", succeed: true, calls: calls.clone() })
            .then(Scripted { name: "never", succeed: true, calls: calls.clone() });

        let outcome = chain.run("dev", DeviceAction::Start, &CommandParams::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.message, "activity sent start");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chain_reports_every_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = StrategyChain::new()
            .then(Scripted { name: "a", succeed: false, calls: calls.clone() })
            .then(Scripted { name: "b", succeed: false, calls: calls.clone() });

        let outcome = chain.run("dev", DeviceAction::Stop, &CommandParams::new()).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("a: "));
        assert!(outcome.message.contains("b: "));

        let empty = StrategyChain::new().run("dev", DeviceAction::Stop, &CommandParams::new()).await;
        assert!(!empty.success);
    }

    #[test]
    fn test_broadcast_extras_types_and_quoting() {
        let extras = broadcast_extras(&params(json!({
            "flag": true,
            "iterations": 100,
            "url": "https://example.com/?a=1&b=it's",
            "ratio": 1.5,
            "skip": null,
        })));
        assert!(extras.contains(" --ez flag true"));
        assert!(extras.contains(" --ei iterations 100"));
        assert!(extras.contains(" --es ratio 1.5"));
        assert!(!extras.contains("skip"));

        let words = shell_words::split(&extras).unwrap();
        let url_at = words.iter().position(|w| w == "url").unwrap();
        assert_eq!(words[url_at - 1], "--es");
        assert_eq!(words[url_at + 1], "https://example.com/?a=1&b=it's");
    }
}

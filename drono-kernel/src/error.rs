use std::time::Duration;

/// Failures talking to a device through the transport.
///
/// The core never lets one of these escape a single-device refresh: every
/// caller downgrades it to "no data" for the source that raised it.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to spawn transport command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("transport command exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Why a message could not be handed to a bus subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("subscriber queue full")]
    Lagging,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownAction(String),
    #[error("no strategy available for {0}")]
    NoStrategy(String),
    #[error("command rejected by device: {0}")]
    Rejected(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

//! Drono kernel: device telemetry reconciliation and distribution.
//!
//! Probes feed extractors, the reconciler merges their fragments into one
//! `DeviceStatus` per device, the cache rate-limits probing, the fan-out
//! scheduler refreshes many devices under a concurrency cap and the
//! broadcaster pushes changes through the channel bus.

pub mod broadcaster;
pub mod bus;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod fanout;
pub mod health;
pub mod http;
pub mod kernel;
pub mod logging;
pub mod models;
pub mod mqtt;
pub mod probe;
pub mod reconcile;

pub use broadcaster::{BroadcastConfig, ChangeDetector, StatusBroadcaster};
pub use bus::{ChannelBus, Subscriber, SubscriberHandle};
pub use cache::{DeviceCache, StalenessPolicy};
pub use commands::{CommandExecutor, CommandOutcome, CommandParams, DeviceAction};
pub use config::KernelConfig;
pub use events::KernelEvent;
pub use fanout::FanOutScheduler;
pub use kernel::Kernel;
pub use models::{DeviceInfo, DeviceStatus, RunState};
pub use probe::{DeviceDirectory, Probe, ProbeTimeouts};
pub use reconcile::Reconciler;

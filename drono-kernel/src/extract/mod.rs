//! Source extractors.
//!
//! Each probe returns raw bytes in its own format; an extractor turns those
//! bytes into a [`SourceFields`] fragment. Extractors are pure and total:
//! malformed or empty input yields `None`, never an error, so a broken source
//! can only ever reduce how much the reconciler learns in a cycle.
//!
//! Each field lookup lives behind its own named function in the submodules,
//! which keeps the scraping of semi-structured text out of the merge logic.

pub mod config_snapshot;
pub mod log_tail;
pub mod status_snapshot;

pub use config_snapshot::ConfigSnapshotExtractor;
pub use log_tail::LogTailExtractor;
pub use status_snapshot::StatusSnapshotExtractor;

use serde::Serialize;

/// The external evidence a reconciliation can draw on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ConfigSnapshot,
    StatusSnapshot,
    LogTail,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ConfigSnapshot => "config_snapshot",
            SourceKind::StatusSnapshot => "status_snapshot",
            SourceKind::LogTail => "log_tail",
        }
    }
}

/// Run timing as reported by one source, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    pub started_at_ms: i64,
    /// Accumulated time spent paused before the current pause, if any.
    pub total_paused_ms: i64,
    /// Start of the pause in progress; zero when not paused.
    pub paused_since_ms: i64,
}

impl Timing {
    pub fn started_at(started_at_ms: i64) -> Self {
        Self {
            started_at_ms,
            ..Self::default()
        }
    }

    /// Milliseconds of active (non-paused) run time at `now_ms`, never negative.
    pub fn active_elapsed_ms(&self, now_ms: i64) -> i64 {
        let mut elapsed = now_ms
            .saturating_sub(self.started_at_ms)
            .saturating_sub(self.total_paused_ms);
        if self.paused_since_ms > 0 {
            elapsed = elapsed.saturating_sub(now_ms.saturating_sub(self.paused_since_ms));
        }
        elapsed.max(0)
    }
}

/// Partial status learned from a single source. `None` means "not reported".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFields {
    pub is_running: Option<bool>,
    pub paused: Option<bool>,
    pub current_iteration: Option<u64>,
    pub total_iterations: Option<u64>,
    pub url: Option<String>,
    pub min_interval: Option<u64>,
    pub max_interval: Option<u64>,
    pub delay_min: Option<u64>,
    pub delay_max: Option<u64>,
    pub timing: Option<Timing>,
}

impl SourceFields {
    pub fn is_empty(&self) -> bool {
        *self == SourceFields::default()
    }
}

/// Uniform contract for every extraction stage.
pub trait Extractor: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Parses a raw snapshot. Returns `None` when nothing usable was found.
    fn extract(&self, raw: &[u8]) -> Option<SourceFields>;
}

/// Non-negative integer from a signed textual value. Sources occasionally
/// report `-1` sentinels; those are treated as absent.
pub(crate) fn parse_count(text: &str) -> Option<u64> {
    text.trim().parse::<i64>().ok().and_then(|v| u64::try_from(v).ok())
}

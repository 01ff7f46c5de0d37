/**
 * STATUS RECONCILER - merges partial probe evidence into one DeviceStatus
 *
 * ROLE: runs an ordered list of extraction stages over the previous record and
 * recomputes the derived metrics (percentage, elapsed, remaining).
 *
 * RULES:
 * - Starts from the previous record: a field no source reports this cycle keeps its value.
 * - A stage only fetches its source when its gate admits the record built so far,
 *   so expensive probes are skipped once progress is known.
 * - A source that is absent or unparseable contributes nothing; it never aborts the merge.
 * - The result is a fresh record; the previous one is never modified.
 */

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use crate::extract::{
    ConfigSnapshotExtractor, Extractor, LogTailExtractor, SourceFields, SourceKind,
    StatusSnapshotExtractor, Timing,
};
use crate::models::{DeviceStatus, RunState};

/// Where a reconciliation gets its raw snapshots from.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Raw bytes for `source`, or `None` when the source is unavailable.
    async fn fetch(&self, source: SourceKind) -> Option<Vec<u8>>;
}

/// In-memory snapshots, for replaying a known set of sources.
#[derive(Debug, Default, Clone)]
pub struct SnapshotSet {
    sources: HashMap<SourceKind, Vec<u8>>,
}

impl SnapshotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: SourceKind, raw: impl Into<Vec<u8>>) -> Self {
        self.sources.insert(source, raw.into());
        self
    }
}

#[async_trait]
impl SourceProvider for SnapshotSet {
    async fn fetch(&self, source: SourceKind) -> Option<Vec<u8>> {
        self.sources.get(&source).cloned()
    }
}

/// Condition under which a stage is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageGate {
    Always,
    /// Only while no iteration progress is known.
    UntilProgress,
    /// Only while no progress is known and the device reports a running task.
    UntilProgressWhileRunning,
}

impl StageGate {
    fn admits(&self, record: &DeviceStatus) -> bool {
        match self {
            StageGate::Always => true,
            StageGate::UntilProgress => record.current_iteration == 0,
            StageGate::UntilProgressWhileRunning => {
                record.current_iteration == 0 && record.is_running
            }
        }
    }
}

pub struct Stage {
    gate: StageGate,
    extractor: Box<dyn Extractor>,
}

impl Stage {
    pub fn new(gate: StageGate, extractor: impl Extractor + 'static) -> Self {
        Self {
            gate,
            extractor: Box::new(extractor),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.extractor.source()
    }
}

pub struct Reconciler {
    stages: Vec<Stage>,
}

impl Reconciler {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Config snapshot, then the JSON status file while progress is unknown,
    /// then the log tail while progress is unknown and a run is active.
    ///
    /// Timing policy: the last stage that ran and reported a start time owns
    /// `elapsed_time`. The status file only runs when the config snapshot gave no
    /// progress, so its paused-time-corrected timing then replaces the config's
    /// raw start-time delta. Pause bookkeeping never applies to config timing.
    pub fn standard(log_filter: Option<String>) -> Self {
        Self::new(vec![
            Stage::new(StageGate::Always, ConfigSnapshotExtractor),
            Stage::new(StageGate::UntilProgress, StatusSnapshotExtractor),
            Stage::new(
                StageGate::UntilProgressWhileRunning,
                LogTailExtractor::new(log_filter),
            ),
        ])
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.stages.iter().map(Stage::source).collect()
    }

    pub async fn reconcile<P>(
        &self,
        previous: &DeviceStatus,
        sources: &P,
        now: OffsetDateTime,
    ) -> DeviceStatus
    where
        P: SourceProvider + ?Sized,
    {
        let mut next = previous.clone();
        let mut timing = None;

        for stage in &self.stages {
            if !stage.gate.admits(&next) {
                continue;
            }
            let source = stage.source();
            let Some(raw) = sources.fetch(source).await else {
                debug!("[reconcile] {}: no {} available", next.device_id, source.as_str());
                continue;
            };
            match stage.extractor.extract(&raw) {
                Some(fields) => {
                    if fields.timing.is_some() {
                        timing = fields.timing;
                    }
                    apply(&mut next, fields);
                }
                None => debug!(
                    "[reconcile] {}: {} yielded no fields",
                    next.device_id,
                    source.as_str()
                ),
            }
        }

        derive(&mut next, timing, now);
        next.last_update = now;
        next
    }
}

/// Overlays one fragment on the record. Only reported fields are written.
pub fn apply(record: &mut DeviceStatus, fields: SourceFields) {
    let reports_state = fields.is_running.is_some() || fields.paused.is_some();
    if let Some(running) = fields.is_running {
        record.is_running = running;
    }
    if reports_state {
        record.status = if fields.paused == Some(true) {
            RunState::Paused
        } else if record.is_running {
            RunState::Running
        } else {
            RunState::Idle
        };
    }

    if let Some(v) = fields.current_iteration {
        record.current_iteration = v;
    }
    if let Some(v) = fields.total_iterations {
        record.total_iterations = v;
    }
    if let Some(v) = fields.url {
        record.url = v;
    }
    if let Some(v) = fields.min_interval {
        record.min_interval = v;
    }
    if let Some(v) = fields.max_interval {
        record.max_interval = v;
    }
    if let Some(v) = fields.delay_min {
        record.delay_min = v;
    }
    if let Some(v) = fields.delay_max {
        record.delay_max = v;
    }
}

/// Recomputes the derived metrics from whatever raw fields ended up populated.
/// Without timing evidence this cycle, `elapsed_time` keeps its previous value.
pub fn derive(record: &mut DeviceStatus, timing: Option<Timing>, now: OffsetDateTime) {
    record.percentage = percentage(record.current_iteration, record.total_iterations);
    if let Some(timing) = timing {
        let elapsed_ms = timing.active_elapsed_ms(epoch_millis(now));
        record.elapsed_time = (elapsed_ms.saturating_add(500) / 1000) as u64;
    }
    record.estimated_remaining = estimated_remaining(
        record.elapsed_time,
        record.current_iteration,
        record.total_iterations,
        record.is_running,
    );
}

/// `round(current / total * 100, 1)`, or 0 when there is no total.
pub fn percentage(current: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (current as f64 / total as f64 * 1000.0).round() / 10.0
}

/// Seconds left at the average rate so far; 0 without progress or a running task.
pub fn estimated_remaining(elapsed: u64, current: u64, total: u64, running: bool) -> u64 {
    if current == 0 || !running || total <= current {
        return 0;
    }
    let per_iteration = elapsed as f64 / current as f64;
    (per_iteration * (total - current) as f64).round() as u64
}

fn epoch_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn now_ms() -> i64 {
        epoch_millis(NOW)
    }

    fn prefs(running: bool, paused: bool, current: u64, total: u64, started_ms: i64) -> String {
        format!(
            r#"<map>
    <boolean name="is_running" value="{running}" />
    <boolean name="simulation_paused" value="{paused}" />
    <int name="iterations" value="{total}" />
    <int name="current_iteration" value="{current}" />
    <string name="target_url">https://example.com</string>
    <long name="simulation_start_time" value="{started_ms}" />
</map>"#
        )
    }

    fn base() -> DeviceStatus {
        DeviceStatus::new("dev-1", datetime!(2024-06-01 00:00:00 UTC))
    }

    #[test]
    fn test_percentage_rounding() {
        assert_eq!(percentage(50, 200), 25.0);
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(0, 10), 0.0);
    }

    #[test]
    fn test_estimated_remaining_guards() {
        assert_eq!(estimated_remaining(100, 0, 10, true), 0);
        assert_eq!(estimated_remaining(100, 5, 10, false), 0);
        assert_eq!(estimated_remaining(100, 12, 10, true), 0);
        assert_eq!(estimated_remaining(100, 5, 10, true), 100);
    }

    #[tokio::test]
    async fn test_config_snapshot_populates_and_derives() {
        let started = now_ms() - 100_000;
        let sources = SnapshotSet::new().with(
            SourceKind::ConfigSnapshot,
            prefs(true, false, 50, 200, started),
        );
        let status = Reconciler::standard(None).reconcile(&base(), &sources, NOW).await;

        assert_eq!(status.status, RunState::Running);
        assert!(status.is_running);
        assert_eq!(status.current_iteration, 50);
        assert_eq!(status.total_iterations, 200);
        assert_eq!(status.percentage, 25.0);
        assert_eq!(status.url, "https://example.com");
        assert_eq!(status.elapsed_time, 100);
        assert_eq!(status.estimated_remaining, 300);
        assert_eq!(status.last_update, NOW);
    }

    #[tokio::test]
    async fn test_paused_flag_wins_over_running() {
        let sources = SnapshotSet::new().with(
            SourceKind::ConfigSnapshot,
            prefs(true, true, 5, 10, now_ms() - 10_000),
        );
        let status = Reconciler::standard(None).reconcile(&base(), &sources, NOW).await;
        assert_eq!(status.status, RunState::Paused);
        assert!(status.is_running);
    }

    #[tokio::test]
    async fn test_status_snapshot_fills_missing_progress_with_paused_time() {
        let started = now_ms() - 60_000;
        let config = r#"<map><boolean name="is_running" value="true" /><int name="iterations" value="40" /></map>"#;
        let status_json = format!(
            r#"{{"currentIteration": 10, "totalIterations": 40, "isRunning": true,
                "startTimeMs": {started}, "totalPausedTimeMs": 20000, "pauseTimeMs": 0}}"#
        );
        let sources = SnapshotSet::new()
            .with(SourceKind::ConfigSnapshot, config)
            .with(SourceKind::StatusSnapshot, status_json);

        let status = Reconciler::standard(None).reconcile(&base(), &sources, NOW).await;
        assert_eq!(status.current_iteration, 10);
        assert_eq!(status.total_iterations, 40);
        assert_eq!(status.elapsed_time, 40);
        assert_eq!(status.estimated_remaining, 120);
        assert_eq!(status.percentage, 25.0);
    }

    #[tokio::test]
    async fn test_status_snapshot_skipped_once_progress_known() {
        let sources = SnapshotSet::new()
            .with(SourceKind::ConfigSnapshot, prefs(true, false, 3, 10, 0))
            .with(
                SourceKind::StatusSnapshot,
                r#"{"currentIteration": 9, "totalIterations": 99}"#,
            );
        let status = Reconciler::standard(None).reconcile(&base(), &sources, NOW).await;
        assert_eq!(status.current_iteration, 3);
        assert_eq!(status.total_iterations, 10);
    }

    #[tokio::test]
    async fn test_log_tail_only_consulted_while_running() {
        let tail = "D/app( 1): Iteration: 4/16\n";
        let running = SnapshotSet::new()
            .with(
                SourceKind::ConfigSnapshot,
                r#"<map><boolean name="is_running" value="true" /></map>"#,
            )
            .with(SourceKind::LogTail, tail);
        let status = Reconciler::standard(None).reconcile(&base(), &running, NOW).await;
        assert_eq!(status.current_iteration, 4);
        assert_eq!(status.total_iterations, 16);
        assert_eq!(status.percentage, 25.0);

        let idle = SnapshotSet::new()
            .with(
                SourceKind::ConfigSnapshot,
                r#"<map><boolean name="is_running" value="false" /></map>"#,
            )
            .with(SourceKind::LogTail, tail);
        let status = Reconciler::standard(None).reconcile(&base(), &idle, NOW).await;
        assert_eq!(status.current_iteration, 0);
        assert_eq!(status.status, RunState::Idle);
    }

    #[tokio::test]
    async fn test_reported_stop_clears_previous_state() {
        let mut previous = base();
        previous.status = RunState::Paused;
        previous.is_running = true;

        let sources = SnapshotSet::new().with(
            SourceKind::ConfigSnapshot,
            prefs(false, false, 3, 10, now_ms() - 5_000),
        );
        let status = Reconciler::standard(None).reconcile(&previous, &sources, NOW).await;
        assert_eq!(status.status, RunState::Idle);
        assert!(!status.is_running);
        assert_eq!(status.estimated_remaining, 0);
    }

    #[tokio::test]
    async fn test_extreme_pause_timestamp_saturates() {
        let sources = SnapshotSet::new().with(
            SourceKind::StatusSnapshot,
            r#"{"isRunning":true,"startTimeMs":1,"pauseTimeMs":9223372036854775807}"#,
        );
        let status = Reconciler::standard(None).reconcile(&base(), &sources, NOW).await;
        assert_eq!(status.elapsed_time, (i64::MAX / 1000) as u64);
        assert_eq!(status.estimated_remaining, 0);
    }

    #[tokio::test]
    async fn test_no_sources_keeps_previous_configuration() {
        let mut previous = base();
        previous.url = "https://kept.example".into();
        previous.min_interval = 7;
        previous.elapsed_time = 33;
        previous.status = RunState::Paused;

        let status = Reconciler::standard(None)
            .reconcile(&previous, &SnapshotSet::new(), NOW)
            .await;
        assert_eq!(status.url, "https://kept.example");
        assert_eq!(status.min_interval, 7);
        assert_eq!(status.elapsed_time, 33);
        assert_eq!(status.status, RunState::Paused);
    }

    #[tokio::test]
    async fn test_running_without_progress_has_zero_remaining() {
        let sources = SnapshotSet::new().with(
            SourceKind::ConfigSnapshot,
            prefs(true, false, 0, 100, now_ms() - 5_000),
        );
        let status = Reconciler::standard(None).reconcile(&base(), &sources, NOW).await;
        assert!(status.is_running);
        assert_eq!(status.current_iteration, 0);
        assert_eq!(status.estimated_remaining, 0);
        assert_eq!(status.percentage, 0.0);
    }

    #[tokio::test]
    async fn test_reconciliation_is_idempotent() {
        let sources = SnapshotSet::new()
            .with(
                SourceKind::ConfigSnapshot,
                prefs(true, false, 17, 60, now_ms() - 123_456),
            )
            .with(SourceKind::LogTail, "noise\n");
        let reconciler = Reconciler::standard(None);

        let first = reconciler.reconcile(&base(), &sources, NOW).await;
        let second = reconciler.reconcile(&first, &sources, NOW).await;
        assert_eq!(first, second);
        assert_eq!(first.percentage.to_bits(), second.percentage.to_bits());
        assert_eq!(first.elapsed_time, second.elapsed_time);
        assert_eq!(first.estimated_remaining, second.estimated_remaining);
    }

    #[tokio::test]
    async fn test_garbage_sources_degrade_gracefully() {
        let sources = SnapshotSet::new()
            .with(SourceKind::ConfigSnapshot, "permission denied")
            .with(SourceKind::StatusSnapshot, "{broken")
            .with(SourceKind::LogTail, vec![0xff, 0x00]);
        let previous = base();
        let status = Reconciler::standard(None)
            .reconcile(&previous, &sources, NOW)
            .await;
        assert!(status.same_telemetry(&previous));
    }
}

//! Status snapshot: `files/status.json` written by the app while a run is active.
//!
//! Keys are camelCase; any of them may be missing or carry the wrong type.

use serde_json::{Map, Value};
use tracing::debug;

use super::{Extractor, SourceFields, SourceKind, Timing};

fn non_negative(obj: &Map<String, Value>, key: &str) -> Option<u64> {
    match obj.get(key)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn millis(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn extract_is_running(obj: &Map<String, Value>) -> Option<bool> {
    obj.get("isRunning")?.as_bool()
}

pub fn extract_iterations(obj: &Map<String, Value>) -> (Option<u64>, Option<u64>) {
    (
        non_negative(obj, "currentIteration"),
        non_negative(obj, "totalIterations"),
    )
}

/// Start time plus pause bookkeeping. Only a positive `startTimeMs` counts.
pub fn extract_timing(obj: &Map<String, Value>) -> Option<Timing> {
    let started_at_ms = millis(obj, "startTimeMs").filter(|ms| *ms > 0)?;
    Some(Timing {
        started_at_ms,
        total_paused_ms: millis(obj, "totalPausedTimeMs").unwrap_or(0).max(0),
        paused_since_ms: millis(obj, "pauseTimeMs").unwrap_or(0).max(0),
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatusSnapshotExtractor;

impl Extractor for StatusSnapshotExtractor {
    fn source(&self) -> SourceKind {
        SourceKind::StatusSnapshot
    }

    fn extract(&self, raw: &[u8]) -> Option<SourceFields> {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                debug!("[extract] status snapshot is not JSON: {}", e);
                return None;
            }
        };
        let obj = value.as_object()?;

        let is_running = extract_is_running(obj);
        // Without an explicit `isPaused`, a present-but-not-running file reads as paused.
        let paused = obj
            .get("isPaused")
            .and_then(Value::as_bool)
            .or(is_running.map(|running| !running));
        let (current_iteration, total_iterations) = extract_iterations(obj);

        let fields = SourceFields {
            is_running,
            paused,
            current_iteration,
            total_iterations,
            url: obj
                .get("url")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            min_interval: non_negative(obj, "minInterval"),
            max_interval: non_negative(obj, "maxInterval"),
            delay_min: non_negative(obj, "delayMin"),
            delay_max: non_negative(obj, "delayMax"),
            timing: extract_timing(obj),
        };
        (!fields.is_empty()).then_some(fields)
    }
}

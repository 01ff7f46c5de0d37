//! Log tail: the most recent lines of the device log (`logcat -d -t N -v brief`).

use std::sync::OnceLock;

use regex::Regex;

use super::{Extractor, SourceFields, SourceKind};

fn iteration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Iteration:\s*(\d+)/(\d+)").expect("valid iteration pattern"))
}

/// Finds `Iteration: <current>/<total>` in one line. Both values must be positive.
pub fn parse_iteration_marker(line: &str) -> Option<(u64, u64)> {
    let caps = iteration_pattern().captures(line)?;
    let current = caps[1].parse::<u64>().ok()?;
    let total = caps[2].parse::<u64>().ok()?;
    (current > 0 && total > 0).then_some((current, total))
}

/// Scans the tail for the first iteration marker.
///
/// With a `line_filter`, only lines containing that text (usually the app's
/// package or log tag) are considered.
#[derive(Debug, Default, Clone)]
pub struct LogTailExtractor {
    line_filter: Option<String>,
}

impl LogTailExtractor {
    pub fn new(line_filter: Option<String>) -> Self {
        Self {
            line_filter: line_filter.filter(|f| !f.is_empty()),
        }
    }
}

impl Extractor for LogTailExtractor {
    fn source(&self) -> SourceKind {
        SourceKind::LogTail
    }

    fn extract(&self, raw: &[u8]) -> Option<SourceFields> {
        let text = String::from_utf8_lossy(raw);
        let (current, total) = text
            .lines()
            .filter(|line| {
                self.line_filter
                    .as_deref()
                    .map_or(true, |filter| line.contains(filter))
            })
            .find_map(parse_iteration_marker)?;

        Some(SourceFields {
            current_iteration: Some(current),
            total_iterations: Some(total),
            ..SourceFields::default()
        })
    }
}

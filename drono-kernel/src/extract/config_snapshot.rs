//! Config snapshot: the app's SharedPreferences XML dump.
//!
//! ```xml
//! <map>
//!     <boolean name="is_running" value="true" />
//!     <int name="iterations" value="200" />
//!     <string name="target_url">https://example.com/?a=1&amp;b=2</string>
//!     <long name="simulation_start_time" value="1717000000000" />
//! </map>
//! ```

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{parse_count, Extractor, SourceFields, SourceKind, Timing};

pub const KEY_IS_RUNNING: &str = "is_running";
pub const KEY_PAUSED: &str = "simulation_paused";
pub const KEY_TOTAL_ITERATIONS: &str = "iterations";
pub const KEY_CURRENT_ITERATION: &str = "current_iteration";
pub const KEY_URL: &str = "target_url";
pub const KEY_MIN_INTERVAL: &str = "min_interval";
pub const KEY_MAX_INTERVAL: &str = "max_interval";
pub const KEY_DELAY_MIN: &str = "delay_min";
pub const KEY_DELAY_MAX: &str = "delay_max";
pub const KEY_START_TIME: &str = "simulation_start_time";

fn entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // <kind name="key" value="v" />  or  <string name="key">text</string>
        Regex::new(
            r#"<(boolean|int|long|float|string)\s+name="([^"]*)"(?:\s+value="([^"]*)")?\s*(?:/>|>([^<]*)</string>)"#,
        )
        .expect("valid prefs entry pattern")
    })
}

/// Parsed key/value view of a preferences dump.
#[derive(Debug, Default)]
pub struct PrefsDoc {
    entries: HashMap<String, (String, String)>,
}

impl PrefsDoc {
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for caps in entry_pattern().captures_iter(text) {
            let kind = caps[1].to_string();
            let name = caps[2].to_string();
            let value = caps
                .get(3)
                .or_else(|| caps.get(4))
                .map(|m| unescape_xml(m.as_str()))
                .unwrap_or_default();
            entries.insert(name, (kind, value));
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn typed(&self, name: &str, kind: &str) -> Option<&str> {
        self.entries
            .get(name)
            .filter(|(k, _)| k == kind)
            .map(|(_, v)| v.as_str())
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.typed(name, "boolean")?.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<u64> {
        parse_count(self.typed(name, "int")?)
    }

    pub fn long(&self, name: &str) -> Option<i64> {
        self.typed(name, "long")?.trim().parse().ok()
    }

    pub fn string(&self, name: &str) -> Option<String> {
        let value = self.typed(name, "string")?.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

fn unescape_xml(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

pub fn extract_is_running(doc: &PrefsDoc) -> Option<bool> {
    doc.boolean(KEY_IS_RUNNING)
}

pub fn extract_paused(doc: &PrefsDoc) -> Option<bool> {
    doc.boolean(KEY_PAUSED)
}

pub fn extract_iterations(doc: &PrefsDoc) -> (Option<u64>, Option<u64>) {
    (doc.int(KEY_CURRENT_ITERATION), doc.int(KEY_TOTAL_ITERATIONS))
}

pub fn extract_url(doc: &PrefsDoc) -> Option<String> {
    doc.string(KEY_URL)
}

pub fn extract_start_time(doc: &PrefsDoc) -> Option<Timing> {
    doc.long(KEY_START_TIME)
        .filter(|ms| *ms > 0)
        .map(Timing::started_at)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigSnapshotExtractor;

impl Extractor for ConfigSnapshotExtractor {
    fn source(&self) -> SourceKind {
        SourceKind::ConfigSnapshot
    }

    fn extract(&self, raw: &[u8]) -> Option<SourceFields> {
        let text = String::from_utf8_lossy(raw);
        let doc = PrefsDoc::parse(&text);
        if doc.is_empty() {
            debug!("[extract] config snapshot had no recognizable entries");
            return None;
        }

        let (current_iteration, total_iterations) = extract_iterations(&doc);
        let fields = SourceFields {
            is_running: extract_is_running(&doc),
            paused: extract_paused(&doc),
            current_iteration,
            total_iterations,
            url: extract_url(&doc),
            min_interval: doc.int(KEY_MIN_INTERVAL),
            max_interval: doc.int(KEY_MAX_INTERVAL),
            delay_min: doc.int(KEY_DELAY_MIN),
            delay_max: doc.int(KEY_DELAY_MAX),
            timing: extract_start_time(&doc),
        };
        (!fields.is_empty()).then_some(fields)
    }
}

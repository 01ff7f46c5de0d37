/*!
Contenus de snapshots au format produit par l'application sur l'appareil.
*/

use serde_json::json;

/// Dump SharedPreferences minimal.
#[derive(Debug, Clone, Default)]
pub struct Prefs {
    pub is_running: Option<bool>,
    pub paused: Option<bool>,
    pub current_iteration: Option<u64>,
    pub total_iterations: Option<u64>,
    pub url: Option<String>,
    pub start_time_ms: Option<i64>,
}

impl Prefs {
    pub fn running(current: u64, total: u64) -> Self {
        Self {
            is_running: Some(true),
            current_iteration: Some(current),
            total_iterations: Some(total),
            ..Self::default()
        }
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = Some(true);
        self
    }

    pub fn started_at(mut self, ms: i64) -> Self {
        self.start_time_ms = Some(ms);
        self
    }

    pub fn to_xml(&self) -> Vec<u8> {
        let mut out = String::from("<?xml version='1.0' encoding='utf-8' standalone='yes' ?>\n<map>\n");
        if let Some(v) = self.is_running {
            out.push_str(&format!("    <boolean name=\"is_running\" value=\"{}\" />\n", v));
        }
        if let Some(v) = self.paused {
            out.push_str(&format!("    <boolean name=\"simulation_paused\" value=\"{}\" />\n", v));
        }
        if let Some(v) = self.current_iteration {
            out.push_str(&format!("    <int name=\"current_iteration\" value=\"{}\" />\n", v));
        }
        if let Some(v) = self.total_iterations {
            out.push_str(&format!("    <int name=\"iterations\" value=\"{}\" />\n", v));
        }
        if let Some(url) = &self.url {
            out.push_str(&format!(
                "    <string name=\"target_url\">{}</string>\n",
                url.replace('&', "&amp;")
            ));
        }
        if let Some(v) = self.start_time_ms {
            out.push_str(&format!("    <long name=\"simulation_start_time\" value=\"{}\" />\n", v));
        }
        out.push_str("</map>\n");
        out.into_bytes()
    }
}

/// `files/status.json` d'un run actif.
pub fn status_json(current: u64, total: u64, start_time_ms: i64, total_paused_ms: i64) -> Vec<u8> {
    json!({
        "isRunning": true,
        "currentIteration": current,
        "totalIterations": total,
        "startTimeMs": start_time_ms,
        "totalPausedTimeMs": total_paused_ms,
        "pauseTimeMs": 0,
    })
    .to_string()
    .into_bytes()
}

/// Quelques lignes logcat avec un marqueur d'itération.
pub fn log_tail(current: u64, total: u64) -> Vec<u8> {
    format!(
        "D/NetworkStats( 1201): rx=1204 tx=388\n\
         I/SimulationService( 4242): Iteration: {}/{}\n\
         D/SimulationService( 4242): next request scheduled\n",
        current, total
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drono_kernel::extract::{ConfigSnapshotExtractor, Extractor, LogTailExtractor};

    #[test]
    fn test_prefs_fixture_is_readable_by_extractor() {
        let raw = Prefs::running(5, 20).url("https://a.test/?x=1&y=2").to_xml();
        let fields = ConfigSnapshotExtractor.extract(&raw).unwrap();
        assert_eq!(fields.current_iteration, Some(5));
        assert_eq!(fields.total_iterations, Some(20));
        assert_eq!(fields.url.as_deref(), Some("https://a.test/?x=1&y=2"));
    }

    #[test]
    fn test_log_fixture_has_marker() {
        let fields = LogTailExtractor::default().extract(&log_tail(3, 9)).unwrap();
        assert_eq!(fields.current_iteration, Some(3));
    }
}

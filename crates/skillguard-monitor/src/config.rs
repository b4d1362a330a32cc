use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Monitor settings. Every field has a default, so an empty `[monitor]`
/// table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Critical violations that open a skill's circuit.
    pub circuit_breaker_threshold: u32,
    /// Stats idle for longer than this are purged, unless the circuit is open.
    pub retention_hours: u64,
    pub purge_interval_secs: u64,
    /// Append-only JSONL violation log.
    pub log_file: Option<PathBuf>,
    /// Endpoint that receives a POST for every critical violation.
    pub alert_webhook: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: 3,
            retention_hours: 24,
            purge_interval_secs: 3_600,
            log_file: None,
            alert_webhook: None,
        }
    }
}

impl MonitorConfig {
    pub fn retention(&self) -> chrono::Duration {
        i64::try_from(self.retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.circuit_breaker_threshold > 0,
            "monitor.circuit_breaker_threshold must be positive"
        );
        ensure!(
            self.purge_interval_secs > 0,
            "monitor.purge_interval_secs must be positive"
        );
        if let Some(url) = &self.alert_webhook {
            ensure!(
                url.starts_with("http://") || url.starts_with("https://"),
                "monitor.alert_webhook must be an http(s) URL, got '{url}'"
            );
        }
        Ok(())
    }
}

//! Outbound sinks for recorded violations: an append-only JSONL log and an
//! optional webhook for critical events.

use anyhow::{Context, Result};
use serde_json::json;
use skillguard_core::SandboxViolation;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// One JSON object per line, written off the caller's thread. Buffered lines
/// are flushed when the log is dropped.
#[derive(Debug)]
pub(crate) struct ViolationLogFile {
    writer: NonBlocking,
    path: PathBuf,
    _guard: WorkerGuard,
}

impl ViolationLogFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let filename = path.file_name().map_or_else(
            || "violations.jsonl".to_owned(),
            |f| f.to_string_lossy().into_owned(),
        );

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(filename)
            .build(dir)
            .with_context(|| format!("failed to open violation log {}", path.display()))?;
        let (writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("skillguard-violation-log")
            .finish(appender);

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    pub(crate) fn append(&self, violation: &SandboxViolation) {
        let mut line = match serde_json::to_vec(violation) {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, "violation not serializable; skipped in log");
                return;
            }
        };
        line.push(b'\n');
        let mut writer = self.writer.clone();
        if let Err(error) = writer.write_all(&line) {
            warn!(path = %self.path.display(), error = %error, "violation log write failed");
        }
    }
}

/// Posts critical violations to a webhook. Delivery is fire-and-forget on
/// the ambient runtime; failures are logged and never reach the caller.
#[derive(Debug, Clone)]
pub(crate) struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub(crate) fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }

    pub(crate) fn alert(&self, violation: &SandboxViolation) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; webhook alert skipped");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let body = json!({
            "event": "sandbox_violation",
            "violation": violation,
        });
        handle.spawn(async move {
            let sent = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            match sent {
                Ok(_) => debug!("violation webhook delivered"),
                Err(error) => warn!(error = %error, "violation webhook failed"),
            }
        });
    }
}

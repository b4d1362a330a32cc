//! Behaviour shared by every execution layer: validation, environment
//! construction, output capping and violation bookkeeping.

use crate::env::{self, SandboxEnv};
use crate::guard::{self, ParsedCommand};
use crate::output::{CappedBuffer, StreamKind};
use crate::violations::{ViolationLog, lock};
use skillguard_core::{
    RuntimeUsed, SandboxConfig, SandboxResult, SandboxViolation, Severity, ViolationKind,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDERR_EXCERPT_BYTES: usize = 500;
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug)]
pub(crate) struct ExecutorBase {
    config: SandboxConfig,
    runtime: RuntimeUsed,
    violations: Arc<ViolationLog>,
}

impl ExecutorBase {
    pub(crate) fn new(config: SandboxConfig, runtime: RuntimeUsed) -> Self {
        Self {
            config,
            runtime,
            violations: Arc::new(ViolationLog::new()),
        }
    }

    pub(crate) fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub(crate) fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    pub(crate) fn record(
        &self,
        kind: ViolationKind,
        severity: Severity,
        detail: impl Into<String>,
        skill_id: &str,
    ) {
        self.violations.record(SandboxViolation::new(
            kind,
            severity,
            detail,
            Some(skill_id.to_owned()),
        ));
    }

    /// Run the command guard, recording the violation on rejection.
    pub(crate) fn validate(
        &self,
        command: &str,
        skill_dir: &Path,
        skill_id: &str,
    ) -> Result<ParsedCommand, String> {
        guard::validate_command(command, skill_dir).map_err(|rejection| {
            self.record(
                rejection.kind,
                rejection.severity,
                format!("{} in command: {command}", rejection.reason),
                skill_id,
            );
            format!("Command rejected: {}", rejection.reason)
        })
    }

    /// Environment for one run; withheld credential-like names are recorded.
    pub(crate) fn environment(&self, skill_id: &str) -> BTreeMap<String, String> {
        let SandboxEnv { vars, withheld } = env::build_env(&self.config.env, env::host_var);
        for name in withheld {
            self.record(
                ViolationKind::EnvLeak,
                Severity::Warn,
                format!("allow-listed variable {name} looks like a credential and was withheld"),
                skill_id,
            );
        }
        vars
    }

    pub(crate) fn output_capture(&self, skill_id: &str) -> Arc<OutputCapture> {
        let limit = self.config.resources.per_stream_output_limit();
        Arc::new(OutputCapture {
            limit,
            stdout: Mutex::new(CappedBuffer::new(limit)),
            stderr: Mutex::new(CappedBuffer::new(limit)),
            violations: Arc::clone(&self.violations),
            skill_id: skill_id.to_owned(),
        })
    }

    pub(crate) fn failure(&self, error: impl Into<String>, started: Instant) -> SandboxResult {
        SandboxResult::failed(self.runtime, error, elapsed_ms(started))
    }
}

/// Two independent capped buffers fed by concurrent readers.
#[derive(Debug)]
pub(crate) struct OutputCapture {
    limit: usize,
    stdout: Mutex<CappedBuffer>,
    stderr: Mutex<CappedBuffer>,
    violations: Arc<ViolationLog>,
    skill_id: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CapturedOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) truncated: bool,
}

impl OutputCapture {
    pub(crate) fn push(&self, stream: StreamKind, chunk: &[u8]) {
        let buffer = match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        };
        let first_truncation = lock(buffer).push(chunk);
        if first_truncation {
            self.violations.record(SandboxViolation::new(
                ViolationKind::OutputTruncated,
                Severity::Warn,
                format!("{stream} exceeded {} bytes; the rest was discarded", self.limit),
                Some(self.skill_id.clone()),
            ));
        }
    }

    /// Whatever has been captured so far. Safe to call while readers are
    /// still running or after they were aborted.
    pub(crate) fn snapshot(&self) -> CapturedOutput {
        let stdout = lock(&self.stdout);
        let stderr = lock(&self.stderr);
        CapturedOutput {
            stdout: stdout.to_text(),
            stderr: stderr.to_text(),
            truncated: stdout.is_truncated() || stderr.is_truncated(),
        }
    }
}

/// Read `reader` to EOF into `capture`.
pub(crate) async fn pump<R>(mut reader: R, capture: Arc<OutputCapture>, stream: StreamKind)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => capture.push(stream, &chunk[..n]),
            Err(error) => {
                debug!(%stream, error = %error, "skill output read failed");
                break;
            }
        }
    }
}

/// Resolves when `cancel` fires; never resolves without a token.
pub(crate) async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Identity used to tag violations: the skill directory's final component.
pub(crate) fn skill_id_for(skill_dir: &Path) -> String {
    skill_dir.file_name().map_or_else(
        || skill_dir.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn stderr_excerpt(stderr: &str) -> &str {
    &stderr[..stderr.floor_char_boundary(STDERR_EXCERPT_BYTES)]
}

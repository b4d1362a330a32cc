//! Host child-process execution layer.
//!
//! The skill runs as the leader of its own process group so the whole tree
//! can be signalled at once. On Linux a `/bin/sh` wrapper lowers the
//! virtual-memory ceiling (`ulimit -v`) before `exec`-ing the interpreter;
//! the command itself never passes through the shell parser.
//!
//! Network policy, filesystem write isolation and the process-count ceiling
//! are not enforceable at this layer. Construction logs those gaps and
//! [`ProcessSandbox::capabilities`] reports them.

use crate::base::{
    CapturedOutput, ExecutorBase, cancelled, elapsed_ms, pump, skill_id_for, stderr_excerpt,
};
use crate::guard::ParsedCommand;
use crate::output::StreamKind;
use async_trait::async_trait;
use serde::Serialize;
use skillguard_core::{
    NetworkPolicy, RuntimeUsed, SandboxConfig, SandboxExecutor, SandboxResult, SandboxViolation,
    Severity, SkillRequest, ViolationKind,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Time between SIGTERM and SIGKILL when tearing down a timed-out tree.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// Upper bound on waiting for stdout/stderr to reach EOF after exit.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const SHELL: &str = "/bin/sh";
/// Exit status the wrapper uses when the memory ceiling cannot be applied.
const ULIMIT_FAILED_EXIT: i32 = 125;

/// Which isolation features this host gives the process layer.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessCapabilities {
    pub memory_ceiling: bool,
    pub process_group: bool,
    pub network_isolation: bool,
    pub filesystem_isolation: bool,
    pub process_limit: bool,
}

impl ProcessCapabilities {
    pub fn detect() -> Self {
        Self {
            memory_ceiling: cfg!(target_os = "linux") && Path::new(SHELL).exists(),
            process_group: cfg!(unix),
            network_isolation: false,
            filesystem_isolation: false,
            // RLIMIT_NPROC (`ulimit -u`) counts every process of the invoking
            // user, not just this run's tree, so it cannot act as a per-run ceiling.
            process_limit: false,
        }
    }

    /// Human-readable list of what is not enforced.
    pub fn gaps(&self) -> Vec<&'static str> {
        let mut gaps = Vec::new();
        if !self.memory_ceiling {
            gaps.push("memory ceiling");
        }
        if !self.process_group {
            gaps.push("process-tree termination");
        }
        if !self.network_isolation {
            gaps.push("network policy");
        }
        if !self.filesystem_isolation {
            gaps.push("filesystem write isolation");
        }
        if !self.process_limit {
            gaps.push("process-count ceiling");
        }
        gaps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessSandbox {
    base: ExecutorBase,
    capabilities: ProcessCapabilities,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        let capabilities = ProcessCapabilities::detect();

        if !capabilities.memory_ceiling {
            warn!("process sandbox cannot enforce a memory ceiling on this host");
        }
        if config.network != NetworkPolicy::Allow {
            warn!("process sandbox cannot enforce network policy; use the container runtime");
        }
        if config.filesystem.read_only {
            debug!("process sandbox cannot make the host filesystem read-only");
        }

        Self {
            base: ExecutorBase::new(config, RuntimeUsed::Process),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> ProcessCapabilities {
        self.capabilities
    }

    pub fn config(&self) -> &SandboxConfig {
        self.base.config()
    }

    /// Forget recorded violations. Live subscriptions are unaffected.
    pub fn clear_violations(&self) {
        self.base.violations().clear();
    }

    fn build_command(&self, parsed: &ParsedCommand, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = if self.capabilities.memory_ceiling {
            let kib = self.base.config().resources.memory_bytes() / 1024;
            let mut cmd = Command::new(SHELL);
            cmd.arg("-c")
                .arg(format!(
                    "ulimit -v {kib} 2>/dev/null || exit {ULIMIT_FAILED_EXIT}; exec \"$@\""
                ))
                .arg("skillguard-sh")
                .arg(&parsed.program)
                .args(&parsed.args);
            cmd
        } else {
            let mut cmd = Command::new(&parsed.program);
            cmd.args(&parsed.args);
            cmd
        };

        cmd.current_dir(&parsed.cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    async fn run(
        &self,
        parsed: &ParsedCommand,
        request: &SkillRequest,
        cancel: Option<&CancellationToken>,
        skill_id: &str,
        started: Instant,
    ) -> SandboxResult {
        let limits = &self.base.config().resources;
        let env = self.base.environment(skill_id);
        let mut cmd = self.build_command(parsed, &env);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                return self
                    .base
                    .failure(format!("failed to spawn {}: {error}", parsed.program), started);
            }
        };
        let pgid = child.id();
        debug!(pid = ?pgid, program = %parsed.program, "skill process started");

        let capture = self.base.output_capture(skill_id);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                Arc::clone(&capture),
                StreamKind::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                Arc::clone(&capture),
                StreamKind::Stderr,
            )));
        }

        // A skill that never reads stdin must not stall the timeout race.
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = request.to_payload();
            tokio::spawn(async move {
                if let Err(error) = stdin.write_all(&payload).await {
                    debug!(error = %error, "request write to skill stdin failed");
                }
                drop(stdin);
            })
        });

        let outcome = tokio::select! {
            biased;
            _ = child.wait() => Outcome::Exited,
            () = tokio::time::sleep(limits.hard_timeout()) => Outcome::TimedOut,
            () = cancelled(cancel) => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited => {
                // Reap anything the skill left running in its group.
                signal_group(pgid, Signal::Kill);
                child.wait().await
            }
            Outcome::TimedOut | Outcome::Cancelled => terminate(&mut child, pgid).await,
        };

        if let Some(writer) = writer {
            writer.abort();
        }
        let drain = futures::future::join_all(readers.iter_mut());
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("skill output did not reach EOF in time; keeping partial output");
            for reader in &readers {
                reader.abort();
            }
        }
        let output = capture.snapshot();

        let status = match status {
            Ok(status) => status,
            Err(error) => {
                return self
                    .base
                    .failure(format!("failed to wait for skill process: {error}"), started);
            }
        };

        self.classify(outcome, status, output, skill_id, started)
    }

    fn classify(
        &self,
        outcome: Outcome,
        status: ExitStatus,
        output: CapturedOutput,
        skill_id: &str,
        started: Instant,
    ) -> SandboxResult {
        let limits = &self.base.config().resources;
        let timed_out = outcome != Outcome::Exited;
        let killed = killed_by_sigkill(status);
        let oom_killed = !timed_out && killed;
        let exit_code = if timed_out || killed { None } else { status.code() };

        let error = match outcome {
            Outcome::TimedOut => {
                self.base.record(
                    ViolationKind::Timeout,
                    Severity::Warn,
                    format!("exceeded hard timeout of {}ms", limits.hard_timeout_ms),
                    skill_id,
                );
                Some(format!("Process timed out after {}ms", limits.hard_timeout_ms))
            }
            Outcome::Cancelled => {
                info!(skill_id, "skill execution cancelled by caller");
                Some("Execution cancelled".to_owned())
            }
            Outcome::Exited if oom_killed => {
                self.base.record(
                    ViolationKind::OutOfMemory,
                    Severity::Error,
                    format!(
                        "killed by SIGKILL without a timeout; treated as exceeding {} MB",
                        limits.memory_mb
                    ),
                    skill_id,
                );
                Some(format!(
                    "Process killed, likely out of memory (limit: {} MB)",
                    limits.memory_mb
                ))
            }
            Outcome::Exited => match status.code() {
                Some(0) => None,
                Some(code) => Some(format!(
                    "Process exited with code {code}: {}",
                    stderr_excerpt(&output.stderr)
                )),
                None => Some(format!("Process terminated by signal: {status}")),
            },
        };

        SandboxResult {
            success: error.is_none(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
            latency_ms: elapsed_ms(started),
            timed_out,
            oom_killed,
            output_truncated: output.truncated,
            runtime_used: RuntimeUsed::Process,
            error,
            resource_usage: None,
        }
    }
}

#[async_trait]
impl SandboxExecutor for ProcessSandbox {
    fn runtime(&self) -> RuntimeUsed {
        RuntimeUsed::Process
    }

    async fn execute(
        &self,
        command: &str,
        skill_dir: &Path,
        request: &SkillRequest,
        cancel: Option<&CancellationToken>,
    ) -> SandboxResult {
        let started = Instant::now();
        let skill_id = skill_id_for(skill_dir);
        let span = info_span!("process_exec", skill_id = %skill_id);

        async {
            let parsed = match self.base.validate(command, skill_dir, &skill_id) {
                Ok(parsed) => parsed,
                Err(error) => return self.base.failure(error, started),
            };
            let result = self.run(&parsed, request, cancel, &skill_id, started).await;
            debug!(
                success = result.success,
                exit_code = ?result.exit_code,
                latency_ms = result.latency_ms,
                timed_out = result.timed_out,
                "skill process finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn violations(&self) -> Vec<SandboxViolation> {
        self.base.violations().snapshot()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SandboxViolation> {
        self.base.violations().subscribe()
    }
}

// ---------------------------------------------------------------------------
// Process-group signalling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// SIGTERM the group, give it a grace period, then SIGKILL.
async fn terminate(child: &mut Child, pgid: Option<u32>) -> std::io::Result<ExitStatus> {
    signal_group(pgid, Signal::Term);
    if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
        signal_group(pgid, Signal::Kill);
        return status;
    }
    signal_group(pgid, Signal::Kill);
    if let Err(error) = child.start_kill() {
        debug!(error = %error, "direct kill after group kill failed");
    }
    child.wait().await
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(error) => debug!(pgid, signal = ?sig, error = %error, "process group signal failed"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: Signal) {}

#[cfg(unix)]
fn killed_by_sigkill(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(nix::sys::signal::Signal::SIGKILL as i32)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: ExitStatus) -> bool {
    false
}

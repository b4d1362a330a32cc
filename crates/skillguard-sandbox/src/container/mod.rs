//! Ephemeral hardened-container execution layer.
//!
//! Every `execute` creates a fresh, uniquely named container, attaches to
//! its streams, starts it, races its exit against the hard timeout and the
//! caller's cancellation token, then stops and removes it. Cleanup is
//! bounded by the configured cleanup timeout and also runs, detached, if
//! the execution future is dropped halfway.

mod demux;
pub mod options;
mod stats;

use crate::base::{ExecutorBase, cancelled, elapsed_ms, skill_id_for, stderr_excerpt};
use crate::guard::ParsedCommand;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use options::CONTAINER_NAME_PREFIX;
use skillguard_core::{
    NetworkPolicy, PullPolicy, RuntimeUsed, SandboxConfig, SandboxExecutor, SandboxResult,
    SandboxViolation, Severity, SkillRequest, ViolationKind,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub use options::{MANAGED_LABEL, SKILL_LABEL, SKILL_MOUNT};

/// Client-side timeout for daemon requests, in seconds.
const DAEMON_TIMEOUT_SECS: u64 = 120;
/// Upper bound on waiting for the attach stream to end after exit.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const STATS_TIMEOUT: Duration = Duration::from_secs(1);
/// Seconds the daemon waits between SIGTERM and SIGKILL on stop.
const STOP_GRACE_SECS: i64 = 1;

#[derive(Debug)]
enum Outcome {
    Exited(i64),
    WaitFailed(String),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ContainerSandbox {
    base: ExecutorBase,
    docker: Docker,
    seccomp_profile: Option<String>,
    image_ready: OnceCell<()>,
}

impl ContainerSandbox {
    /// Configure a daemon client. Does not contact the daemon.
    ///
    /// Fails if a configured seccomp profile cannot be read: a missing
    /// profile never silently degrades to the daemon default.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let docker = connect(config.container.socket_path.as_deref())?;
        let seccomp_profile = load_seccomp_profile(config.container.seccomp_profile.as_deref())?;

        if let NetworkPolicy::AllowList(rules) = &config.network {
            warn!(
                rules = rules.len(),
                "network allow-list is not enforceable per destination; using bridge networking"
            );
        }
        if seccomp_profile.is_none() {
            debug!("no seccomp profile configured; the daemon default applies");
        }

        Ok(Self {
            base: ExecutorBase::new(config, RuntimeUsed::Container),
            docker,
            seccomp_profile,
            image_ready: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        self.base.config()
    }

    /// Forget recorded violations. Live subscriptions are unaffected.
    pub fn clear_violations(&self) {
        self.base.violations().clear();
    }

    /// Make the configured image available according to the pull policy.
    /// Succeeds at most once per sandbox; failures are retried next call.
    async fn ensure_image(&self) -> Result<()> {
        self.image_ready
            .get_or_try_init(|| async {
                let image = &self.base.config().container.image;
                match self.base.config().container.pull_policy {
                    PullPolicy::Always => self.pull_image(image).await,
                    PullPolicy::IfMissing => {
                        if self.docker.inspect_image(image).await.is_ok() {
                            Ok(())
                        } else {
                            self.pull_image(image).await
                        }
                    }
                    PullPolicy::Never => self
                        .docker
                        .inspect_image(image)
                        .await
                        .map(|_| ())
                        .with_context(|| {
                            format!("image {image} is not present and pull_policy is never")
                        }),
                }
            })
            .await
            .map(|_| ())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling container image");
        let progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        tokio::pin!(progress);
        while let Some(event) = progress.next().await {
            let event = event.with_context(|| format!("failed to pull image {image}"))?;
            debug!(image, status = ?event.status, "image pull progress");
        }
        info!(image, "container image ready");
        Ok(())
    }

    async fn run(
        &self,
        parsed: &ParsedCommand,
        request: &SkillRequest,
        cancel: Option<&CancellationToken>,
        skill_id: &str,
        started: Instant,
    ) -> SandboxResult {
        if let Err(error) = self.ensure_image().await {
            return self.base.failure(format!("{error:#}"), started);
        }

        let env = self.base.environment(skill_id);
        let name = format!("{CONTAINER_NAME_PREFIX}{}", Uuid::new_v4().simple());
        let create = options::container_config(
            self.base.config(),
            parsed,
            &env,
            self.seccomp_profile.as_deref(),
            skill_id,
        );

        let mut guard = ContainerGuard::new(self.docker.clone(), name.clone());
        let result = match self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    ..Default::default()
                }),
                create,
            )
            .await
        {
            Ok(_) => {
                debug!(container = %name, "container created");
                self.run_container(&name, request, cancel, skill_id, started)
                    .await
            }
            Err(error) => self
                .base
                .failure(format!("failed to create container: {error}"), started),
        };

        self.cleanup(&name).await;
        guard.disarm();
        result
    }

    async fn run_container(
        &self,
        name: &str,
        request: &SkillRequest,
        cancel: Option<&CancellationToken>,
        skill_id: &str,
        started: Instant,
    ) -> SandboxResult {
        let limits = &self.base.config().resources;

        let attached = self
            .docker
            .attach_container(
                name,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await;
        let AttachContainerResults { output, mut input } = match attached {
            Ok(attached) => attached,
            Err(error) => {
                return self
                    .base
                    .failure(format!("failed to attach to container: {error}"), started);
            }
        };

        if let Err(error) = self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            return self
                .base
                .failure(format!("failed to start container: {error}"), started);
        }

        let capture = self.base.output_capture(skill_id);
        let mut drain = tokio::spawn(demux::drain(output, Arc::clone(&capture)));
        let stats = tokio::spawn(stats::collect(self.docker.clone(), name.to_owned()));

        let payload = request.to_payload();
        let writer = tokio::spawn(async move {
            if let Err(error) = input.write_all(&payload).await {
                debug!(error = %error, "request write to container stdin failed");
            }
            if let Err(error) = input.shutdown().await {
                debug!(error = %error, "closing container stdin failed");
            }
        });

        let wait = self.docker.wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        tokio::pin!(wait);

        let outcome = tokio::select! {
            biased;
            exit = wait.next() => match exit {
                Some(Ok(response)) => Outcome::Exited(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Outcome::Exited(code)
                }
                Some(Err(error)) => Outcome::WaitFailed(error.to_string()),
                None => Outcome::WaitFailed("wait stream ended without a status".to_owned()),
            },
            () = tokio::time::sleep(limits.hard_timeout()) => Outcome::TimedOut,
            () = cancelled(cancel) => Outcome::Cancelled,
        };

        if matches!(outcome, Outcome::TimedOut | Outcome::Cancelled) {
            self.kill(name).await;
        }

        writer.abort();
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, &mut drain)
            .await
            .is_err()
        {
            debug!(container = %name, "attach stream did not end in time; keeping partial output");
            drain.abort();
        }
        let sample = match tokio::time::timeout(STATS_TIMEOUT, stats).await {
            Ok(Ok(sample)) => sample,
            _ => None,
        };
        let oom_killed = self.oom_killed(name).await;
        let output = capture.snapshot();
        let wall_time_ms = elapsed_ms(started);

        let timed_out = matches!(outcome, Outcome::TimedOut | Outcome::Cancelled);
        let exit_code = match &outcome {
            Outcome::Exited(code) => i32::try_from(*code).ok(),
            _ => None,
        };

        let error = match &outcome {
            Outcome::TimedOut => {
                self.base.record(
                    ViolationKind::Timeout,
                    Severity::Warn,
                    format!("exceeded hard timeout of {}ms", limits.hard_timeout_ms),
                    skill_id,
                );
                Some(format!("Container timed out after {}ms", limits.hard_timeout_ms))
            }
            Outcome::Cancelled => {
                info!(skill_id, container = %name, "skill execution cancelled by caller");
                Some("Execution cancelled".to_owned())
            }
            Outcome::WaitFailed(error) => Some(format!("failed to wait for container: {error}")),
            Outcome::Exited(_) if oom_killed => Some(format!(
                "Container OOM-killed (memory limit: {} MB)",
                limits.memory_mb
            )),
            Outcome::Exited(0) => None,
            Outcome::Exited(code) => Some(format!(
                "Container exited with code {code}: {}",
                stderr_excerpt(&output.stderr)
            )),
        };

        if oom_killed {
            self.base.record(
                ViolationKind::OutOfMemory,
                Severity::Error,
                format!("kernel OOM killer fired at the {} MB limit", limits.memory_mb),
                skill_id,
            );
        }
        if let Some(pids) = sample.as_ref().and_then(|s| s.pids)
            && pids >= u64::from(limits.max_pids)
        {
            self.base.record(
                ViolationKind::ProcessLimit,
                Severity::Warn,
                format!("process count reached the limit of {}", limits.max_pids),
                skill_id,
            );
        }

        SandboxResult {
            success: error.is_none(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
            latency_ms: wall_time_ms,
            timed_out,
            oom_killed,
            output_truncated: output.truncated,
            runtime_used: RuntimeUsed::Container,
            error,
            resource_usage: sample.map(|s| s.resource_usage(wall_time_ms)),
        }
    }

    async fn kill(&self, name: &str) {
        if let Err(error) = self
            .docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            debug!(container = %name, error = %error, "kill failed; container may have exited");
        }
    }

    async fn oom_killed(&self, name: &str) -> bool {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(error) => {
                debug!(container = %name, error = %error, "inspect after exit failed");
                false
            }
        }
    }

    /// Stop then force-remove, bounded by the cleanup timeout. Never fails.
    async fn cleanup(&self, name: &str) {
        let limit = self.base.config().container.cleanup_timeout();
        if tokio::time::timeout(limit, remove_container(&self.docker, name))
            .await
            .is_err()
        {
            warn!(container = %name, timeout_ms = limit.as_millis(), "container cleanup timed out");
        }
    }
}

#[async_trait]
impl SandboxExecutor for ContainerSandbox {
    fn runtime(&self) -> RuntimeUsed {
        RuntimeUsed::Container
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
        let span = info_span!("container_exec", skill_id = %skill_id);

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
                oom_killed = result.oom_killed,
                "skill container finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn is_available(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(error) => {
                debug!(error = %error, "container daemon ping failed");
                false
            }
        }
    }

    fn violations(&self) -> Vec<SandboxViolation> {
        self.base.violations().snapshot()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SandboxViolation> {
        self.base.violations().subscribe()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn connect(socket_path: Option<&str>) -> Result<Docker> {
    match socket_path {
        Some(path) => {
            Docker::connect_with_unix(path, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("failed to configure container daemon client for {path}"))
        }
        None => Docker::connect_with_local_defaults()
            .context("failed to configure container daemon client"),
    }
}

#[cfg(not(unix))]
fn connect(socket_path: Option<&str>) -> Result<Docker> {
    if let Some(path) = socket_path {
        warn!(path, "socket_path is only honoured on unix; using local defaults");
    }
    Docker::connect_with_local_defaults().context("failed to configure container daemon client")
}

/// Read a seccomp profile for inline use. The content must be JSON.
fn load_seccomp_profile(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let profile = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seccomp profile {}", path.display()))?;
    serde_json::from_str::<serde_json::Value>(&profile)
        .with_context(|| format!("seccomp profile {} is not valid JSON", path.display()))?;
    Ok(Some(profile))
}

async fn remove_container(docker: &Docker, name: &str) {
    if let Err(error) = docker
        .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
        .await
    {
        debug!(container = %name, error = %error, "stop before removal failed");
    }
    match docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
    {
        Ok(()) => debug!(container = %name, "container removed"),
        Err(error) => warn!(container = %name, error = %error, "container removal failed"),
    }
}

/// Removes the container in the background if the execution future is
/// dropped before explicit cleanup ran.
#[derive(Debug)]
struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(
                    async move { remove_container(&docker, &name).await }
                        .instrument(info_span!("container_guard_cleanup")),
                );
            }
            Err(_) => warn!(container = %name, "no async runtime; container may leak"),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_seccomp_profile_fails_closed() {
        let err = load_seccomp_profile(Some(Path::new("/no/such/profile.json"))).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read seccomp profile"));
    }

    #[test]
    fn invalid_seccomp_profile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seccomp.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_seccomp_profile(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("not valid JSON"));
    }

    #[test]
    fn seccomp_profile_is_loaded_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seccomp.json");
        std::fs::write(&path, r#"{"defaultAction":"SCMP_ACT_ERRNO"}"#).unwrap();
        let profile = load_seccomp_profile(Some(&path)).unwrap().unwrap();
        assert!(profile.contains("SCMP_ACT_ERRNO"));
        assert!(load_seccomp_profile(None).unwrap().is_none());
    }

    #[tokio::test]
    async fn construction_fails_for_unreadable_seccomp_profile() {
        let mut config = SandboxConfig::hardened();
        config.container.seccomp_profile = Some("/no/such/profile.json".into());
        assert!(ContainerSandbox::new(config).is_err());
    }

    /// A sandbox pointed at a path that exists but is not a daemon socket.
    fn sandbox_without_daemon(dir: &Path) -> ContainerSandbox {
        let socket = dir.join("docker.sock");
        std::fs::write(&socket, "").unwrap();
        let mut config = SandboxConfig::hardened();
        config.container.socket_path = Some(socket.display().to_string());
        ContainerSandbox::new(config).unwrap()
    }

    #[tokio::test]
    async fn rejected_command_never_reaches_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_without_daemon(dir.path());
        let request = SkillRequest::new("invoke", serde_json::Value::Null, 1);

        let result = sandbox
            .execute("python3 skill.py; rm -rf /", dir.path(), &request, None)
            .await;

        assert!(!result.success);
        assert_eq!(result.runtime_used, RuntimeUsed::Container);
        assert_eq!(sandbox.violations()[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn unreachable_daemon_is_reported_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_without_daemon(dir.path());
        assert!(!sandbox.is_available().await);
    }
}

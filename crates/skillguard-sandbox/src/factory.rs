//! Configuration merging and runtime selection.

use crate::container::ContainerSandbox;
use crate::process::{ProcessCapabilities, ProcessSandbox};
use anyhow::{Result, bail};
use serde::Serialize;
use skillguard_core::{
    ContainerHardeningOverride, EnvPolicyOverride, FilesystemPolicyOverride,
    ResourceLimitsOverride, RuntimeKind, SandboxConfig, SandboxConfigOverride, SandboxExecutor,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long `Auto` waits for the daemon before choosing the process layer.
const DAEMON_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Apply `overrides` onto the hardened preset.
pub fn merge_with_defaults(overrides: &SandboxConfigOverride) -> SandboxConfig {
    merge(SandboxConfig::hardened(), overrides)
}

/// Apply `overrides` onto `base`, field by field.
///
/// Scalars replace. List fields are unioned with the base, keeping order
/// and dropping duplicates. The injected-environment map merges key by key
/// with the override winning. A network policy replaces as a whole.
pub fn merge(mut base: SandboxConfig, overrides: &SandboxConfigOverride) -> SandboxConfig {
    if let Some(enabled) = overrides.enabled {
        base.enabled = enabled;
    }
    if let Some(runtime) = overrides.runtime {
        base.runtime = runtime;
    }
    if let Some(network) = &overrides.network {
        base.network = network.clone();
    }

    if let Some(resources) = &overrides.resources {
        let ResourceLimitsOverride {
            memory_mb,
            cpu_cores,
            hard_timeout_ms,
            max_output_bytes,
            max_pids,
        } = resources;
        let limits = &mut base.resources;
        replace(&mut limits.memory_mb, *memory_mb);
        replace(&mut limits.cpu_cores, *cpu_cores);
        replace(&mut limits.hard_timeout_ms, *hard_timeout_ms);
        replace(&mut limits.max_output_bytes, *max_output_bytes);
        replace(&mut limits.max_pids, *max_pids);
    }

    if let Some(filesystem) = &overrides.filesystem {
        let FilesystemPolicyOverride {
            read_only,
            read_write_paths,
            read_only_paths,
            tmp_size_mb,
            mask_sensitive_paths,
        } = filesystem;
        let fs = &mut base.filesystem;
        replace(&mut fs.read_only, *read_only);
        union(&mut fs.read_write_paths, read_write_paths);
        union(&mut fs.read_only_paths, read_only_paths);
        replace(&mut fs.tmp_size_mb, *tmp_size_mb);
        replace(&mut fs.mask_sensitive_paths, *mask_sensitive_paths);
    }

    if let Some(EnvPolicyOverride { allow_list, inject }) = &overrides.env {
        union(&mut base.env.allow_list, allow_list);
        base.env
            .inject
            .extend(inject.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    if let Some(container) = &overrides.container {
        let ContainerHardeningOverride {
            image,
            pull_policy,
            seccomp_profile,
            socket_path,
            user,
            cap_drop,
            cap_add,
            no_new_privileges,
            cleanup_timeout_ms,
        } = container;
        let hardening = &mut base.container;
        replace(&mut hardening.image, image.clone());
        replace(&mut hardening.pull_policy, *pull_policy);
        if seccomp_profile.is_some() {
            hardening.seccomp_profile.clone_from(seccomp_profile);
        }
        if socket_path.is_some() {
            hardening.socket_path.clone_from(socket_path);
        }
        replace(&mut hardening.user, user.clone());
        union(&mut hardening.cap_drop, cap_drop);
        union(&mut hardening.cap_add, cap_add);
        replace(&mut hardening.no_new_privileges, *no_new_privileges);
        replace(&mut hardening.cleanup_timeout_ms, *cleanup_timeout_ms);
    }

    base
}

fn replace<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn union<T: PartialEq + Clone>(base: &mut Vec<T>, extra: &[T]) {
    for item in extra {
        if !base.contains(item) {
            base.push(item.clone());
        }
    }
}

/// Build an executor for a complete configuration.
///
/// `Auto` selects the container layer when its daemon answers within a
/// short probe and the process layer otherwise.
pub async fn create(config: SandboxConfig) -> Result<Arc<dyn SandboxExecutor>> {
    ensure_usable(&config)?;

    match config.runtime {
        RuntimeKind::Process => Ok(Arc::new(ProcessSandbox::new(config))),
        RuntimeKind::Container => Ok(Arc::new(ContainerSandbox::new(config)?)),
        RuntimeKind::Auto => {
            let container = match ContainerSandbox::new(config.clone()) {
                Ok(container) => container,
                Err(error) => {
                    info!(error = %format!("{error:#}"), "container runtime unusable; using process sandbox");
                    return Ok(Arc::new(ProcessSandbox::new(config)));
                }
            };
            if daemon_answers(&container).await {
                debug!("container daemon reachable; using container sandbox");
                Ok(Arc::new(container))
            } else {
                info!("container daemon unreachable; using process sandbox");
                Ok(Arc::new(ProcessSandbox::new(config)))
            }
        }
    }
}

/// Merge `overrides` onto the hardened preset, then [`create`].
pub async fn create_from_override(
    overrides: &SandboxConfigOverride,
) -> Result<Arc<dyn SandboxExecutor>> {
    create(merge_with_defaults(overrides)).await
}

fn ensure_usable(config: &SandboxConfig) -> Result<()> {
    config.validate()?;
    if !config.enabled {
        bail!("sandbox is disabled; refusing to run untrusted skills without isolation");
    }
    Ok(())
}

/// A process-layer executor regardless of the `runtime` field.
pub fn create_process_sandbox(overrides: &SandboxConfigOverride) -> Result<ProcessSandbox> {
    let mut config = merge_with_defaults(overrides);
    config.runtime = RuntimeKind::Process;
    ensure_usable(&config)?;
    Ok(ProcessSandbox::new(config))
}

/// A container-layer executor regardless of the `runtime` field.
pub fn create_container_sandbox(overrides: &SandboxConfigOverride) -> Result<ContainerSandbox> {
    let mut config = merge_with_defaults(overrides);
    config.runtime = RuntimeKind::Container;
    ensure_usable(&config)?;
    ContainerSandbox::new(config)
}

async fn daemon_answers(container: &ContainerSandbox) -> bool {
    tokio::time::timeout(DAEMON_PROBE_TIMEOUT, container.is_available())
        .await
        .unwrap_or(false)
}

/// What each layer can do on this host.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxProbe {
    pub process: ProcessCapabilities,
    pub process_gaps: Vec<&'static str>,
    pub container_available: bool,
    pub container_error: Option<String>,
}

pub async fn probe(config: &SandboxConfig) -> SandboxProbe {
    let process = ProcessCapabilities::detect();
    let (container_available, container_error) = match ContainerSandbox::new(config.clone()) {
        Ok(container) if daemon_answers(&container).await => (true, None),
        Ok(_) => (false, Some("container daemon did not answer".to_owned())),
        Err(error) => (false, Some(format!("{error:#}"))),
    };
    SandboxProbe {
        process,
        process_gaps: process.gaps(),
        container_available,
        container_error,
    }
}

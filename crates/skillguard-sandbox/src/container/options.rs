//! Translation of a [`SandboxConfig`] into a container create request.

use crate::guard::ParsedCommand;
use bollard::container::Config;
use bollard::models::HostConfig;
use skillguard_core::{ContainerHardeningConfig, FilesystemPolicy, NetworkPolicy, SandboxConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Where the skill directory appears inside the container.
pub const SKILL_MOUNT: &str = "/skill";
pub const CONTAINER_NAME_PREFIX: &str = "skillguard-sandbox-";
pub const MANAGED_LABEL: &str = "skillguard.managed";
pub const SKILL_LABEL: &str = "skillguard.skill";

/// Kernel interfaces hidden from the skill when masking is enabled.
pub const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
];

pub const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Make the container the OOM killer's preferred victim.
const OOM_SCORE_ADJ: i64 = 500;
const NANOS_PER_CPU: f64 = 1e9;

pub(crate) fn container_config(
    config: &SandboxConfig,
    parsed: &ParsedCommand,
    env: &BTreeMap<String, String>,
    seccomp_profile: Option<&str>,
    skill_id: &str,
) -> Config<String> {
    let mut cmd = vec![container_program(&parsed.program)];
    cmd.extend(parsed.args.iter().map(|arg| container_arg(arg, &parsed.cwd)));

    Config {
        image: Some(config.container.image.clone()),
        cmd: Some(cmd),
        env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        working_dir: Some(SKILL_MOUNT.to_owned()),
        user: Some(config.container.user.clone()),
        labels: Some(HashMap::from([
            (MANAGED_LABEL.to_owned(), "true".to_owned()),
            (SKILL_LABEL.to_owned(), skill_id.to_owned()),
        ])),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(false),
        network_disabled: Some(config.network.is_deny()),
        host_config: Some(host_config(config, &parsed.cwd, seccomp_profile)),
        ..Default::default()
    }
}

fn host_config(config: &SandboxConfig, skill_dir: &Path, seccomp_profile: Option<&str>) -> HostConfig {
    let limits = &config.resources;
    let fs = &config.filesystem;
    let hardening = &config.container;
    let memory = i64::try_from(limits.memory_bytes()).unwrap_or(i64::MAX);

    HostConfig {
        binds: Some(binds(fs, skill_dir)),
        memory: Some(memory),
        // Equal to memory: no swap headroom.
        memory_swap: Some(memory),
        nano_cpus: Some((limits.cpu_cores * NANOS_PER_CPU) as i64),
        pids_limit: Some(i64::from(limits.max_pids)),
        oom_kill_disable: Some(false),
        oom_score_adj: Some(OOM_SCORE_ADJ),
        network_mode: Some(network_mode(&config.network).to_owned()),
        readonly_rootfs: Some(fs.read_only),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_owned(),
            format!("rw,noexec,nosuid,size={}m", fs.tmp_size_mb),
        )])),
        cap_drop: Some(hardening.cap_drop.clone()),
        cap_add: (!hardening.cap_add.is_empty()).then(|| hardening.cap_add.clone()),
        security_opt: Some(security_opts(hardening, seccomp_profile)),
        masked_paths: fs.mask_sensitive_paths.then(|| to_strings(MASKED_PATHS)),
        readonly_paths: fs.mask_sensitive_paths.then(|| to_strings(READONLY_PATHS)),
        ..Default::default()
    }
}

fn binds(fs: &FilesystemPolicy, skill_dir: &Path) -> Vec<String> {
    let mode = if fs.read_only { "ro" } else { "rw" };
    let mut binds = vec![format!("{}:{SKILL_MOUNT}:{mode}", skill_dir.display())];

    for path in &fs.read_only_paths {
        if path.exists() {
            binds.push(format!("{0}:{0}:ro", path.display()));
        } else {
            debug!(path = %path.display(), "read-only mount source missing, skipped");
        }
    }
    for path in &fs.read_write_paths {
        binds.push(format!("{0}:{0}:rw", path.display()));
    }
    binds
}

/// Allow-list rules cannot be expressed as a network mode; they fall back
/// to the bridge network.
fn network_mode(policy: &NetworkPolicy) -> &'static str {
    match policy {
        NetworkPolicy::Deny => "none",
        NetworkPolicy::Allow | NetworkPolicy::AllowList(_) => "bridge",
    }
}

fn security_opts(hardening: &ContainerHardeningConfig, seccomp_profile: Option<&str>) -> Vec<String> {
    let mut opts = Vec::new();
    if hardening.no_new_privileges {
        opts.push("no-new-privileges:true".to_owned());
    }
    if let Some(profile) = seccomp_profile {
        opts.push(format!("seccomp={profile}"));
    }
    opts
}

/// Host interpreter paths mean nothing inside the image; use its PATH.
fn container_program(program: &str) -> String {
    Path::new(program)
        .file_name()
        .filter(|_| program.starts_with('/'))
        .map_or_else(|| program.to_owned(), |name| name.to_string_lossy().into_owned())
}

/// Rewrite absolute host paths inside the skill directory (including the
/// value half of `--flag=value`) to their location under [`SKILL_MOUNT`].
fn container_arg(arg: &str, skill_dir: &Path) -> String {
    if let Some((flag, value)) = arg.split_once('=')
        && flag.starts_with('-')
    {
        return format!("{flag}={}", remap(value, skill_dir));
    }
    remap(arg, skill_dir)
}

fn remap(value: &str, skill_dir: &Path) -> String {
    match Path::new(value).strip_prefix(skill_dir) {
        Ok(rel) if rel.as_os_str().is_empty() => SKILL_MOUNT.to_owned(),
        Ok(rel) => format!("{SKILL_MOUNT}/{}", rel.display()),
        Err(_) => value.to_owned(),
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

//! Sandbox configuration model.
//!
//! Pure data: resource limits, filesystem/network/environment policy,
//! container hardening, and the two presets every executor starts from.
//! A config is built once per executor by merging a [`SandboxConfigOverride`]
//! onto a preset and is never mutated afterwards.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// 1 TiB. Larger values overflow the byte count handed to the runtimes.
const MAX_MEMORY_MB: u64 = 1024 * 1024;

/// Resource ceilings applied to one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
    /// CPU share in fractional cores (0.5 = half a core).
    pub cpu_cores: f64,
    /// Hard wall-clock timeout in milliseconds.
    pub hard_timeout_ms: u64,
    /// Maximum combined stdout+stderr bytes. Each stream gets half.
    pub max_output_bytes: usize,
    /// Maximum number of processes/threads.
    pub max_pids: u32,
}

impl ResourceLimits {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    /// Byte cap for a single output stream.
    pub fn per_stream_output_limit(&self) -> usize {
        self.max_output_bytes / 2
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.memory_mb > 0, "resources.memory_mb must be positive");
        ensure!(
            self.memory_mb <= MAX_MEMORY_MB,
            "resources.memory_mb must not exceed {MAX_MEMORY_MB}, got {}",
            self.memory_mb
        );
        ensure!(
            self.cpu_cores.is_finite() && self.cpu_cores > 0.0,
            "resources.cpu_cores must be positive, got {}",
            self.cpu_cores
        );
        ensure!(
            self.hard_timeout_ms > 0,
            "resources.hard_timeout_ms must be positive"
        );
        ensure!(
            self.max_output_bytes >= 2,
            "resources.max_output_bytes must allow at least one byte per stream"
        );
        ensure!(self.max_pids > 0, "resources.max_pids must be positive");
        Ok(())
    }
}

/// What the skill may see and write on the host filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Mount the skill directory read-only (and, in containers, the root fs).
    pub read_only: bool,
    /// Extra host paths mounted read-write.
    pub read_write_paths: Vec<PathBuf>,
    /// Extra host paths mounted read-only. Missing paths are skipped.
    pub read_only_paths: Vec<PathBuf>,
    /// Size cap for the writable scratch area, in MiB.
    pub tmp_size_mb: u64,
    /// Mask kernel-information paths such as `/proc/kcore` and `/sys/firmware`.
    pub mask_sensitive_paths: bool,
}

/// Environment propagated into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvPolicy {
    /// Host variable names copied through when present and not sensitive.
    pub allow_list: Vec<String>,
    /// Variables always set, overriding anything propagated.
    pub inject: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// One allowed outbound destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Outbound network policy.
///
/// Only `Deny` is verifiably enforced, and only by the container layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Deny,
    Allow,
    AllowList(Vec<NetworkRule>),
}

impl NetworkPolicy {
    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny)
    }
}

/// When to refresh the container image before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    IfMissing,
    Never,
}

/// Options for the container layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHardeningConfig {
    pub image: String,
    pub pull_policy: PullPolicy,
    /// Seccomp profile (JSON). `None` uses the daemon's default profile.
    pub seccomp_profile: Option<PathBuf>,
    /// Daemon socket. `None` uses the client's local defaults.
    pub socket_path: Option<String>,
    /// `uid:gid` the skill runs as. Never root.
    pub user: String,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub no_new_privileges: bool,
    /// Upper bound on stop + remove after an execution, in milliseconds.
    pub cleanup_timeout_ms: u64,
}

impl ContainerHardeningConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

/// Which sandbox implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Process,
    Container,
    /// Container when the daemon answers, process otherwise.
    Auto,
}

/// Full sandbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub runtime: RuntimeKind,
    pub resources: ResourceLimits,
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    pub env: EnvPolicy,
    pub container: ContainerHardeningConfig,
}

const DEFAULT_IMAGE: &str = "python:3.12-slim";
const NOBODY: &str = "65534:65534";

fn default_env_allow_list() -> Vec<String> {
    ["PATH", "HOME", "LANG", "LC_ALL", "TZ"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_env_inject() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("SKILLGUARD_SANDBOX".to_owned(), "1".to_owned()),
        ("PYTHONDONTWRITEBYTECODE".to_owned(), "1".to_owned()),
    ])
}

impl SandboxConfig {
    /// Hardened default: no network, 256 MiB, half a core, 30 s, read-only root.
    pub fn hardened() -> Self {
        Self {
            enabled: true,
            runtime: RuntimeKind::Auto,
            resources: ResourceLimits {
                memory_mb: 256,
                cpu_cores: 0.5,
                hard_timeout_ms: 30_000,
                max_output_bytes: 1024 * 1024,
                max_pids: 64,
            },
            filesystem: FilesystemPolicy {
                read_only: true,
                read_write_paths: Vec::new(),
                read_only_paths: Vec::new(),
                tmp_size_mb: 64,
                mask_sensitive_paths: true,
            },
            network: NetworkPolicy::Deny,
            env: EnvPolicy {
                allow_list: default_env_allow_list(),
                inject: default_env_inject(),
            },
            container: ContainerHardeningConfig {
                image: DEFAULT_IMAGE.to_owned(),
                pull_policy: PullPolicy::IfMissing,
                seccomp_profile: None,
                socket_path: None,
                user: NOBODY.to_owned(),
                cap_drop: vec!["ALL".to_owned()],
                cap_add: Vec::new(),
                no_new_privileges: true,
                cleanup_timeout_ms: 10_000,
            },
        }
    }

    /// Permissive preset for local skill development: network on, larger
    /// limits, writable skill directory and root filesystem.
    pub fn development() -> Self {
        let mut config = Self::hardened();
        config.resources = ResourceLimits {
            memory_mb: 1024,
            cpu_cores: 2.0,
            hard_timeout_ms: 120_000,
            max_output_bytes: 10 * 1024 * 1024,
            max_pids: 256,
        };
        config.filesystem.read_only = false;
        config.filesystem.tmp_size_mb = 256;
        config.filesystem.mask_sensitive_paths = false;
        config.network = NetworkPolicy::Allow;
        config
    }

    pub fn validate(&self) -> Result<()> {
        self.resources.validate()?;
        ensure!(
            self.filesystem.tmp_size_mb > 0,
            "filesystem.tmp_size_mb must be positive"
        );
        ensure!(
            !self.container.image.trim().is_empty(),
            "container.image must not be empty"
        );
        ensure!(
            self.container.cleanup_timeout_ms > 0,
            "container.cleanup_timeout_ms must be positive"
        );
        let uid = self.container.user.split(':').next().unwrap_or_default();
        ensure!(
            !uid.is_empty() && uid != "0" && uid != "root",
            "container.user must be a non-root identity, got '{}'",
            self.container.user
        );
        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::hardened()
    }
}

/// Named presets selectable from configuration files and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Hardened,
    Development,
}

impl Preset {
    pub fn config(self) -> SandboxConfig {
        match self {
            Self::Hardened => SandboxConfig::hardened(),
            Self::Development => SandboxConfig::development(),
        }
    }
}

// ---------------------------------------------------------------------------
// Partial overrides
// ---------------------------------------------------------------------------

/// Caller-supplied partial configuration. Every field is optional; the
/// factory merges it onto a preset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfigOverride {
    pub enabled: Option<bool>,
    pub runtime: Option<RuntimeKind>,
    pub resources: Option<ResourceLimitsOverride>,
    pub filesystem: Option<FilesystemPolicyOverride>,
    pub network: Option<NetworkPolicy>,
    pub env: Option<EnvPolicyOverride>,
    pub container: Option<ContainerHardeningOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimitsOverride {
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub hard_timeout_ms: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub max_pids: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemPolicyOverride {
    pub read_only: Option<bool>,
    pub read_write_paths: Vec<PathBuf>,
    pub read_only_paths: Vec<PathBuf>,
    pub tmp_size_mb: Option<u64>,
    pub mask_sensitive_paths: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvPolicyOverride {
    pub allow_list: Vec<String>,
    pub inject: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerHardeningOverride {
    pub image: Option<String>,
    pub pull_policy: Option<PullPolicy>,
    pub seccomp_profile: Option<PathBuf>,
    pub socket_path: Option<String>,
    pub user: Option<String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub no_new_privileges: Option<bool>,
    pub cleanup_timeout_ms: Option<u64>,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardened_preset_matches_documented_defaults() {
        let config = SandboxConfig::hardened();
        assert!(config.enabled);
        assert!(config.network.is_deny());
        assert_eq!(config.resources.memory_mb, 256);
        assert!((config.resources.cpu_cores - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.resources.hard_timeout_ms, 30_000);
        assert!(config.filesystem.read_only);
        assert_eq!(config.container.cap_drop, vec!["ALL".to_owned()]);
        assert!(config.container.no_new_privileges);
        config.validate().unwrap();
    }

    #[test]
    fn development_preset_is_permissive() {
        let config = SandboxConfig::development();
        assert_eq!(config.network, NetworkPolicy::Allow);
        assert!(!config.filesystem.read_only);
        assert!(config.resources.memory_mb > SandboxConfig::hardened().resources.memory_mb);
        config.validate().unwrap();
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = SandboxConfig::hardened();
        config.resources.hard_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hard_timeout_ms"));

        let mut config = SandboxConfig::hardened();
        config.resources.cpu_cores = 0.0;
        assert!(config.validate().is_err());

        let mut config = SandboxConfig::hardened();
        config.resources.max_pids = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_memory_is_rejected_and_never_wraps() {
        let mut config = SandboxConfig::hardened();
        config.resources.memory_mb = u64::MAX / 1024 + 1;
        assert_eq!(config.resources.memory_bytes(), u64::MAX);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("memory_mb"));

        config.resources.memory_mb = MAX_MEMORY_MB;
        assert_eq!(config.resources.memory_bytes(), 1 << 40);
        config.validate().unwrap();
    }

    #[test]
    fn root_user_is_rejected() {
        for user in ["0", "0:0", "root", ":1000"] {
            let mut config = SandboxConfig::hardened();
            config.container.user = user.to_owned();
            assert!(config.validate().is_err(), "user {user} should be rejected");
        }
    }

    #[test]
    fn per_stream_limit_is_half() {
        let limits = SandboxConfig::hardened().resources;
        assert_eq!(limits.per_stream_output_limit(), limits.max_output_bytes / 2);
    }

    #[test]
    fn override_parses_from_toml() {
        let parsed: SandboxConfigOverride = toml::from_str(
            r#"
runtime = "process"
network = "allow"

[resources]
memory_mb = 512

[env]
allow_list = ["MY_VAR"]
inject = { FOO = "bar" }

[container]
pull_policy = "if-missing"
"#,
        )
        .unwrap();

        assert_eq!(parsed.runtime, Some(RuntimeKind::Process));
        assert_eq!(parsed.network, Some(NetworkPolicy::Allow));
        assert_eq!(parsed.resources.unwrap().memory_mb, Some(512));
        let env = parsed.env.unwrap();
        assert_eq!(env.allow_list, vec!["MY_VAR".to_owned()]);
        assert_eq!(env.inject.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(
            parsed.container.unwrap().pull_policy,
            Some(PullPolicy::IfMissing)
        );
    }

    #[test]
    fn network_allow_list_parses_from_toml() {
        let parsed: SandboxConfigOverride = toml::from_str(
            r#"
[[network.allow_list]]
host = "pypi.org"
ports = [443]
"#,
        )
        .unwrap();

        let Some(NetworkPolicy::AllowList(rules)) = parsed.network else {
            panic!("expected allow list");
        };
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host, "pypi.org");
        assert_eq!(rules[0].ports, vec![443]);
        assert_eq!(rules[0].protocol, Protocol::Tcp);
    }

    #[test]
    fn unknown_override_fields_are_rejected() {
        let parsed: Result<SandboxConfigOverride, _> = toml::from_str("memroy_mb = 5");
        assert!(parsed.is_err());
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use skillguard_core::{Preset, SandboxConfig, SandboxConfigOverride};
use skillguard_monitor::MonitorConfig;
use skillguard_sandbox::merge;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "skillguard.toml";

/// Contents of `skillguard.toml`. Every table is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// Base the `[sandbox]` table is merged onto.
    pub preset: Preset,
    pub sandbox: SandboxConfigOverride,
    pub monitor: MonitorConfig,
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load the explicit path, or the first default location that exists,
    /// or fall back to built-in defaults.
    pub(crate) fn discover(explicit: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(Path::new(path));
        }
        match Self::default_locations().into_iter().find(|p| p.exists()) {
            Some(path) => {
                debug!(path = %path.display(), "using config file");
                Self::load(&path)
            }
            None => {
                debug!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            candidates.push(PathBuf::from(config_dir).join("skillguard").join(CONFIG_FILE_NAME));
        }
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(PathBuf::from(home).join(".config/skillguard").join(CONFIG_FILE_NAME));
        }
        candidates
    }

    /// The full sandbox configuration: `preset` (or the file's preset)
    /// with the `[sandbox]` table merged on top.
    pub(crate) fn sandbox_config(&self, preset: Option<Preset>) -> SandboxConfig {
        merge(preset.unwrap_or(self.preset).config(), &self.sandbox)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use skillguard_core::{NetworkPolicy, RuntimeKind};

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let (_dir, path) = write("");
        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sandbox_config(None), SandboxConfig::hardened());
    }

    #[test]
    fn sandbox_and_monitor_tables_are_read() {
        let (_dir, path) = write(
            r#"
preset = "development"

[sandbox]
runtime = "process"

[sandbox.resources]
hard_timeout_ms = 5000

[monitor]
circuit_breaker_threshold = 5
log_file = "/var/log/skillguard/violations.jsonl"
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.monitor.circuit_breaker_threshold, 5);
        assert_eq!(config.monitor.retention_hours, 24);

        let sandbox = config.sandbox_config(None);
        assert_eq!(sandbox.runtime, RuntimeKind::Process);
        assert_eq!(sandbox.resources.hard_timeout_ms, 5000);
        assert_eq!(sandbox.network, NetworkPolicy::Allow);
    }

    #[test]
    fn cli_preset_wins_over_file_preset() {
        let (_dir, path) = write("preset = \"development\"\n");
        let config = Config::load(&path).unwrap();
        let sandbox = config.sandbox_config(Some(Preset::Hardened));
        assert_eq!(sandbox.network, NetworkPolicy::Deny);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_dir, path) = write("[sandbox]\nmemroy_mb = 1\n");
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::discover(missing.to_str()).is_err());
    }
}

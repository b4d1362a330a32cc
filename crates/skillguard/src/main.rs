#![allow(clippy::print_stdout)] // CLI binary: stdout carries the result

mod cli;
mod config;
mod tracing_setup;

use anyhow::{Context, Result};
use clap::Parser;
use skillguard_core::SkillRequest;
use skillguard_monitor::SandboxMonitor;
use skillguard_sandbox::factory;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands, ExecArgs};
use crate::config::Config;

/// Upper bound on waiting for the monitor to drain the executor's violations.
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "skillguard starting"
    );

    let config = Config::discover(cli.config.as_deref())?;
    match cli.command {
        Commands::Exec(args) => cmd_exec(&config, args).await,
        Commands::Probe => cmd_probe(&config).await,
    }
}

// ---------------------------------------------------------------------------
// cmd_exec: run one request through the sandbox
// ---------------------------------------------------------------------------

async fn cmd_exec(config: &Config, args: ExecArgs) -> Result<ExitCode> {
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params is not valid JSON")?;
    let skill_dir = resolve_skill_dir(&args.skill_dir)?;

    let mut sandbox_config = config.sandbox_config(args.preset.map(Into::into));
    if let Some(runtime) = args.runtime {
        sandbox_config.runtime = runtime.into();
    }

    let executor = factory::create(sandbox_config).await?;
    let monitor = SandboxMonitor::new(config.monitor.clone())?;
    let forwarder = monitor.attach(executor.as_ref(), args.skill_id.clone());
    info!(runtime = %executor.runtime(), "executor ready");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling execution");
            interrupt.cancel();
        }
    });

    let command = args.command.join(" ");
    let request = SkillRequest::new(args.method, params, 1);
    let result = executor
        .execute(&command, &skill_dir, &request, Some(&cancel))
        .await;

    // The forwarder ends once the executor's violation channel closes.
    drop(executor);
    if tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, forwarder)
        .await
        .is_err()
    {
        warn!("violation forwarder did not finish; report may be incomplete");
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    if args.report {
        println!("\n{}", monitor.generate_report());
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// The executors only accept absolute skill directories; `--skill-dir` may be
/// relative to the invoking shell.
fn resolve_skill_dir(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("skill directory not found: {}", path.display()))
}

// ---------------------------------------------------------------------------
// cmd_probe: host capability report
// ---------------------------------------------------------------------------

async fn cmd_probe(config: &Config) -> Result<ExitCode> {
    let probe = factory::probe(&config.sandbox_config(None)).await;
    println!("{}", serde_json::to_string_pretty(&probe)?);
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_skill_dir_becomes_absolute() {
        let resolved = resolve_skill_dir(Path::new(".")).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved, std::env::current_dir().unwrap().canonicalize().unwrap());
    }

    #[test]
    fn missing_skill_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_skill_dir(&dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("skill directory not found"));
    }
}

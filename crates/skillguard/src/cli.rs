use clap::{Parser, Subcommand, ValueEnum};
use skillguard_core::{Preset, RuntimeKind};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skillguard", version, about = "Run untrusted skills inside a sandbox")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run one skill request and print the result as JSON.
    Exec(ExecArgs),
    /// Report which sandbox layers this host supports.
    Probe,
}

#[derive(clap::Args)]
pub(crate) struct ExecArgs {
    /// Overrides the runtime from the config file.
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeArg>,

    /// Preset the config file's `[sandbox]` table is merged onto.
    #[arg(long, value_enum)]
    pub preset: Option<PresetArg>,

    #[arg(long, value_name = "DIR")]
    pub skill_dir: PathBuf,

    #[arg(long, default_value = "invoke")]
    pub method: String,

    /// Request params as a JSON document.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub params: String,

    /// Attribute violations to this id instead of the skill directory name.
    #[arg(long)]
    pub skill_id: Option<String>,

    /// Print the markdown violation report after the result.
    #[arg(long)]
    pub report: bool,

    /// Command to run, e.g. `-- python3 skill.py`.
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum RuntimeArg {
    Process,
    Container,
    Auto,
}

impl From<RuntimeArg> for RuntimeKind {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Process => Self::Process,
            RuntimeArg::Container => Self::Container,
            RuntimeArg::Auto => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum PresetArg {
    Hardened,
    Development,
}

impl From<PresetArg> for Preset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::Hardened => Self::Hardened,
            PresetArg::Development => Self::Development,
        }
    }
}

//! Execution layers for untrusted skills.
//!
//! Two [`SandboxExecutor`] implementations share one validation, environment
//! and output-capping pipeline:
//!
//! - [`ProcessSandbox`] runs the skill as a host child process in its own
//!   process group under a virtual-memory ceiling.
//! - [`ContainerSandbox`] runs it in an ephemeral, locked-down container
//!   through the Docker Engine API.
//!
//! [`factory`] merges partial configuration onto the hardened preset and
//! picks a layer.

mod base;
pub mod container;
pub mod env;
pub mod factory;
pub mod guard;
pub mod output;
pub mod process;
pub mod violations;

pub use container::ContainerSandbox;
pub use factory::{
    SandboxProbe, create, create_container_sandbox, create_from_override,
    create_process_sandbox, merge, merge_with_defaults, probe,
};
pub use process::{ProcessCapabilities, ProcessSandbox};
pub use skillguard_core::SandboxExecutor;

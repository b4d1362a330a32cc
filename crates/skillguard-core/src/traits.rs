//! The contract every sandbox layer implements.
//!
//! Implementations live in skillguard-sandbox (process and container
//! layers); the monitor in skillguard-monitor consumes violation streams
//! through [`SandboxExecutor::subscribe`].

use crate::types::{RuntimeUsed, SandboxResult, SandboxViolation, SkillRequest};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs untrusted skill commands behind resource, filesystem, network and
/// privilege boundaries.
///
/// An executor is reusable: any number of `execute` calls may run
/// concurrently against one instance, and the violation list accumulates
/// for the lifetime of the instance.
#[async_trait]
pub trait SandboxExecutor: Send + Sync + std::fmt::Debug {
    /// The layer this executor runs commands in.
    fn runtime(&self) -> RuntimeUsed;

    /// Validate and run `command` in `skill_dir`, writing `request` to its
    /// stdin.
    ///
    /// Never fails: validation rejections, infrastructure failures, timeouts
    /// and cancellations are all reported through the returned result.
    async fn execute(
        &self,
        command: &str,
        skill_dir: &Path,
        request: &SkillRequest,
        cancel: Option<&CancellationToken>,
    ) -> SandboxResult;

    /// Whether this layer can run commands on this host right now.
    async fn is_available(&self) -> bool;

    /// Snapshot of every violation recorded by this instance, oldest first.
    fn violations(&self) -> Vec<SandboxViolation>;

    /// Receive every violation recorded from now on.
    ///
    /// The channel closes when the executor is dropped.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SandboxViolation>;
}

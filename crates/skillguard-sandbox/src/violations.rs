//! Per-executor violation log with live fan-out to subscribers.

use skillguard_core::{SandboxViolation, Severity};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Append-only list of violations plus the senders of every live
/// subscription. Recording never blocks on a subscriber.
#[derive(Debug, Default)]
pub struct ViolationLog {
    recorded: Mutex<Vec<SandboxViolation>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SandboxViolation>>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ViolationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, violation: SandboxViolation) {
        if violation.severity.is_blocking() {
            warn!(
                kind = %violation.kind,
                severity = %violation.severity,
                skill_id = violation.skill_id.as_deref().unwrap_or("-"),
                detail = %violation.detail,
                "sandbox violation"
            );
        } else {
            debug!(
                kind = %violation.kind,
                severity = %violation.severity,
                skill_id = violation.skill_id.as_deref().unwrap_or("-"),
                detail = %violation.detail,
                "sandbox violation"
            );
        }

        lock(&self.subscribers).retain(|tx| tx.send(violation.clone()).is_ok());
        lock(&self.recorded).push(violation);
    }

    /// Copy of everything recorded so far, oldest first.
    pub fn snapshot(&self) -> Vec<SandboxViolation> {
        lock(&self.recorded).clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SandboxViolation> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        lock(&self.recorded).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop recorded history. Subscriptions stay open.
    pub fn clear(&self) {
        lock(&self.recorded).clear();
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use skillguard_core::ViolationKind;

    fn violation(detail: &str) -> SandboxViolation {
        SandboxViolation::new(ViolationKind::Timeout, Severity::Warn, detail, None)
    }

    #[test]
    fn records_in_order() {
        let log = ViolationLog::new();
        log.record(violation("a"));
        log.record(violation("b"));
        let details: Vec<_> = log.snapshot().into_iter().map(|v| v.detail).collect();
        assert_eq!(details, ["a", "b"]);
    }

    #[test]
    fn subscribers_see_only_later_violations() {
        let log = ViolationLog::new();
        log.record(violation("before"));
        let mut rx = log.subscribe();
        log.record(violation("after"));
        assert_eq!(rx.try_recv().unwrap().detail, "after");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let log = ViolationLog::new();
        let rx = log.subscribe();
        drop(rx);
        log.record(violation("x"));
        assert!(lock(&log.subscribers).is_empty());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn clear_keeps_subscriptions() {
        let log = ViolationLog::new();
        let mut rx = log.subscribe();
        log.record(violation("x"));
        log.clear();
        assert!(log.is_empty());
        log.record(violation("y"));
        assert_eq!(rx.try_recv().unwrap().detail, "x");
        assert_eq!(rx.try_recv().unwrap().detail, "y");
    }
}

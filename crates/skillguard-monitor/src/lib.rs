//! Cross-execution violation monitor.
//!
//! Aggregates violations per skill, opens a per-skill circuit breaker once
//! critical violations reach a threshold, writes a durable JSONL log,
//! forwards critical events to an optional webhook, purges stale stats on a
//! timer, and renders a markdown report.

mod config;
mod report;
mod sink;
mod stats;

pub use config::MonitorConfig;
pub use stats::SkillViolationStats;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sink::{ViolationLogFile, WebhookAlerter};
use skillguard_core::{SandboxExecutor, SandboxViolation, Severity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Key for violations that carry no skill identity.
pub const UNATTRIBUTED_SKILL: &str = "unknown";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// State changes other components can react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    CircuitOpened {
        skill_id: String,
        critical_count: u64,
        at: DateTime<Utc>,
    },
    CircuitReset {
        skill_id: String,
    },
    Purged {
        removed: usize,
    },
}

/// Shared handle; clones observe and mutate the same state.
#[derive(Debug, Clone)]
pub struct SandboxMonitor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: MonitorConfig,
    stats: Mutex<HashMap<String, SkillViolationStats>>,
    events: broadcast::Sender<MonitorEvent>,
    log: Option<ViolationLogFile>,
    alerts: Option<WebhookAlerter>,
}

impl SandboxMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        let log = config
            .log_file
            .as_deref()
            .map(ViolationLogFile::open)
            .transpose()?;
        let alerts = config
            .alert_webhook
            .as_deref()
            .map(WebhookAlerter::new)
            .transpose()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                stats: Mutex::new(HashMap::new()),
                events,
                log,
                alerts,
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    fn stats(&self) -> MutexGuard<'_, HashMap<String, SkillViolationStats>> {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one violation into its skill's stats.
    ///
    /// Opens the skill's circuit when its critical count reaches the
    /// threshold, emitting [`MonitorEvent::CircuitOpened`] once per opening.
    pub fn record_violation(&self, violation: &SandboxViolation) {
        let skill_id = violation
            .skill_id
            .clone()
            .unwrap_or_else(|| UNATTRIBUTED_SKILL.to_owned());
        let threshold = self.inner.config.circuit_breaker_threshold;

        let opened = {
            let mut stats = self.stats();
            let entry = stats
                .entry(skill_id.clone())
                .or_insert_with(|| SkillViolationStats::new(&skill_id, violation.timestamp));
            entry.apply(violation);
            entry.trip_if_due(threshold).then_some(entry.critical_count)
        };

        if let Some(log) = &self.inner.log {
            log.append(violation);
        }
        if violation.severity == Severity::Critical
            && let Some(alerts) = &self.inner.alerts
        {
            alerts.alert(violation);
        }

        if let Some(critical_count) = opened {
            warn!(
                skill_id = %skill_id,
                critical_count,
                threshold,
                "circuit breaker opened; skill is blocked"
            );
            let _ = self.inner.events.send(MonitorEvent::CircuitOpened {
                skill_id,
                critical_count,
                at: Utc::now(),
            });
        }
    }

    pub fn is_circuit_broken(&self, skill_id: &str) -> bool {
        self.stats()
            .get(skill_id)
            .is_some_and(|s| s.circuit_broken)
    }

    /// Close a skill's circuit and zero its critical count.
    pub fn reset_circuit(&self, skill_id: &str) {
        let was_open = match self.stats().get_mut(skill_id) {
            Some(stats) => {
                let was_open = stats.circuit_broken;
                stats.reset_circuit();
                was_open
            }
            None => false,
        };
        if was_open {
            info!(skill_id, "circuit breaker reset");
            let _ = self.inner.events.send(MonitorEvent::CircuitReset {
                skill_id: skill_id.to_owned(),
            });
        }
    }

    pub fn get_stats(&self, skill_id: &str) -> Option<SkillViolationStats> {
        self.stats().get(skill_id).cloned()
    }

    /// All stats, ordered by skill id.
    pub fn get_all_stats(&self) -> Vec<SkillViolationStats> {
        let mut all: Vec<_> = self.stats().values().cloned().collect();
        all.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));
        all
    }

    /// The `n` skills with the most violations, most first.
    pub fn get_top_offenders(&self, n: usize) -> Vec<SkillViolationStats> {
        let mut all = self.get_all_stats();
        all.sort_by(|a, b| b.total_violations.cmp(&a.total_violations));
        all.truncate(n);
        all
    }

    /// Drop stats idle past the retention window. Skills with an open
    /// circuit are kept so a purge never unblocks them.
    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Utc::now())
    }

    pub fn purge_stale_at(&self, now: DateTime<Utc>) -> usize {
        // A window reaching past the earliest representable instant keeps everything.
        let Some(cutoff) = now.checked_sub_signed(self.inner.config.retention()) else {
            return 0;
        };
        let removed = {
            let mut stats = self.stats();
            let before = stats.len();
            stats.retain(|_, s| s.circuit_broken || s.last_violation_at >= cutoff);
            before - stats.len()
        };
        if removed > 0 {
            debug!(removed, "purged stale violation stats");
            let _ = self.inner.events.send(MonitorEvent::Purged { removed });
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Markdown summary: blocked skills, per-skill table, type distribution.
    pub fn generate_report(&self) -> String {
        report::render(&self.get_all_stats(), Utc::now())
    }

    /// Feed every violation `executor` records from now on into this
    /// monitor. With `skill_id`, violations are re-tagged with it.
    ///
    /// The task ends when the executor is dropped.
    pub fn attach(
        &self,
        executor: &dyn SandboxExecutor,
        skill_id: Option<String>,
    ) -> JoinHandle<()> {
        let mut violations = executor.subscribe();
        let monitor = self.clone();
        let span = info_span!("monitor_attach", runtime = %executor.runtime());

        tokio::spawn(
            async move {
                while let Some(violation) = violations.recv().await {
                    let violation = match &skill_id {
                        Some(id) => violation.tagged(id.clone()),
                        None => violation,
                    };
                    monitor.record_violation(&violation);
                }
                debug!("executor violation stream closed");
            }
            .instrument(span),
        )
    }

    /// Purge stale stats every `purge_interval` until `shutdown` fires.
    pub fn spawn_purge_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.spawn_purge_loop_with_interval(shutdown, self.inner.config.purge_interval())
    }

    pub fn spawn_purge_loop_with_interval(
        &self,
        shutdown: CancellationToken,
        interval_duration: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let span = info_span!("monitor_purge_loop");

        tokio::spawn(
            async move {
                info!(
                    interval_secs = interval_duration.as_secs(),
                    retention_hours = monitor.inner.config.retention_hours,
                    "violation purge loop started"
                );
                let mut interval = tokio::time::interval(interval_duration);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately.
                interval.tick().await;

                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => {
                            info!("violation purge loop stopped");
                            break;
                        }
                        _ = interval.tick() => {
                            monitor.purge_stale();
                        }
                    }
                }
            }
            .instrument(span),
        )
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use skillguard_core::ViolationKind;

    fn monitor(threshold: u32) -> SandboxMonitor {
        SandboxMonitor::new(MonitorConfig {
            circuit_breaker_threshold: threshold,
            ..MonitorConfig::default()
        })
        .unwrap()
    }

    fn critical(skill: &str) -> SandboxViolation {
        SandboxViolation::new(
            ViolationKind::CommandInjection,
            Severity::Critical,
            "x",
            Some(skill.to_owned()),
        )
    }

    #[test]
    fn unattributed_violations_are_grouped() {
        let m = monitor(3);
        m.record_violation(&SandboxViolation::new(
            ViolationKind::Unknown,
            Severity::Info,
            "x",
            None,
        ));
        assert_eq!(m.get_stats(UNATTRIBUTED_SKILL).unwrap().info_count, 1);
    }

    #[test]
    fn opening_is_broadcast_once() {
        let m = monitor(2);
        let mut events = m.subscribe();
        for _ in 0..4 {
            m.record_violation(&critical("a"));
        }
        match events.try_recv().unwrap() {
            MonitorEvent::CircuitOpened {
                skill_id,
                critical_count,
                ..
            } => {
                assert_eq!(skill_id, "a");
                assert_eq!(critical_count, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn reset_of_closed_circuit_is_silent() {
        let m = monitor(2);
        let mut events = m.subscribe();
        m.record_violation(&critical("a"));
        m.reset_circuit("a");
        m.reset_circuit("never-seen");
        assert!(events.try_recv().is_err());
    }
}

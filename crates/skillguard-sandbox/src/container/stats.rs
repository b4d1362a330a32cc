//! One-shot resource statistics for a running container.

use bollard::Docker;
use bollard::container::{Stats, StatsOptions};
use futures::StreamExt;
use skillguard_core::ResourceUsage;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// The subset of a daemon stats frame the result needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StatsSample {
    pub(crate) memory_max_usage: Option<u64>,
    pub(crate) memory_usage: Option<u64>,
    pub(crate) cpu_total: u64,
    pub(crate) precpu_total: u64,
    pub(crate) system_cpu: Option<u64>,
    pub(crate) presystem_cpu: Option<u64>,
    pub(crate) online_cpus: Option<u64>,
    pub(crate) rx_bytes: u64,
    pub(crate) tx_bytes: u64,
    pub(crate) pids: Option<u64>,
}

impl From<&Stats> for StatsSample {
    fn from(stats: &Stats) -> Self {
        let (rx_bytes, tx_bytes) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or_default();

        Self {
            memory_max_usage: stats.memory_stats.max_usage,
            memory_usage: stats.memory_stats.usage,
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage,
            presystem_cpu: stats.precpu_stats.system_cpu_usage,
            online_cpus: stats.cpu_stats.online_cpus,
            rx_bytes,
            tx_bytes,
            pids: stats.pids_stats.current,
        }
    }
}

impl StatsSample {
    /// CPU share over the sampling window, scaled by online CPUs. Zero when
    /// either delta is not positive.
    pub(crate) fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total);
        let system_delta = self
            .system_cpu
            .unwrap_or_default()
            .saturating_sub(self.presystem_cpu.unwrap_or_default());
        if cpu_delta == 0 || system_delta == 0 {
            return 0.0;
        }
        let cpus = self.online_cpus.filter(|&n| n > 0).unwrap_or_else(host_cpus);
        round2(cpu_delta as f64 / system_delta as f64 * cpus as f64 * 100.0)
    }

    pub(crate) fn peak_memory_mb(&self) -> f64 {
        let bytes = self.memory_max_usage.or(self.memory_usage).unwrap_or_default();
        round2(bytes as f64 / BYTES_PER_MB)
    }

    pub(crate) fn resource_usage(&self, wall_time_ms: u64) -> ResourceUsage {
        ResourceUsage {
            peak_memory_mb: self.peak_memory_mb(),
            avg_cpu_percent: self.cpu_percent(),
            wall_time_ms,
            network_rx_bytes: Some(self.rx_bytes),
            network_tx_bytes: Some(self.tx_bytes),
            pids: self.pids,
        }
    }
}

fn host_cpus() -> u64 {
    std::thread::available_parallelism().map_or(1, |n| n.get() as u64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Take one stats frame. `None` if the container is already gone.
pub(crate) async fn collect(docker: Docker, name: String) -> Option<StatsSample> {
    let stream = docker.stats(
        &name,
        Some(StatsOptions {
            stream: false,
            one_shot: false,
        }),
    );
    tokio::pin!(stream);

    match stream.next().await {
        Some(Ok(stats)) => Some(StatsSample::from(&stats)),
        Some(Err(error)) => {
            debug!(container = %name, error = %error, "stats unavailable");
            None
        }
        None => None,
    }
}

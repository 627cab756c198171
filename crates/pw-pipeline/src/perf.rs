//! Performance monitor
//!
//! Keeps a bounded window of per-request processing latencies, samples process
//! memory through `sysinfo` and turns load snapshots into advisory tuning
//! suggestions. Nothing here changes pipeline behavior on its own.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::config::PerfConfig;

/// Load figures gathered from the other components at sample time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub queue_depth: usize,
    pub busy_workers: usize,
    pub workers: usize,
    pub dedup_hit_ratio: f64,
    pub stored_events: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
    pub load: LoadSnapshot,
    /// Resident memory of this process, when it could be read
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suggestion {
    AddWorkers { queue_depth: usize, workers: usize },
    TuneDedup { hit_ratio_percent: u32 },
    ReduceSessionCap { memory_mb: u64, budget_mb: u64 },
    InvestigateSlowProviders { p95_ms: u64, budget_ms: u64 },
}

impl std::fmt::Display for Suggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddWorkers { queue_depth, workers } => write!(
                f,
                "{queue_depth} requests waiting with all {workers} workers busy; consider raising pool.max_workers"
            ),
            Self::TuneDedup { hit_ratio_percent } => write!(
                f,
                "dedup hit ratio is {hit_ratio_percent}%; consider a shorter dedup.ttl_ms or a larger dedup.capacity"
            ),
            Self::ReduceSessionCap { memory_mb, budget_mb } => write!(
                f,
                "resident memory {memory_mb} MB exceeds the {budget_mb} MB budget; consider lowering store.session_cap"
            ),
            Self::InvestigateSlowProviders { p95_ms, budget_ms } => write!(
                f,
                "p95 processing latency {p95_ms} ms exceeds the {budget_ms} ms budget; look for slow provider patterns"
            ),
        }
    }
}

pub struct PerfMonitor {
    config: PerfConfig,
    latencies: Mutex<VecDeque<Duration>>,
    system: Mutex<System>,
}

impl std::fmt::Debug for PerfMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PerfMonitor {
    pub fn new(config: PerfConfig) -> Self {
        let window = config.sample_window.max(1);
        Self {
            config,
            latencies: Mutex::new(VecDeque::with_capacity(window)),
            system: Mutex::new(System::new_with_specifics(RefreshKind::nothing())),
        }
    }

    fn latencies(&self) -> MutexGuard<'_, VecDeque<Duration>> {
        self.latencies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_latency(&self, latency: Duration) {
        let window = self.config.sample_window.max(1);
        let mut latencies = self.latencies();
        if latencies.len() == window {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    /// Resident memory of the current process in bytes.
    pub fn memory_bytes(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory())
    }

    pub fn sample(&self, load: LoadSnapshot) -> PerformanceSample {
        let mut sorted: Vec<Duration> = self.latencies().iter().copied().collect();
        sorted.sort_unstable();

        PerformanceSample {
            samples: sorted.len(),
            p50_ms: percentile_ms(&sorted, 0.50),
            p95_ms: percentile_ms(&sorted, 0.95),
            max_ms: sorted.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
            load,
            memory_bytes: self.memory_bytes(),
        }
    }

    pub fn suggestions(&self, sample: &PerformanceSample) -> Vec<Suggestion> {
        let mut out = Vec::new();
        let load = &sample.load;

        if load.queue_depth >= self.config.queue_depth_threshold && load.busy_workers >= load.workers {
            out.push(Suggestion::AddWorkers {
                queue_depth: load.queue_depth,
                workers: load.workers,
            });
        }

        // Only meaningful once there is traffic to deduplicate
        if sample.samples > 0 && load.dedup_hit_ratio < self.config.min_dedup_hit_ratio {
            out.push(Suggestion::TuneDedup {
                hit_ratio_percent: (load.dedup_hit_ratio * 100.0).round() as u32,
            });
        }

        if let Some(bytes) = sample.memory_bytes {
            let memory_mb = bytes / (1024 * 1024);
            if memory_mb > self.config.memory_budget_mb {
                out.push(Suggestion::ReduceSessionCap {
                    memory_mb,
                    budget_mb: self.config.memory_budget_mb,
                });
            }
        }

        let budget_ms = self.config.latency_budget().as_secs_f64() * 1000.0;
        if sample.p95_ms > budget_ms {
            out.push(Suggestion::InvestigateSlowProviders {
                p95_ms: sample.p95_ms.round() as u64,
                budget_ms: self.config.latency_budget_ms,
            });
        }

        out
    }

    /// Sample every `sample_interval` and log suggestions until aborted.
    pub fn spawn<F>(self: Arc<Self>, snapshot: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> LoadSnapshot + Send + Sync + 'static,
    {
        let period = self.config.sample_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let sample = self.sample(snapshot());
                log::debug!(
                    "perf: p50={:.2}ms p95={:.2}ms queue={} busy={}/{} memory={:?}",
                    sample.p50_ms,
                    sample.p95_ms,
                    sample.load.queue_depth,
                    sample.load.busy_workers,
                    sample.load.workers,
                    sample.memory_bytes
                );
                for suggestion in self.suggestions(&sample) {
                    log::info!("Tuning suggestion: {}", suggestion);
                }
            }
        })
    }
}

fn percentile_ms(sorted: &[Duration], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)].as_secs_f64() * 1000.0
}

//! Interception health monitor
//!
//! Hosts can silently drop interception listeners. The monitor watches the time
//! since the last intercepted request and, once a stall has been seen on two
//! consecutive checks, re-registers the listeners through the host.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::bus::{BusPayload, EventBus, Priority, ERROR, RECOVERED};
use crate::config::HealthConfig;
use crate::error::HostError;

/// Host-side interception hooks the monitor can reset.
pub trait InterceptionSource: Send + Sync {
    fn register(&self) -> Result<(), HostError>;

    fn deregister(&self) -> Result<(), HostError>;
}

/// Source for hosts without re-registrable listeners, such as offline replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSource;

impl InterceptionSource for NoopSource {
    fn register(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn deregister(&self) -> Result<(), HostError> {
        Ok(())
    }
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// First observation of a stall; recovery waits for the next check
    Stalled { idle_ms: u64 },
    Recovered { idle_ms: u64 },
    RecoveryFailed { idle_ms: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthStats {
    pub checks: u64,
    pub stalls: u64,
    pub recoveries: u64,
    pub failed_recoveries: u64,
    pub idle_ms: u64,
}

#[derive(Debug)]
struct HealthState {
    last_request: Instant,
    stall_seen: bool,
    stats: HealthStats,
}

pub struct HealthMonitor {
    config: HealthConfig,
    source: Arc<dyn InterceptionSource>,
    bus: EventBus,
    state: Mutex<HealthState>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, source: Arc<dyn InterceptionSource>, bus: EventBus) -> Self {
        Self {
            config,
            source,
            bus,
            state: Mutex::new(HealthState {
                last_request: Instant::now(),
                stall_seen: false,
                stats: HealthStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Heartbeat from the interception path.
    pub fn record_request(&self) {
        self.record_request_at(Instant::now());
    }

    pub fn record_request_at(&self, now: Instant) {
        let mut state = self.lock();
        state.last_request = now;
        state.stall_seen = false;
    }

    pub fn stats(&self) -> HealthStats {
        let state = self.lock();
        HealthStats {
            idle_ms: state.last_request.elapsed().as_millis() as u64,
            ..state.stats
        }
    }

    /// Run one check at `now`, recovering if the stall persisted since the last check.
    pub async fn check(&self, now: Instant) -> HealthStatus {
        let idle = {
            let mut state = self.lock();
            state.stats.checks += 1;
            let idle = now.saturating_duration_since(state.last_request);
            if idle <= self.config.stall_threshold() {
                state.stall_seen = false;
                return HealthStatus::Healthy;
            }
            if !state.stall_seen {
                state.stall_seen = true;
                state.stats.stalls += 1;
                log::debug!("No intercepted requests for {:?}; watching", idle);
                return HealthStatus::Stalled {
                    idle_ms: idle.as_millis() as u64,
                };
            }
            idle
        };

        let idle_ms = idle.as_millis() as u64;
        log::info!("Interception stalled for {:?}; re-registering listeners", idle);
        match self.recover().await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.last_request = Instant::now();
                    state.stall_seen = false;
                    state.stats.recoveries += 1;
                }
                log::info!("Interception listeners re-registered");
                self.bus.emit(
                    RECOVERED,
                    BusPayload::Recovered { stalled_for_ms: idle_ms },
                    Priority::High,
                    "health_monitor",
                );
                HealthStatus::Recovered { idle_ms }
            }
            Err(e) => {
                self.lock().stats.failed_recoveries += 1;
                log::warn!("Interception recovery failed: {}", e);
                self.bus.emit(
                    ERROR,
                    BusPayload::Error {
                        message: e.to_string(),
                        origin: Some(RECOVERED.to_string()),
                    },
                    Priority::High,
                    "health_monitor",
                );
                HealthStatus::RecoveryFailed { idle_ms }
            }
        }
    }

    async fn recover(&self) -> Result<(), HostError> {
        self.source.deregister()?;
        tokio::time::sleep(self.config.recovery_delay()).await;
        self.source.register()
    }

    /// Run checks every `check_interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.check_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                self.check(Instant::now()).await;
            }
        })
    }
}

//! PixelWatch Pipeline
//!
//! Async side of PixelWatch. Drives the synchronous engine in `pw-core` from a tokio
//! runtime: classification runs on a bounded pool of worker threads, results fan out
//! over a priority event bus, and two monitors watch interception health and
//! processing performance.
//!
//! # Modules
//!
//! - `config`: `PipelineConfig` loaded from JSON
//! - `pool`: Bounded worker pool with deadlines and fault replacement
//! - `bus`: Priority event bus
//! - `correlate`: Joins the three interception callbacks by request id
//! - `health`: Stall detection and listener recovery
//! - `perf`: Latency and memory sampling with tuning suggestions
//! - `pipeline`: The `Pipeline` facade wiring everything together
//! - `error`: Error taxonomy

pub mod bus;
pub mod config;
pub mod correlate;
pub mod error;
pub mod health;
pub mod perf;
pub mod pipeline;
pub mod pool;

pub use bus::{
    BusPayload, BusStats, Envelope, EventBus, HandlerResult, Priority, Subscription, ERROR,
    PROXY_STARTED, PROXY_STOPPED, RECOVERED, REQUEST_PROCESSED,
};
pub use config::PipelineConfig;
pub use correlate::{Correlator, Enrichment};
pub use error::{ConfigError, HostError, PipelineError, PoolError};
pub use health::{HealthMonitor, HealthStats, HealthStatus, InterceptionSource, NoopSource};
pub use perf::{LoadSnapshot, PerfMonitor, PerformanceSample, Suggestion};
pub use pipeline::{Pipeline, PipelineStats, StoreStats};
pub use pool::{PoolStats, WorkerPool};

//! Worker Pool
//!
//! Matching runs on named OS threads. Each worker owns a `Matcher` over an
//! immutable registry snapshot, receives owned `RequestRecord`s over its own job
//! channel and answers on a single shared reply channel. A router task on the
//! tokio runtime hands each reply to the waiting caller by correlation id.
//!
//! Callers that find every worker busy wait in a FIFO queue until a worker is
//! handed to them or their deadline passes.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;

use pw_core::{ClassifyOutcome, Matcher, ProviderRegistry, RequestRecord};

use crate::config::PoolConfig;
use crate::error::PoolError;

type JobResult = Result<Vec<ClassifyOutcome>, PoolError>;

/// Longest `shutdown` waits for worker threads to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

enum Job {
    Classify { correlation: u64, requests: Vec<RequestRecord> },
    Stop,
}

struct Reply {
    slot: usize,
    correlation: u64,
    /// Panic message when the worker faulted
    result: Result<Vec<ClassifyOutcome>, String>,
}

struct Slot {
    id: usize,
    jobs: std_mpsc::Sender<Job>,
    thread: Option<JoinHandle<()>>,
    busy: bool,
    errors: u32,
    processed: u64,
}

struct Pending {
    slot: usize,
    reply: oneshot::Sender<JobResult>,
}

struct Waiter {
    ticket: u64,
    lease: oneshot::Sender<Result<usize, PoolError>>,
}

#[derive(Default)]
struct PoolState {
    initialized: bool,
    slots: Vec<Slot>,
    next_slot_id: usize,
    pending: HashMap<u64, Pending>,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    next_correlation: u64,
    replies: Option<mpsc::UnboundedSender<Reply>>,
    router: Option<tokio::task::JoinHandle<()>>,
    peak_busy: usize,
    processed: u64,
    errors: u64,
    replacements: u64,
    queue_timeouts: u64,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_busy: usize,
    pub processed: u64,
    pub errors: u64,
    pub replacements: u64,
    pub queue_timeouts: u64,
    /// Current error count per worker, in slot order
    pub worker_errors: Vec<u32>,
}

struct PoolInner {
    config: PoolConfig,
    registry: Arc<ProviderRegistry>,
    min_confidence: f64,
    state: Mutex<PoolState>,
}

/// Bounded pool of matching threads. Cloning shares the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.inner.config.max_workers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig, registry: Arc<ProviderRegistry>, min_confidence: f64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                min_confidence,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Spawn the workers and the reply router. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(&self) -> Result<(), PoolError> {
        let mut state = self.inner.lock();
        if state.initialized {
            return Ok(());
        }

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        for _ in 0..self.inner.config.max_workers {
            let id = state.next_slot_id;
            state.next_slot_id += 1;
            match self.inner.spawn_slot(id, reply_tx.clone()) {
                Ok(slot) => state.slots.push(slot),
                Err(e) => log::warn!("Failed to start worker {}: {}", id, e),
            }
        }
        if state.slots.is_empty() {
            return Err(PoolError::WorkerFault {
                slot: 0,
                reason: "no worker thread could be started".to_string(),
            });
        }

        state.router = Some(tokio::spawn(route_replies(Arc::clone(&self.inner), reply_rx)));
        state.replies = Some(reply_tx);
        state.initialized = true;
        log::info!("Worker pool initialized with {} workers", state.slots.len());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Classify one request, waiting at most `queue_timeout` for a free worker.
    pub async fn process(&self, request: RequestRecord) -> Result<ClassifyOutcome, PoolError> {
        let deadline = Instant::now() + self.inner.config.queue_timeout();
        self.process_with_deadline(request, deadline).await
    }

    /// Classify one request; queueing for a worker fails once `deadline` passes.
    pub async fn process_with_deadline(
        &self,
        request: RequestRecord,
        deadline: Instant,
    ) -> Result<ClassifyOutcome, PoolError> {
        let slot = self.acquire(deadline).await?;
        let mut outcomes = self.dispatch(slot, vec![request]).await?;
        outcomes.pop().ok_or_else(|| PoolError::WorkerFault {
            slot,
            reason: "worker returned no outcome".to_string(),
        })
    }

    /// Classify many requests.
    ///
    /// Requests are split into chunks of `batch_size`. A chunk that finds an idle
    /// worker runs there as one job; otherwise its requests go through `process`
    /// one by one. Results come back in input order.
    pub async fn process_batch(&self, requests: Vec<RequestRecord>) -> Vec<Result<ClassifyOutcome, PoolError>> {
        let total = requests.len();
        let batch_size = self.inner.config.batch_size.max(1);
        let mut tasks = JoinSet::new();

        let mut requests = requests.into_iter();
        let mut offset = 0;
        loop {
            let chunk: Vec<RequestRecord> = requests.by_ref().take(batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            let start = offset;
            offset += chunk.len();
            let pool = self.clone();
            tasks.spawn(async move { (start, pool.process_chunk(chunk).await) });
        }

        let mut results: Vec<Option<Result<ClassifyOutcome, PoolError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((start, chunk_results)) => {
                    for (i, result) in chunk_results.into_iter().enumerate() {
                        if let Some(cell) = results.get_mut(start + i) {
                            *cell = Some(result);
                        }
                    }
                }
                Err(e) => log::warn!("Batch chunk task failed: {}", e),
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(PoolError::WorkerFault {
                        slot: 0,
                        reason: "batch chunk was lost".to_string(),
                    })
                })
            })
            .collect()
    }

    async fn process_chunk(&self, chunk: Vec<RequestRecord>) -> Vec<Result<ClassifyOutcome, PoolError>> {
        let len = chunk.len();
        match self.inner.try_acquire_idle() {
            Ok(Some(slot)) => match self.dispatch(slot, chunk).await {
                Ok(outcomes) if outcomes.len() == len => outcomes.into_iter().map(Ok).collect(),
                Ok(_) => vec![
                    Err(PoolError::WorkerFault {
                        slot,
                        reason: "worker returned a short batch".to_string(),
                    });
                    len
                ],
                Err(e) => vec![Err(e); len],
            },
            Ok(None) => {
                let mut results = Vec::with_capacity(len);
                for request in chunk {
                    results.push(self.process(request).await);
                }
                results
            }
            Err(e) => vec![Err(e); len],
        }
    }

    /// Reject every queued and in-flight request, stop all threads and reset.
    ///
    /// Threads still running a job after a short grace period are detached.
    pub async fn shutdown(&self) {
        let (threads, router) = {
            let mut state = self.inner.lock();
            if !state.initialized {
                return;
            }
            state.initialized = false;

            for waiter in state.waiters.drain(..) {
                let _ = waiter.lease.send(Err(PoolError::ShuttingDown));
            }
            for (_, pending) in state.pending.drain() {
                let _ = pending.reply.send(Err(PoolError::ShuttingDown));
            }

            let mut threads = Vec::with_capacity(state.slots.len());
            for mut slot in state.slots.drain(..) {
                let _ = slot.jobs.send(Job::Stop);
                if let Some(handle) = slot.thread.take() {
                    threads.push(handle);
                }
            }
            state.replies = None;
            (threads, state.router.take())
        };

        // Idle threads exit on Stop; one still stuck in a job is detached
        let deadline = Instant::now() + self.inner.config.dispatch_timeout().min(SHUTDOWN_GRACE);
        let mut threads = threads;
        loop {
            let (finished, running): (Vec<_>, Vec<_>) = threads.into_iter().partition(|h| h.is_finished());
            for handle in finished {
                if handle.join().is_err() {
                    log::warn!("Worker thread exited by panic during shutdown");
                }
            }
            threads = running;
            if threads.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        if !threads.is_empty() {
            log::warn!("Detaching {} worker threads still busy at shutdown", threads.len());
        }
        if let Some(router) = router {
            router.abort();
        }
        log::info!("Worker pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let busy = state.slots.iter().filter(|s| s.busy).count();
        PoolStats {
            workers: state.slots.len(),
            busy,
            idle: state.slots.len() - busy,
            queued: state.waiters.len(),
            in_flight: state.pending.len(),
            peak_busy: state.peak_busy,
            processed: state.processed,
            errors: state.errors,
            replacements: state.replacements,
            queue_timeouts: state.queue_timeouts,
            worker_errors: state.slots.iter().map(|s| s.errors).collect(),
        }
    }

    // -------------------------------------------------------------------------
    // Leasing and dispatch
    // -------------------------------------------------------------------------

    async fn acquire(&self, deadline: Instant) -> Result<usize, PoolError> {
        let (ticket, lease) = {
            let mut state = self.inner.lock();
            if !state.initialized {
                return Err(PoolError::NotInitialized);
            }
            if let Some(slot) = state.claim_idle() {
                return Ok(slot);
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { ticket, lease: tx });
            log::debug!("All workers busy; request queued ({} waiting)", state.waiters.len());
            (ticket, rx)
        };

        let mut lease = lease;
        match tokio::time::timeout_at(deadline, &mut lease).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                let mut state = self.inner.lock();
                match state.waiters.iter().position(|w| w.ticket == ticket) {
                    Some(idx) => {
                        state.waiters.remove(idx);
                    }
                    None => {
                        // A worker was handed over just as the deadline passed
                        if let Ok(Ok(slot)) = lease.try_recv() {
                            self.inner.release(&mut state, slot);
                        }
                    }
                }
                state.queue_timeouts += 1;
                log::warn!("Request timed out waiting for a worker");
                Err(PoolError::QueueTimeout(self.inner.config.queue_timeout()))
            }
        }
    }

    async fn dispatch(&self, slot: usize, requests: Vec<RequestRecord>) -> JobResult {
        let timeout = self.inner.config.dispatch_timeout();
        let (correlation, reply) = {
            let mut state = self.inner.lock();
            if !state.initialized {
                return Err(PoolError::ShuttingDown);
            }
            let correlation = state.next_correlation;
            state.next_correlation += 1;

            let (tx, rx) = oneshot::channel();
            let sent = match state.slots.iter().find(|s| s.id == slot) {
                Some(s) => s.jobs.send(Job::Classify { correlation, requests }).is_ok(),
                None => false,
            };
            if !sent {
                let reason = "worker thread is gone".to_string();
                self.inner.record_fault(&mut state, slot, true);
                self.inner.release(&mut state, slot);
                return Err(PoolError::WorkerFault { slot, reason });
            }
            state.pending.insert(correlation, Pending { slot, reply: tx });
            (correlation, rx)
        };

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                let mut state = self.inner.lock();
                if state.pending.remove(&correlation).is_some() {
                    log::warn!("Worker {} did not reply within {:?}", slot, timeout);
                    self.inner.record_fault(&mut state, slot, false);
                    self.inner.release(&mut state, slot);
                }
                Err(PoolError::DispatchTimeout { slot, timeout })
            }
        }
    }
}

impl PoolState {
    fn claim_idle(&mut self) -> Option<usize> {
        let slot = self.slots.iter_mut().find(|s| !s.busy)?;
        slot.busy = true;
        let id = slot.id;
        self.track_peak();
        Some(id)
    }

    fn track_peak(&mut self) {
        let busy = self.slots.iter().filter(|s| s.busy).count();
        self.peak_busy = self.peak_busy.max(busy);
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire_idle(&self) -> Result<Option<usize>, PoolError> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(PoolError::NotInitialized);
        }
        Ok(state.claim_idle())
    }

    fn spawn_slot(&self, id: usize, replies: mpsc::UnboundedSender<Reply>) -> std::io::Result<Slot> {
        let (jobs_tx, jobs_rx) = std_mpsc::channel();
        let matcher = Matcher::new(Arc::clone(&self.registry)).with_min_confidence(self.min_confidence);
        let thread = thread::Builder::new()
            .name(format!("pw-worker-{id}"))
            .spawn(move || worker_loop(id, matcher, jobs_rx, replies))?;
        Ok(Slot {
            id,
            jobs: jobs_tx,
            thread: Some(thread),
            busy: false,
            errors: 0,
            processed: 0,
        })
    }

    /// Hand a worker to the oldest live waiter, or mark it idle.
    fn release(&self, state: &mut PoolState, slot: usize) {
        if !state.slots.iter().any(|s| s.id == slot) {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.lease.send(Ok(slot)).is_ok() {
                return;
            }
        }
        if let Some(s) = state.slots.iter_mut().find(|s| s.id == slot) {
            s.busy = false;
        }
    }

    /// Count a fault against a worker and replace it once it crosses the threshold.
    fn record_fault(&self, state: &mut PoolState, slot: usize, dead: bool) {
        state.errors += 1;
        let Some(idx) = state.slots.iter().position(|s| s.id == slot) else {
            return;
        };
        state.slots[idx].errors += 1;
        let errors = state.slots[idx].errors;
        if !dead && errors <= self.config.max_worker_errors {
            return;
        }

        let Some(replies) = state.replies.clone() else {
            return;
        };
        log::warn!("Replacing worker {} after {} errors", slot, errors);
        let old = &mut state.slots[idx];
        let _ = old.jobs.send(Job::Stop);
        // A stuck thread is detached rather than joined
        drop(old.thread.take());

        match self.spawn_slot(slot, replies) {
            Ok(mut fresh) => {
                fresh.busy = state.slots[idx].busy;
                state.slots[idx] = fresh;
                state.replacements += 1;
            }
            Err(e) => {
                log::warn!("Failed to respawn worker {}: {}; pool shrinks by one", slot, e);
                state.slots.remove(idx);
            }
        }
    }

    fn complete(&self, reply: Reply) {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(&reply.correlation) else {
            log::debug!("Dropping late reply {} from worker {}", reply.correlation, reply.slot);
            return;
        };

        let result = match reply.result {
            Ok(outcomes) => {
                state.processed += outcomes.len() as u64;
                if let Some(s) = state.slots.iter_mut().find(|s| s.id == pending.slot) {
                    s.processed += outcomes.len() as u64;
                }
                Ok(outcomes)
            }
            Err(reason) => {
                log::warn!("Worker {} faulted: {}", pending.slot, reason);
                self.record_fault(&mut state, pending.slot, false);
                Err(PoolError::WorkerFault {
                    slot: pending.slot,
                    reason,
                })
            }
        };

        self.release(&mut state, pending.slot);
        drop(state);
        let _ = pending.reply.send(result);
    }
}

async fn route_replies(inner: Arc<PoolInner>, mut replies: mpsc::UnboundedReceiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        inner.complete(reply);
    }
    log::debug!("Reply router exiting");
}

fn worker_loop(
    slot: usize,
    matcher: Matcher,
    jobs: std_mpsc::Receiver<Job>,
    replies: mpsc::UnboundedSender<Reply>,
) {
    log::debug!("Worker {} started", slot);
    while let Ok(job) = jobs.recv() {
        let (correlation, requests) = match job {
            Job::Classify { correlation, requests } => (correlation, requests),
            Job::Stop => break,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            requests.iter().map(|r| matcher.classify(r)).collect::<Vec<_>>()
        }))
        .map_err(|payload| panic_message(payload.as_ref()));

        if replies.send(Reply { slot, correlation, result }).is_err() {
            break;
        }
    }
    log::debug!("Worker {} stopped", slot);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pw_core::provider::{ConfidenceAdjustment, ExtractedParameters, ScoreBreakdown};
    use pw_core::{normalize, Provider, ProviderError, RawRequest};

    /// Provider that sleeps while scoring and reports the `n` query value as event type.
    struct SlowProvider {
        delay: Duration,
    }

    impl Provider for SlowProvider {
        fn id(&self) -> &str {
            "slow"
        }

        fn name(&self) -> &str {
            "Slow"
        }

        fn category(&self) -> &str {
            "test"
        }

        fn score(&self, _request: &RequestRecord) -> Result<ScoreBreakdown, ProviderError> {
            thread::sleep(self.delay);
            Ok(ScoreBreakdown {
                pattern: 1.0,
                query: 1.0,
                method_allowed: true,
                ..ScoreBreakdown::default()
            })
        }

        fn extract_parameters(&self, _request: &RequestRecord) -> ExtractedParameters {
            ExtractedParameters::default()
        }

        fn extract_event_type(&self, request: &RequestRecord, _params: &ExtractedParameters) -> Option<String> {
            request.param("n").map(str::to_string)
        }
    }

    /// Provider whose custom confidence calculation panics.
    struct PanickyProvider;

    impl Provider for PanickyProvider {
        fn id(&self) -> &str {
            "panicky"
        }

        fn name(&self) -> &str {
            "Panicky"
        }

        fn category(&self) -> &str {
            "test"
        }

        fn score(&self, _request: &RequestRecord) -> Result<ScoreBreakdown, ProviderError> {
            Ok(ScoreBreakdown {
                pattern: 1.0,
                method_allowed: true,
                ..ScoreBreakdown::default()
            })
        }

        fn confidence_adjustment(&self, _request: &RequestRecord) -> Result<ConfidenceAdjustment, ProviderError> {
            panic!("custom confidence threw");
        }

        fn extract_parameters(&self, _request: &RequestRecord) -> ExtractedParameters {
            ExtractedParameters::default()
        }

        fn extract_event_type(&self, _request: &RequestRecord, _params: &ExtractedParameters) -> Option<String> {
            None
        }
    }

    fn config(max_workers: usize, queue_timeout_ms: u64, dispatch_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_workers,
            queue_timeout_ms,
            dispatch_timeout_ms,
            batch_size: 2,
            max_worker_errors: 5,
        }
    }

    fn slow_registry(delay_ms: u64) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(SlowProvider {
                delay: Duration::from_millis(delay_ms),
            })
            .expect("unique");
        registry
    }

    fn pool(max_workers: usize, queue_timeout_ms: u64, delay_ms: u64) -> WorkerPool {
        WorkerPool::new(config(max_workers, queue_timeout_ms, 5_000), Arc::new(slow_registry(delay_ms)), 0.3)
    }

    fn request(n: usize) -> RequestRecord {
        normalize(&RawRequest::get(n.to_string(), format!("https://example.com/p?n={n}"), 1)).expect("valid url")
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let pool = pool(1, 100, 0);
        assert_eq!(pool.process(request(1)).await.unwrap_err(), PoolError::NotInitialized);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let pool = pool(3, 100, 0);
        pool.initialize().expect("starts");
        pool.initialize().expect("still fine");
        assert_eq!(pool.stats().workers, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_returns_outcome() {
        let pool = pool(1, 1_000, 0);
        pool.initialize().expect("starts");
        let outcome = pool.process(request(1)).await.expect("classified");
        assert_eq!(outcome.promoted.map(|m| m.provider_id), Some("slow".to_string()));
        assert_eq!(pool.stats().processed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_max_workers() {
        let pool = pool(2, 5_000, 50);
        pool.initialize().expect("starts");

        let mut tasks = JoinSet::new();
        for n in 0..5 {
            let pool = pool.clone();
            tasks.spawn(async move { pool.process(request(n)).await });
        }
        let mut ok = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.expect("task ran").is_ok() {
                ok += 1;
            }
        }

        let stats = pool.stats();
        assert_eq!(ok, 5);
        assert!(stats.peak_busy <= 2, "peak busy {}", stats.peak_busy);
        assert_eq!(stats.processed, 5);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_timeout_when_saturated() {
        let pool = pool(1, 30, 300);
        pool.initialize().expect("starts");

        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.process(request(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = pool.process(request(2)).await;

        assert!(matches!(second, Err(PoolError::QueueTimeout(_))));
        assert!(first.await.expect("task ran").is_ok());
        assert_eq!(pool.stats().queue_timeouts, 1);
        assert_eq!(pool.stats().queued, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_provider_does_not_fault_worker() {
        let mut registry = slow_registry(0);
        registry.register(PanickyProvider).expect("unique");
        let pool = WorkerPool::new(config(1, 1_000, 5_000), Arc::new(registry), 0.3);
        pool.initialize().expect("starts");

        let outcome = pool.process(request(7)).await.expect("classified");
        let top = outcome.promoted.expect("slow still matches");
        assert_eq!(top.provider_id, "slow");
        assert_eq!(top.event_type.as_deref(), Some("7"));
        assert_eq!(outcome.faults.len(), 1);
        assert_eq!(outcome.faults[0].provider, "panicky");

        let stats = pool.stats();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.worker_errors, vec![0]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_timeout_counts_fault_and_frees_worker() {
        let pool = WorkerPool::new(config(1, 1_000, 50), Arc::new(slow_registry(300)), 0.3);
        pool.initialize().expect("starts");

        let result = pool.process(request(1)).await;
        assert!(
            matches!(result, Err(PoolError::DispatchTimeout { slot: 0, .. })),
            "{result:?}"
        );

        let stats = pool.stats();
        assert_eq!(stats.worker_errors, vec![1]);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.replacements, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_stuck_worker() {
        let pool = WorkerPool::new(config(1, 1_000, 100), Arc::new(slow_registry(3_000)), 0.3);
        pool.initialize().expect("starts");

        let result = pool.process(request(1)).await;
        assert!(matches!(result, Err(PoolError::DispatchTimeout { .. })), "{result:?}");

        let start = std::time::Instant::now();
        pool.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1), "shutdown took {:?}", start.elapsed());
        assert!(!pool.is_initialized());
    }

    #[tokio::test]
    async fn test_stuck_worker_is_replaced() {
        let pool = WorkerPool::new(config(1, 1_000, 20), Arc::new(slow_registry(100)), 0.3);
        pool.initialize().expect("starts");

        for n in 0..6 {
            let result = pool.process(request(n)).await;
            assert!(matches!(result, Err(PoolError::DispatchTimeout { .. })), "{result:?}");
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.replacements, 1);
        assert_eq!(stats.worker_errors, vec![0]);
        assert_eq!(stats.errors, 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_fault_reply_is_counted_and_replaced() {
        let pool = pool(1, 1_000, 0);
        pool.initialize().expect("starts");

        for correlation in 1_000..1_006 {
            let slot = pool
                .inner
                .try_acquire_idle()
                .expect("initialized")
                .expect("idle worker");
            let (tx, rx) = oneshot::channel();
            pool.inner.lock().pending.insert(correlation, Pending { slot, reply: tx });
            pool.inner.complete(Reply {
                slot,
                correlation,
                result: Err("worker panicked".to_string()),
            });

            let result = rx.await.expect("reply delivered");
            assert!(matches!(result, Err(PoolError::WorkerFault { slot: 0, .. })), "{result:?}");
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.replacements, 1);
        assert_eq!(stats.worker_errors, vec![0]);
        assert_eq!(stats.errors, 6);
        assert_eq!(stats.busy, 0);

        // The fresh worker serves requests
        assert!(pool.process(request(9)).await.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_keeps_input_order() {
        let pool = pool(2, 5_000, 0);
        pool.initialize().expect("starts");

        let requests: Vec<RequestRecord> = (0..5).map(request).collect();
        let results = pool.process_batch(requests).await;

        assert_eq!(results.len(), 5);
        for (i, result) in results.into_iter().enumerate() {
            let outcome = result.expect("classified");
            let event_type = outcome.promoted.and_then(|m| m.event_type);
            assert_eq!(event_type, Some(i.to_string()), "result {i} out of order");
        }
        assert_eq!(pool.stats().processed, 5);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_requests() {
        let pool = pool(1, 5_000, 200);
        pool.initialize().expect("starts");

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.process(request(1)).await })
        };
        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.process(request(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;

        assert_eq!(running.await.expect("task ran").unwrap_err(), PoolError::ShuttingDown);
        assert_eq!(queued.await.expect("task ran").unwrap_err(), PoolError::ShuttingDown);
        assert!(!pool.is_initialized());
        assert_eq!(pool.stats().workers, 0);
        assert_eq!(pool.process(request(3)).await.unwrap_err(), PoolError::NotInitialized);
    }
}

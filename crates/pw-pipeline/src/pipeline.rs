//! Pipeline facade
//!
//! Owns one instance of every component and wires the host callbacks through
//! them: normalize, dedup lookup, worker round trip, promotion, header
//! enrichment, store append and bus fan-out. Shared state lives behind
//! `std::sync::Mutex` and is never held across an `.await`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;

use pw_core::{
    normalize, promote, ClassifyOutcome, DedupCache, DedupStats, EventId, EventStore, HeaderMap,
    ProviderRegistry, RawRequest, SessionId, TrackingEvent,
};

use crate::bus::{BusPayload, BusStats, EventBus, Priority, ERROR, PROXY_STARTED, PROXY_STOPPED, REQUEST_PROCESSED};
use crate::config::PipelineConfig;
use crate::correlate::{Correlator, Enrichment};
use crate::error::{ConfigError, PipelineError};
use crate::health::{HealthMonitor, HealthStats, InterceptionSource};
use crate::perf::{LoadSnapshot, PerfMonitor, PerformanceSample};
use crate::pool::{PoolStats, WorkerPool};

const SOURCE: &str = "pipeline";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub events: usize,
    pub dropped: u64,
}

/// Everything a dashboard needs in one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub running: bool,
    pub uptime_ms: u64,
    pub pool: PoolStats,
    pub bus: BusStats,
    pub dedup: DedupStats,
    pub store: StoreStats,
    pub health: HealthStats,
    pub pending_correlations: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<ProviderRegistry>,
    pool: WorkerPool,
    bus: EventBus,
    dedup: Arc<Mutex<DedupCache<ClassifyOutcome>>>,
    store: Arc<Mutex<EventStore>>,
    correlator: Mutex<Correlator>,
    health: Arc<HealthMonitor>,
    perf: Arc<PerfMonitor>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_event: AtomicU64,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("providers", &self.registry.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<ProviderRegistry>,
        source: Arc<dyn InterceptionSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let bus = EventBus::new(config.bus.clone());
        let pool = WorkerPool::new(config.pool.clone(), Arc::clone(&registry), config.matching.min_confidence);
        let dedup = DedupCache::new(config.dedup.ttl(), config.dedup.capacity);
        let store = EventStore::new(config.store.session_cap);
        let health = HealthMonitor::new(config.health.clone(), source, bus.clone());
        let perf = PerfMonitor::new(config.perf.clone());

        Ok(Self {
            correlator: Mutex::new(Correlator::new(config.correlation.window())),
            config,
            registry,
            pool,
            bus,
            dedup: Arc::new(Mutex::new(dedup)),
            store: Arc::new(Mutex::new(store)),
            health: Arc::new(health),
            perf: Arc::new(perf),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_event: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Subscription point for `request_processed`, `error`, `proxy_started`,
    /// `proxy_stopped` and `recovered`.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start workers and monitors. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.pool.initialize() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        *lock(&self.started_at) = Some(Instant::now());

        let mut tasks = lock(&self.tasks);
        if self.config.health.enabled {
            tasks.push(Arc::clone(&self.health).spawn());
        }
        if self.config.perf.enabled {
            let pool = self.pool.clone();
            let dedup = Arc::clone(&self.dedup);
            let store = Arc::clone(&self.store);
            tasks.push(Arc::clone(&self.perf).spawn(move || load_snapshot(&pool, &dedup, &store)));
        }
        drop(tasks);

        log::info!("Pipeline started with {} providers", self.registry.len());
        self.bus.emit(PROXY_STARTED, BusPayload::ProxyStarted, Priority::High, SOURCE);
        Ok(())
    }

    /// Stop monitors and shut the pool down, rejecting outstanding work.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bus.emit(PROXY_STOPPED, BusPayload::ProxyStopped, Priority::High, SOURCE);

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.pool.shutdown().await;
        *lock(&self.started_at) = None;
        log::info!("Pipeline stopped");
    }

    // =========================================================================
    // Host callbacks
    // =========================================================================

    /// Classify an intercepted request. Returns the stored event when a provider matched.
    pub async fn on_before_request(&self, raw: &RawRequest) -> Result<Option<TrackingEvent>, PipelineError> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        let started = Instant::now();
        self.health.record_request();

        let record = match normalize(raw) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Dropping request {}: {}", raw.request_id, e);
                self.emit_error(e.to_string(), None);
                return Err(e.into());
            }
        };
        lock(&self.correlator).begin(&record.request_id, started);

        let cached = lock(&self.dedup).get(record.fingerprint);
        let outcome = match cached {
            Some(outcome) => {
                log::debug!("Dedup hit for {}", record.fingerprint);
                outcome
            }
            None => match self.pool.process(record.clone()).await {
                Ok(outcome) => {
                    let outcome = Arc::new(outcome);
                    lock(&self.dedup).insert(record.fingerprint, Arc::clone(&outcome));
                    outcome
                }
                Err(e) => {
                    log::warn!("Classification of {} failed: {}", record.request_id, e);
                    self.emit_error(e.to_string(), None);
                    return Err(e.into());
                }
            },
        };
        self.perf.record_latency(started.elapsed());

        let id = EventId(self.next_event.fetch_add(1, Ordering::Relaxed));
        let Some(mut event) = promote(&outcome, &record, id) else {
            return Ok(None);
        };

        let enrichment = lock(&self.correlator).attach_event(&record.request_id, record.session_id, id, Instant::now());
        apply_enrichment(&mut event, enrichment);

        lock(&self.store).append(record.session_id, event.clone());
        log::debug!(
            "{} matched {} ({:.2}) for session {}",
            record.url,
            event.provider_id,
            event.confidence,
            record.session_id
        );
        self.bus.emit(
            REQUEST_PROCESSED,
            BusPayload::RequestProcessed(event.clone()),
            Priority::Normal,
            SOURCE,
        );
        Ok(Some(event))
    }

    /// Request headers were sent. Returns true if a stored event was enriched.
    pub fn on_send_headers(&self, request_id: &str, headers: HeaderMap) -> bool {
        let headers = lowercase_headers(headers);
        let target = lock(&self.correlator).send_headers(request_id, headers.clone(), Instant::now());
        let Some((session, id)) = target else {
            return false;
        };
        lock(&self.store).update_event(session, id, |event| TrackingEvent {
            request_headers: Some(headers),
            ..event.clone()
        })
    }

    /// Response headers arrived. Returns true if a stored event was enriched.
    pub fn on_headers_received(&self, request_id: &str, headers: HeaderMap, status: u16) -> bool {
        let headers = lowercase_headers(headers);
        let target = lock(&self.correlator).headers_received(request_id, headers.clone(), status, Instant::now());
        let Some((session, id)) = target else {
            return false;
        };
        lock(&self.store).update_event(session, id, |event| TrackingEvent {
            response_headers: Some(headers),
            status_code: Some(status),
            ..event.clone()
        })
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// A session id may be reused by the host, so any leftover events are dropped.
    pub fn session_created(&self, session: SessionId) {
        log::debug!("Session {} created", session);
        lock(&self.store).clear(session);
    }

    pub fn session_navigated(&self, session: SessionId, url: &str) {
        let id = EventId(self.next_event.fetch_add(1, Ordering::Relaxed));
        lock(&self.store).mark_navigation(session, url, self.config.store.retain_on_navigation, id);
        lock(&self.dedup).purge_expired(Instant::now());
        log::debug!("Session {} navigated to {}", session, url);
    }

    pub fn session_removed(&self, session: SessionId) {
        lock(&self.store).remove(session);
        lock(&self.correlator).forget_session(session);
        log::debug!("Session {} removed", session);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Stored events for a session, newest first.
    pub fn events(&self, session: SessionId) -> Vec<TrackingEvent> {
        lock(&self.store).get_all(session)
    }

    pub fn stats(&self) -> PipelineStats {
        let uptime_ms = lock(&self.started_at).map_or(0, |t| t.elapsed().as_millis() as u64);
        let store = {
            let store = lock(&self.store);
            StoreStats {
                sessions: store.sessions().len(),
                events: store.total_events(),
                dropped: store.dropped(),
            }
        };
        PipelineStats {
            running: self.is_running(),
            uptime_ms,
            pool: self.pool.stats(),
            bus: self.bus.stats(),
            dedup: lock(&self.dedup).stats(),
            store,
            health: self.health.stats(),
            pending_correlations: lock(&self.correlator).len(),
        }
    }

    pub fn performance_sample(&self) -> PerformanceSample {
        self.perf.sample(load_snapshot(&self.pool, &self.dedup, &self.store))
    }

    fn emit_error(&self, message: String, origin: Option<String>) {
        self.bus
            .emit(ERROR, BusPayload::Error { message, origin }, Priority::High, SOURCE);
    }
}

fn load_snapshot(
    pool: &WorkerPool,
    dedup: &Mutex<DedupCache<ClassifyOutcome>>,
    store: &Mutex<EventStore>,
) -> LoadSnapshot {
    let pool = pool.stats();
    LoadSnapshot {
        queue_depth: pool.queued,
        busy_workers: pool.busy,
        workers: pool.workers,
        dedup_hit_ratio: lock(dedup).stats().hit_ratio(),
        stored_events: lock(store).total_events(),
    }
}

fn lowercase_headers(headers: HeaderMap) -> HeaderMap {
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

fn apply_enrichment(event: &mut TrackingEvent, enrichment: Enrichment) {
    if let Some(headers) = enrichment.request_headers {
        event.request_headers = Some(headers);
    }
    if let Some(headers) = enrichment.response_headers {
        event.response_headers = Some(headers);
    }
    if let Some(status) = enrichment.status_code {
        event.status_code = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use pw_core::provider::{ParameterSchema, Pattern, PatternConfig, ProviderDefinition, QueryParamPattern};
    use pw_core::{MethodMask, NormalizationError};

    use crate::health::NoopSource;

    fn registry() -> Arc<ProviderRegistry> {
        let pixel = ProviderDefinition {
            id: "pixel".to_string(),
            name: "Example Pixel".to_string(),
            category: "advertising".to_string(),
            patterns: PatternConfig {
                urls: vec![Pattern::regex(r"/tr(\?|$)").expect("regex")],
                methods: MethodMask::GET | MethodMask::POST,
                query_params: vec![QueryParamPattern::required("id"), QueryParamPattern::optional("ev")],
                ..PatternConfig::default()
            },
            schema: ParameterSchema {
                event_type_keys: vec!["ev".to_string()],
                account_id_keys: vec!["id".to_string()],
                ..ParameterSchema::default()
            },
            rules: Vec::new(),
        };
        Arc::new(ProviderRegistry::from_definitions([pixel]).expect("unique"))
    }

    fn pipeline(mutate: impl FnOnce(&mut PipelineConfig)) -> Pipeline {
        let mut config = PipelineConfig::default();
        config.pool.max_workers = 2;
        config.health.enabled = false;
        config.perf.enabled = false;
        mutate(&mut config);
        Pipeline::new(config, registry(), Arc::new(NoopSource)).expect("valid config")
    }

    fn counter(bus: &EventBus, event_type: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        bus.on(event_type, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    fn pixel(id: &str, session: SessionId) -> RawRequest {
        RawRequest::get(id, "https://example.com/tr?id=123&ev=PageView", session)
    }

    #[tokio::test]
    async fn test_requires_start() {
        let p = pipeline(|_| {});
        assert!(matches!(
            p.on_before_request(&pixel("1", 1)).await,
            Err(PipelineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_match_is_stored_and_published() {
        let p = pipeline(|_| {});
        let published = counter(p.bus(), REQUEST_PROCESSED);
        let started = counter(p.bus(), PROXY_STARTED);
        p.start().expect("starts");

        let event = p
            .on_before_request(&pixel("1", 7))
            .await
            .expect("processed")
            .expect("matched");
        assert_eq!(event.provider_id, "pixel");
        assert_eq!(event.event_type, "PageView");
        assert_eq!(event.account_id.as_deref(), Some("123"));
        assert!(event.confidence >= 0.3);

        assert_eq!(p.events(7), vec![event]);
        p.bus().flush().await;
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_duplicates_skip_the_pool() {
        let p = pipeline(|_| {});
        p.start().expect("starts");

        p.on_before_request(&pixel("1", 1)).await.expect("processed");
        p.on_before_request(&pixel("2", 1)).await.expect("processed");

        let stats = p.stats();
        assert_eq!(stats.pool.processed, 1);
        assert_eq!(stats.dedup.duplicates, 1);
        assert_eq!(p.events(1).len(), 2);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_unmatched_request_stores_nothing() {
        let p = pipeline(|_| {});
        p.start().expect("starts");
        let result = p
            .on_before_request(&RawRequest::get("1", "https://cdn.example.com/app.js", 1))
            .await
            .expect("processed");
        assert!(result.is_none());
        assert!(p.events(1).is_empty());
        p.stop().await;
    }

    #[tokio::test]
    async fn test_normalization_failure_is_reported() {
        let p = pipeline(|_| {});
        let errors = counter(p.bus(), ERROR);
        p.start().expect("starts");

        let result = p.on_before_request(&RawRequest::get("1", "ftp://example.com/tr?id=1", 1)).await;
        assert!(matches!(
            result,
            Err(PipelineError::Normalization(NormalizationError::UnsupportedScheme(_)))
        ));
        p.bus().flush().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_headers_enrich_before_and_after_classification() {
        let p = pipeline(|_| {});
        p.start().expect("starts");

        let mut early = HeaderMap::new();
        early.insert("Referer".to_string(), "https://shop.example/".to_string());
        assert!(!p.on_send_headers("1", early));

        let event = p
            .on_before_request(&pixel("1", 2))
            .await
            .expect("processed")
            .expect("matched");
        assert_eq!(
            event.request_headers.as_ref().and_then(|h| h.get("referer")).map(String::as_str),
            Some("https://shop.example/")
        );

        assert!(p.on_headers_received("1", HeaderMap::new(), 204));
        let stored = p.events(2);
        assert_eq!(stored[0].id, event.id);
        assert_eq!(stored[0].status_code, Some(204));
        p.stop().await;
    }

    #[tokio::test]
    async fn test_navigation_clears_or_marks() {
        let p = pipeline(|_| {});
        p.start().expect("starts");
        p.on_before_request(&pixel("1", 1)).await.expect("processed");
        p.session_navigated(1, "https://example.com/next");
        assert!(p.events(1).is_empty());
        p.stop().await;

        let p = pipeline(|c| c.store.retain_on_navigation = true);
        p.start().expect("starts");
        p.on_before_request(&pixel("1", 1)).await.expect("processed");
        p.session_navigated(1, "https://example.com/next");
        let events = p.events(1);
        assert_eq!(events.len(), 2);
        assert!(events[0].is_boundary);
        assert_eq!(events[0].confidence, 0.0);

        p.session_removed(1);
        assert!(p.events(1).is_empty());
        assert_eq!(p.stats().store.sessions, 0);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_stop_emits_and_rejects() {
        let p = pipeline(|_| {});
        let stopped = counter(p.bus(), PROXY_STOPPED);
        p.start().expect("starts");
        p.start().expect("second start is a no-op");
        p.stop().await;

        p.bus().flush().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!p.stats().running);
        assert!(matches!(
            p.on_before_request(&pixel("1", 1)).await,
            Err(PipelineError::NotRunning)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.pool.max_workers = 0;
        assert!(Pipeline::new(config, registry(), Arc::new(NoopSource)).is_err());
    }
}

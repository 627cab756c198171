//! Priority Event Bus
//!
//! Emitters enqueue envelopes into one FIFO per priority level. A single drain
//! task, spawned on demand, dispatches them in strict priority order in batches,
//! yielding to the runtime between batches. Handler failures are reported on the
//! bus itself as `error` envelopes.

use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::Notify;

use pw_core::{unix_millis, TrackingEvent};

use crate::config::BusConfig;

pub const REQUEST_PROCESSED: &str = "request_processed";
pub const ERROR: &str = "error";
pub const PROXY_STARTED: &str = "proxy_started";
pub const PROXY_STOPPED: &str = "proxy_stopped";
pub const RECOVERED: &str = "recovered";

/// Dispatch priority. Lower variants always drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusPayload {
    RequestProcessed(TrackingEvent),
    Error {
        message: String,
        /// Envelope type whose handler failed, if any
        origin: Option<String>,
    },
    ProxyStarted,
    ProxyStopped,
    Recovered { stalled_for_ms: u64 },
    Custom(serde_json::Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: u64,
    pub event_type: String,
    pub payload: BusPayload,
    pub priority: Priority,
    pub source: String,
    pub timestamp_ms: u64,
}

pub type HandlerResult = Result<(), Box<dyn StdError + Send + Sync>>;

type Handler = Arc<dyn Fn(&Envelope) -> HandlerResult + Send + Sync>;

struct Listener {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    queues: [VecDeque<Envelope>; 4],
    listeners: HashMap<String, Vec<Listener>>,
    draining: bool,
    next_envelope: u64,
    next_listener: u64,
    emitted: u64,
    dispatched: u64,
    handler_errors: u64,
    refused_subscriptions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub queued_critical: usize,
    pub queued_high: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    pub listeners: usize,
    pub emitted: u64,
    pub dispatched: u64,
    pub handler_errors: u64,
    pub refused_subscriptions: u64,
}

struct BusInner {
    config: BusConfig,
    state: Mutex<BusState>,
    idle: Notify,
}

/// Handle for removing a listener. Refused subscriptions get an inert handle.
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Option<Weak<BusInner>>,
    event_type: String,
    id: u64,
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

impl Subscription {
    fn inert(event_type: &str) -> Self {
        Self {
            bus: None,
            event_type: event_type.to_string(),
            id: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.bus.is_some()
    }

    /// Remove the listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.bus.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let mut state = inner.lock();
        if let Some(listeners) = state.listeners.get_mut(&self.event_type) {
            listeners.retain(|l| l.id != self.id);
            if listeners.is_empty() {
                state.listeners.remove(&self.event_type);
            }
        }
    }
}

/// Cloning shares the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(BusState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn on<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(event_type, false, Arc::new(handler))
    }

    /// Subscribe for a single delivery.
    pub fn once<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(event_type, true, Arc::new(handler))
    }

    fn subscribe(&self, event_type: &str, once: bool, handler: Handler) -> Subscription {
        let mut state = self.inner.lock();
        let count = state.listeners.get(event_type).map_or(0, Vec::len);
        if count >= self.inner.config.max_listeners {
            state.refused_subscriptions += 1;
            log::warn!(
                "Listener limit ({}) reached for '{}'; subscription ignored",
                self.inner.config.max_listeners,
                event_type
            );
            return Subscription::inert(event_type);
        }

        state.next_listener += 1;
        let id = state.next_listener;
        state
            .listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Listener { id, once, handler });

        Subscription {
            bus: Some(Arc::downgrade(&self.inner)),
            event_type: event_type.to_string(),
            id,
        }
    }

    /// Queue an envelope and make sure a drain is running. Returns the envelope id.
    pub fn emit(&self, event_type: &str, payload: BusPayload, priority: Priority, source: &str) -> u64 {
        let (id, start_drain) = {
            let mut state = self.inner.lock();
            let id = state.push(event_type, payload, priority, source);
            let start = !state.draining;
            state.draining = true;
            (id, start)
        };

        if start_drain {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(drain(Arc::clone(&self.inner)));
                }
                Err(_) => {
                    log::debug!("No async runtime; draining bus inline");
                    self.inner.drain_inline();
                }
            }
        }
        id
    }

    /// Wait until every queued envelope has been dispatched.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.lock();
                if !state.draining && state.queues.iter().all(VecDeque::is_empty) {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner.lock().listeners.get(event_type).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> BusStats {
        let state = self.inner.lock();
        BusStats {
            queued_critical: state.queues[Priority::Critical.index()].len(),
            queued_high: state.queues[Priority::High.index()].len(),
            queued_normal: state.queues[Priority::Normal.index()].len(),
            queued_low: state.queues[Priority::Low.index()].len(),
            listeners: state.listeners.values().map(Vec::len).sum(),
            emitted: state.emitted,
            dispatched: state.dispatched,
            handler_errors: state.handler_errors,
            refused_subscriptions: state.refused_subscriptions,
        }
    }
}

impl BusState {
    fn push(&mut self, event_type: &str, payload: BusPayload, priority: Priority, source: &str) -> u64 {
        self.next_envelope += 1;
        self.emitted += 1;
        let id = self.next_envelope;
        self.queues[priority.index()].push_back(Envelope {
            id,
            event_type: event_type.to_string(),
            payload,
            priority,
            source: source.to_string(),
            timestamp_ms: unix_millis(),
        });
        id
    }

    /// Take up to `limit` envelopes, highest priority first. Clears `draining` when empty.
    fn next_batch(&mut self, limit: usize) -> Vec<Envelope> {
        let mut batch = Vec::new();
        for queue in self.queues.iter_mut() {
            while batch.len() < limit {
                match queue.pop_front() {
                    Some(envelope) => batch.push(envelope),
                    None => break,
                }
            }
        }
        if batch.is_empty() {
            self.draining = false;
        }
        batch
    }
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_batch(&self) -> Vec<Envelope> {
        let batch = self.lock().next_batch(self.config.batch_size.max(1));
        if batch.is_empty() {
            self.idle.notify_waiters();
        }
        batch
    }

    fn drain_inline(&self) {
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                return;
            }
            for envelope in &batch {
                self.dispatch(envelope);
            }
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        let handlers: Vec<Handler> = {
            let mut state = self.lock();
            state.dispatched += 1;
            match state.listeners.get_mut(&envelope.event_type) {
                Some(listeners) => {
                    let handlers = listeners.iter().map(|l| Arc::clone(&l.handler)).collect();
                    listeners.retain(|l| !l.once);
                    handlers
                }
                None => Vec::new(),
            }
        };

        for handler in handlers {
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };

            let mut state = self.lock();
            state.handler_errors += 1;
            if envelope.event_type == ERROR {
                log::warn!("Error handler failed: {}", failure);
                continue;
            }
            log::warn!("Handler for '{}' failed: {}", envelope.event_type, failure);
            state.push(
                ERROR,
                BusPayload::Error {
                    message: failure,
                    origin: Some(envelope.event_type.clone()),
                },
                Priority::High,
                "event_bus",
            );
        }
    }
}

async fn drain(inner: Arc<BusInner>) {
    loop {
        let batch = inner.take_batch();
        if batch.is_empty() {
            return;
        }
        for envelope in &batch {
            inner.dispatch(envelope);
        }
        tokio::task::yield_now().await;
    }
}

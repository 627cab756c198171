//! Interception correlator
//!
//! The host reports a request through up to three callbacks (before request,
//! headers sent, headers received) that share a request id. Any subset may
//! arrive, in any order relative to classification finishing. Entries live for
//! the correlation window and are swept on every call.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pw_core::{EventId, HeaderMap, SessionId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub request_headers: Option<HeaderMap>,
    pub response_headers: Option<HeaderMap>,
    pub status_code: Option<u16>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.request_headers.is_none() && self.response_headers.is_none() && self.status_code.is_none()
    }
}

#[derive(Debug)]
struct Correlation {
    first_seen: Instant,
    /// Stored event, once classification produced one
    event: Option<(SessionId, EventId)>,
    enrichment: Enrichment,
}

impl Correlation {
    fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            event: None,
            enrichment: Enrichment::default(),
        }
    }
}

#[derive(Debug)]
pub struct Correlator {
    window: Duration,
    entries: HashMap<String, Correlation>,
    expired: u64,
}

impl Correlator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
            expired: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn expired(&self) -> u64 {
        self.expired
    }

    /// Start tracking a request seen by the before-request callback.
    pub fn begin(&mut self, request_id: &str, now: Instant) {
        self.sweep(now);
        self.entries
            .entry(request_id.to_string())
            .or_insert_with(|| Correlation::new(now));
    }

    /// Record the stored event for a request and return headers that arrived first.
    pub fn attach_event(&mut self, request_id: &str, session: SessionId, id: EventId, now: Instant) -> Enrichment {
        self.sweep(now);
        let entry = self
            .entries
            .entry(request_id.to_string())
            .or_insert_with(|| Correlation::new(now));
        entry.event = Some((session, id));
        entry.enrichment.clone()
    }

    /// Attach request headers. Returns the stored event to update, if there is one.
    pub fn send_headers(&mut self, request_id: &str, headers: HeaderMap, now: Instant) -> Option<(SessionId, EventId)> {
        self.sweep(now);
        let entry = self
            .entries
            .entry(request_id.to_string())
            .or_insert_with(|| Correlation::new(now));
        entry.enrichment.request_headers = Some(headers);
        entry.event
    }

    /// Attach response headers and status. Returns the stored event to update, if any.
    pub fn headers_received(
        &mut self,
        request_id: &str,
        headers: HeaderMap,
        status: u16,
        now: Instant,
    ) -> Option<(SessionId, EventId)> {
        self.sweep(now);
        let entry = self
            .entries
            .entry(request_id.to_string())
            .or_insert_with(|| Correlation::new(now));
        entry.enrichment.response_headers = Some(headers);
        entry.enrichment.status_code = Some(status);
        entry.event
    }

    /// Forget every request tied to a session.
    pub fn forget_session(&mut self, session: SessionId) {
        self.entries
            .retain(|_, entry| !matches!(entry.event, Some((s, _)) if s == session));
    }

    pub fn sweep(&mut self, now: Instant) {
        let window = self.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.first_seen) < window);
        let swept = before - self.entries.len();
        if swept > 0 {
            self.expired += swept as u64;
            log::debug!("Swept {} stale request correlations", swept);
        }
    }
}

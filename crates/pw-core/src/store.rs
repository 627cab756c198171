//! Per-session event store
//!
//! Newest-first bounded buffers of `TrackingEvent`s keyed by session. Order is the
//! order in which events reach the store, not the order in which requests were
//! issued.

use std::collections::{HashMap, VecDeque};

use crate::types::{unix_millis, EventId, SessionId, TrackingEvent};

/// Default maximum number of events retained per session.
pub const DEFAULT_SESSION_CAP: usize = 1_000;

/// Bounded, newest-first event buffers.
#[derive(Debug)]
pub struct EventStore {
    cap: usize,
    sessions: HashMap<SessionId, VecDeque<TrackingEvent>>,
    /// Events dropped off the tail because a buffer was full
    dropped: u64,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAP)
    }
}

impl EventStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            sessions: HashMap::new(),
            dropped: 0,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Prepend an event, truncating the oldest entries beyond the cap.
    pub fn append(&mut self, session: SessionId, event: TrackingEvent) {
        let buffer = self.sessions.entry(session).or_default();
        buffer.push_front(event);
        while buffer.len() > self.cap {
            buffer.pop_back();
            self.dropped += 1;
        }
    }

    /// Events for a session, newest first.
    pub fn get_all(&self, session: SessionId) -> Vec<TrackingEvent> {
        self.sessions
            .get(&session)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, session: SessionId, id: EventId) -> Option<&TrackingEvent> {
        self.sessions.get(&session)?.iter().find(|e| e.id == id)
    }

    pub fn len(&self, session: SessionId) -> usize {
        self.sessions.get(&session).map_or(0, VecDeque::len)
    }

    /// Empty a session's buffer but keep the session known.
    pub fn clear(&mut self, session: SessionId) {
        if let Some(buffer) = self.sessions.get_mut(&session) {
            buffer.clear();
        }
    }

    /// Forget a session entirely (session ended).
    pub fn remove(&mut self, session: SessionId) -> Option<Vec<TrackingEvent>> {
        self.sessions.remove(&session).map(Vec::from)
    }

    /// Apply a navigation boundary.
    ///
    /// With `retain` a synthetic boundary marker is prepended and history survives,
    /// otherwise the buffer is cleared outright.
    pub fn mark_navigation(&mut self, session: SessionId, url: &str, retain: bool, id: EventId) {
        if retain {
            let marker = TrackingEvent::boundary(id, session, url, unix_millis());
            self.append(session, marker);
        } else {
            self.clear(session);
        }
    }

    /// Replace an event with an updated copy. Returns false if it is gone.
    pub fn update_event<F>(&mut self, session: SessionId, id: EventId, update: F) -> bool
    where
        F: FnOnce(&TrackingEvent) -> TrackingEvent,
    {
        let Some(buffer) = self.sessions.get_mut(&session) else {
            return false;
        };
        match buffer.iter_mut().find(|e| e.id == id) {
            Some(slot) => {
                let updated = update(slot);
                *slot = updated;
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn total_events(&self) -> usize {
        self.sessions.values().map(VecDeque::len).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

//! Core type definitions for PixelWatch
//!
//! These types flow through the whole pipeline: the normalizer produces
//! `RequestRecord`s, the matcher produces `ProviderMatch`es and the store keeps
//! `TrackingEvent`s. All of them are plain owned values so they can cross the
//! worker boundary by move.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::hash::Hash64;

/// Host-defined browsing context (a tab id). Negative ids are background requests.
pub type SessionId = i32;

/// Header names are stored lower-cased.
pub type HeaderMap = BTreeMap<String, String>;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// HTTP Methods
// =============================================================================

bitflags::bitflags! {
    /// Allowed HTTP methods for a provider. The empty mask means "any method".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodMask: u16 {
        const GET = 1 << 0;
        const POST = 1 << 1;
        const PUT = 1 << 2;
        const PATCH = 1 << 3;
        const DELETE = 1 << 4;
        const HEAD = 1 << 5;
        const OPTIONS = 1 << 6;
        /// Any method not listed above
        const OTHER = 1 << 7;
    }
}

impl MethodMask {
    /// Parse from an HTTP method name (case-insensitive).
    pub fn from_method(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::GET,
            "POST" => Self::POST,
            "PUT" => Self::PUT,
            "PATCH" => Self::PATCH,
            "DELETE" => Self::DELETE,
            "HEAD" => Self::HEAD,
            "OPTIONS" => Self::OPTIONS,
            _ => Self::OTHER,
        }
    }

    /// Build a mask from a list of method names.
    pub fn from_methods<S: AsRef<str>>(methods: &[S]) -> Self {
        methods
            .iter()
            .fold(Self::empty(), |mask, m| mask | Self::from_method(m.as_ref()))
    }

    /// True if `method` is permitted. An empty mask permits everything.
    #[inline]
    pub fn allows(&self, method: &str) -> bool {
        self.is_empty() || self.intersects(Self::from_method(method))
    }
}

// =============================================================================
// Request Record
// =============================================================================

/// Host callback that produced (or last updated) a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterceptionPhase {
    #[default]
    BeforeRequest,
    HeadersSent,
    HeadersReceived,
}

/// Parsed URL components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: String,
    pub fragment: Option<String>,
}

/// Normalized request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestBody {
    /// Key/value fields from form data, url-encoded text or a flattened JSON object
    pub fields: BTreeMap<String, String>,
    /// Raw UTF-8 body text, when the host supplied raw bytes
    pub raw: Option<String>,
}

/// Canonical, immutable request record produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub url: String,
    /// Upper-cased HTTP method
    pub method: String,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Decoded query parameters; the first occurrence of a key wins
    pub query: BTreeMap<String, String>,
    pub parts: UrlParts,
    pub captured_at_ms: u64,
    pub session_id: SessionId,
    pub phase: InterceptionPhase,
    /// Dedup key over method, URL without query and canonical query
    pub fingerprint: Hash64,
}

impl RequestRecord {
    /// Look up a parameter in the query string, then in the body fields.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .or_else(|| self.body.as_ref().and_then(|b| b.fields.get(key)))
            .map(String::as_str)
    }

    /// True if the parameter exists in the query or body.
    #[inline]
    pub fn has_param(&self, key: &str) -> bool {
        self.param(key).is_some()
    }

    /// All parameters, query first. Body fields never shadow query values.
    pub fn merged_params(&self) -> BTreeMap<&str, &str> {
        let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
        if let Some(body) = &self.body {
            for (k, v) in &body.fields {
                merged.insert(k.as_str(), v.as_str());
            }
        }
        for (k, v) in &self.query {
            merged.insert(k.as_str(), v.as_str());
        }
        merged
    }

    /// Header lookup by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

// =============================================================================
// Match Results
// =============================================================================

/// One provider's claim on a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMatch {
    pub provider_id: String,
    pub provider_name: String,
    pub category: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub event_type: Option<String>,
    pub account_id: Option<String>,
    /// Only populated for the promoted match
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Which pattern rules fired, e.g. `url:/tr`, `query:id`, `rule:enhanced-matching`
    pub matched_rules: Vec<String>,
    /// Advisory validator failures recorded during extraction
    pub validation_issues: Vec<String>,
}

/// Full result of classifying one request.
#[derive(Debug, Clone, Default)]
pub struct ClassifyOutcome {
    /// Every provider at or above the minimum confidence, best first
    pub candidates: Vec<ProviderMatch>,
    /// Top candidate with parameters extracted
    pub promoted: Option<ProviderMatch>,
    /// Providers skipped for this request because they failed
    pub faults: Vec<ProviderError>,
}

impl ClassifyOutcome {
    #[inline]
    pub fn is_match(&self) -> bool {
        self.promoted.is_some()
    }
}

// =============================================================================
// Tracking Events
// =============================================================================

/// Unique event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt-{:08x}", self.0)
    }
}

/// Provider id used for navigation boundary markers.
pub const NAVIGATION_PROVIDER: &str = "navigation";

/// Canonical, provider-attributed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: EventId,
    pub created_at_ms: u64,
    pub provider_id: String,
    pub provider_name: String,
    pub category: String,
    pub url: String,
    pub method: String,
    pub event_type: String,
    pub account_id: Option<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub confidence: f64,
    pub session_id: SessionId,
    pub request_id: Option<String>,
    pub request_headers: Option<HeaderMap>,
    pub response_headers: Option<HeaderMap>,
    pub status_code: Option<u16>,
    #[serde(default)]
    pub is_boundary: bool,
}

impl TrackingEvent {
    /// Synthetic navigation separator.
    pub fn boundary(id: EventId, session_id: SessionId, url: &str, now_ms: u64) -> Self {
        Self {
            id,
            created_at_ms: now_ms,
            provider_id: NAVIGATION_PROVIDER.to_string(),
            provider_name: "Navigation".to_string(),
            category: NAVIGATION_PROVIDER.to_string(),
            url: url.to_string(),
            method: "GET".to_string(),
            event_type: "navigation".to_string(),
            account_id: None,
            parameters: BTreeMap::new(),
            confidence: 0.0,
            session_id,
            request_id: None,
            request_headers: None,
            response_headers: None,
            status_code: None,
            is_boundary: true,
        }
    }
}

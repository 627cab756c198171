//! PixelWatch Core Library
//!
//! This crate provides the synchronous classification engine for PixelWatch: it turns
//! raw request details reported by a host (browser extension, proxy, replay file) into
//! canonical records, scores them against every registered tracking provider, and keeps
//! the promoted results in bounded per-session buffers.
//!
//! # Architecture
//!
//! Nothing in this crate spawns threads or depends on an async runtime. The worker pool,
//! event bus and monitors live in `pw-pipeline` and drive these types from the outside.
//! Every stateful component is an explicit instance so that tests can build isolated
//! pipelines.
//!
//! # Modules
//!
//! - `hash`: Murmur3 hash functions used for request fingerprints
//! - `url`: Host and query helpers used by matching and fingerprinting
//! - `normalize`: Raw host request -> `RequestRecord`
//! - `provider`: Provider definitions and the `Provider` capability trait
//! - `registry`: Ordered, immutable provider registry
//! - `matcher`: Confidence scoring and match promotion
//! - `dedup`: Short-TTL fingerprint cache
//! - `store`: Per-session bounded event buffers
//! - `types`: Shared type definitions
//! - `error`: Error taxonomy

pub mod dedup;
pub mod error;
pub mod hash;
pub mod matcher;
pub mod normalize;
pub mod provider;
pub mod registry;
pub mod store;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use dedup::{DedupCache, DedupStats};
pub use error::{NormalizationError, ProviderError, RegistryError};
pub use hash::{Hash64, fingerprint, hash64};
pub use matcher::{promote, Matcher, DEFAULT_MIN_CONFIDENCE};
pub use normalize::{normalize, RawBody, RawRequest};
pub use provider::{DefinedProvider, Provider, ProviderDefinition};
pub use registry::ProviderRegistry;
pub use store::{EventStore, DEFAULT_SESSION_CAP};
pub use types::{
    unix_millis, ClassifyOutcome, EventId, HeaderMap, InterceptionPhase, MethodMask, ProviderMatch,
    RequestRecord, SessionId, TrackingEvent,
};

//! Core Matching Engine
//!
//! Every request goes through here, once per provider in registration order.
//! Scoring is cheap; parameter extraction is comparatively expensive, so it only
//! runs for the single promoted candidate.

use std::any::Any;
use std::cmp::Ordering;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::ProviderError;
use crate::provider::{ConfidenceAdjustment, Provider, ScoreBreakdown};
use crate::registry::ProviderRegistry;
use crate::types::{unix_millis, ClassifyOutcome, EventId, ProviderMatch, RequestRecord, TrackingEvent};

/// Candidates below this confidence are discarded.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;

/// Weight of the URL/domain/path pattern score in the base confidence.
pub const PATTERN_WEIGHT: f64 = 0.6;
/// Weight of the query parameter score in the base confidence.
pub const QUERY_WEIGHT: f64 = 0.4;

/// Event type used when a provider cannot name the event.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

// =============================================================================
// Matcher
// =============================================================================

/// The classification engine. One instance per worker.
#[derive(Debug, Clone)]
pub struct Matcher {
    registry: Arc<ProviderRegistry>,
    min_confidence: f64,
}

impl Matcher {
    /// Create a new matcher over a registry snapshot.
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Classify a request against every registered provider.
    pub fn classify(&self, request: &RequestRecord) -> ClassifyOutcome {
        let mut outcome = ClassifyOutcome::default();
        let mut ranked: Vec<(usize, Arc<dyn Provider>, ProviderMatch)> = Vec::new();

        for (order, provider) in self.registry.all().enumerate() {
            match self.score_provider(&**provider, request) {
                Ok(Some(candidate)) => ranked.push((order, Arc::clone(provider), candidate)),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Skipping provider for request {}: {}", request.request_id, e);
                    outcome.faults.push(e);
                }
            }
        }

        // Highest confidence first; registration order breaks ties
        ranked.sort_by(|(order_a, _, a), (order_b, _, b)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then(order_a.cmp(order_b))
        });

        // A provider that fails extraction loses its candidacy to the next one
        while let Some((_, provider, top)) = ranked.first() {
            match extract_promoted(&**provider, request, top.clone()) {
                Ok(promoted) => {
                    outcome.promoted = Some(promoted);
                    break;
                }
                Err(e) => {
                    log::warn!("Dropping candidate for request {}: {}", request.request_id, e);
                    outcome.faults.push(e);
                    ranked.remove(0);
                }
            }
        }

        outcome.candidates = ranked.into_iter().map(|(_, _, candidate)| candidate).collect();

        if let Some(promoted) = &outcome.promoted {
            log::debug!(
                "Request {} classified as '{}' ({:.2}, {} candidates)",
                request.request_id,
                promoted.provider_id,
                promoted.confidence,
                outcome.candidates.len()
            );
        }

        outcome
    }

    /// Score a single provider. `Ok(None)` means below the threshold.
    fn score_provider(
        &self,
        provider: &dyn Provider,
        request: &RequestRecord,
    ) -> Result<Option<ProviderMatch>, ProviderError> {
        let breakdown = guarded(provider, "score", || provider.score(request))?;
        if !passes_gates(&breakdown) {
            return Ok(None);
        }

        let adjustment = guarded(provider, "confidence_adjustment", || {
            provider.confidence_adjustment(request)
        })?;
        let confidence = combine(&breakdown, &adjustment);
        if !confidence.is_finite() {
            return Err(ProviderError::new(provider.id(), "confidence is not a finite number"));
        }
        if confidence < self.min_confidence {
            return Ok(None);
        }

        let (provider_name, category) = guarded(provider, "name", || {
            Ok((provider.name().to_string(), provider.category().to_string()))
        })?;
        let mut matched_rules = breakdown.matched_rules;
        matched_rules.extend(adjustment.matched_rules);

        Ok(Some(ProviderMatch {
            provider_id: provider.id().to_string(),
            provider_name,
            category,
            confidence,
            event_type: None,
            account_id: None,
            parameters: Default::default(),
            matched_rules,
            validation_issues: Vec::new(),
        }))
    }
}

/// Method mismatch, a failed required parameter or no pattern hit force confidence to 0.
#[inline]
fn passes_gates(breakdown: &ScoreBreakdown) -> bool {
    breakdown.method_allowed && !breakdown.required_failed && breakdown.pattern > 0.0
}

/// Base score plus provider delta, clamped to [0, 1].
fn combine(breakdown: &ScoreBreakdown, adjustment: &ConfidenceAdjustment) -> f64 {
    let base = PATTERN_WEIGHT * breakdown.pattern + QUERY_WEIGHT * breakdown.query;
    let total = base + adjustment.delta;
    if total.is_nan() {
        return total;
    }
    total.clamp(0.0, 1.0)
}

fn extract_promoted(
    provider: &dyn Provider,
    request: &RequestRecord,
    mut top: ProviderMatch,
) -> Result<ProviderMatch, ProviderError> {
    let (params, event_type, account_id) = guarded(provider, "extract", || {
        let params = provider.extract_parameters(request);
        let event_type = provider.extract_event_type(request, &params);
        let account_id = provider.extract_account_id(request, &params);
        Ok((params, event_type, account_id))
    })?;
    top.event_type = event_type;
    top.account_id = account_id;
    top.validation_issues = params.issues;
    top.parameters = params.values;
    Ok(top)
}

/// Run one provider hook, turning a panic into a fault of that provider.
fn guarded<T>(
    provider: &dyn Provider,
    hook: &str,
    call: impl FnOnce() -> Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(ProviderError::new(
            provider.id(),
            format!("{} panicked: {}", hook, panic_message(payload.as_ref())),
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Promotion
// =============================================================================

/// Build the canonical event for a classified request, if anything was promoted.
pub fn promote(outcome: &ClassifyOutcome, request: &RequestRecord, id: EventId) -> Option<TrackingEvent> {
    let top = outcome.promoted.as_ref()?;
    Some(TrackingEvent {
        id,
        created_at_ms: unix_millis(),
        provider_id: top.provider_id.clone(),
        provider_name: top.provider_name.clone(),
        category: top.category.clone(),
        url: request.url.clone(),
        method: request.method.clone(),
        event_type: top
            .event_type
            .clone()
            .unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string()),
        account_id: top.account_id.clone(),
        parameters: top.parameters.clone(),
        confidence: top.confidence,
        session_id: request.session_id,
        request_id: Some(request.request_id.clone()),
        request_headers: if request.headers.is_empty() {
            None
        } else {
            Some(request.headers.clone())
        },
        response_headers: None,
        status_code: None,
        is_boundary: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, RawRequest};
    use crate::provider::{
        score_patterns, ConfidenceRule, DefinedProvider, ExtractedParameters, Pattern, PatternConfig,
        ParameterSchema, ProviderDefinition, QueryParamPattern, RuleCondition,
    };
    use crate::types::MethodMask;

    fn record(method: &str, url: &str) -> RequestRecord {
        let mut raw = RawRequest::get("req-1", url, 3);
        raw.method = method.to_string();
        normalize(&raw).expect("valid url")
    }

    fn url_only(id: &str, pattern: &str) -> ProviderDefinition {
        ProviderDefinition {
            id: id.to_string(),
            name: id.to_string(),
            category: "analytics".to_string(),
            patterns: PatternConfig {
                urls: vec![Pattern::literal(pattern)],
                ..PatternConfig::default()
            },
            schema: ParameterSchema::default(),
            rules: Vec::new(),
        }
    }

    fn tr_pixel() -> ProviderDefinition {
        ProviderDefinition {
            id: "tr-pixel".to_string(),
            name: "TR Pixel".to_string(),
            category: "advertising".to_string(),
            patterns: PatternConfig {
                urls: vec![Pattern::regex(r"/tr(\?|$)").expect("regex")],
                query_params: vec![QueryParamPattern::required("id")],
                ..PatternConfig::default()
            },
            schema: ParameterSchema {
                event_type_keys: vec!["ev".to_string()],
                account_id_keys: vec!["id".to_string()],
                ..ParameterSchema::default()
            },
            rules: Vec::new(),
        }
    }

    fn matcher(defs: Vec<ProviderDefinition>) -> Matcher {
        Matcher::new(Arc::new(ProviderRegistry::from_definitions(defs).expect("unique ids")))
    }

    /// Matches everything, but its heuristic always fails.
    struct FaultyProvider;

    impl Provider for FaultyProvider {
        fn id(&self) -> &str {
            "faulty"
        }
        fn name(&self) -> &str {
            "Faulty"
        }
        fn category(&self) -> &str {
            "analytics"
        }
        fn score(&self, request: &RequestRecord) -> Result<ScoreBreakdown, ProviderError> {
            let patterns = PatternConfig {
                domains: vec![Pattern::literal("example.com")],
                ..PatternConfig::default()
            };
            Ok(score_patterns(&patterns, request))
        }
        fn confidence_adjustment(&self, _request: &RequestRecord) -> Result<ConfidenceAdjustment, ProviderError> {
            Err(ProviderError::new("faulty", "heuristic blew up"))
        }
        fn extract_parameters(&self, _request: &RequestRecord) -> ExtractedParameters {
            ExtractedParameters::default()
        }
        fn extract_event_type(&self, _request: &RequestRecord, _params: &ExtractedParameters) -> Option<String> {
            None
        }
    }

    /// Matches everything and panics in one hook.
    struct PanickyProvider {
        in_extraction: bool,
    }

    impl Provider for PanickyProvider {
        fn id(&self) -> &str {
            "panicky"
        }
        fn name(&self) -> &str {
            "Panicky"
        }
        fn category(&self) -> &str {
            "analytics"
        }
        fn score(&self, _request: &RequestRecord) -> Result<ScoreBreakdown, ProviderError> {
            Ok(ScoreBreakdown {
                pattern: 1.0,
                query: 1.0,
                method_allowed: true,
                ..ScoreBreakdown::default()
            })
        }
        fn confidence_adjustment(&self, _request: &RequestRecord) -> Result<ConfidenceAdjustment, ProviderError> {
            if !self.in_extraction {
                panic!("custom confidence threw");
            }
            Ok(ConfidenceAdjustment::default())
        }
        fn extract_parameters(&self, _request: &RequestRecord) -> ExtractedParameters {
            if self.in_extraction {
                panic!("extraction threw");
            }
            ExtractedParameters::default()
        }
        fn extract_event_type(&self, _request: &RequestRecord, _params: &ExtractedParameters) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_end_to_end_pixel_example() {
        let m = matcher(vec![tr_pixel()]);
        let req = record("GET", "https://example.com/tr?id=123&ev=PageView");
        let outcome = m.classify(&req);

        let top = outcome.promoted.as_ref().expect("promoted");
        assert!(top.confidence >= 0.3);
        assert!((top.confidence - 1.0).abs() < 1e-9);
        assert_eq!(top.event_type.as_deref(), Some("PageView"));
        assert_eq!(top.account_id.as_deref(), Some("123"));
        assert_eq!(top.parameters.get("ev"), Some(&serde_json::json!("PageView")));

        let event = promote(&outcome, &req, EventId(9)).expect("event");
        assert_eq!(event.provider_id, "tr-pixel");
        assert_eq!(event.event_type, "PageView");
        assert_eq!(event.account_id.as_deref(), Some("123"));
        assert_eq!(event.session_id, 3);
        assert!(!event.is_boundary);
    }

    #[test]
    fn test_equal_confidence_prefers_registration_order() {
        let m = matcher(vec![url_only("a", "example.com/collect"), url_only("b", "/collect")]);
        let outcome = m.classify(&record("GET", "https://example.com/collect"));

        assert_eq!(outcome.candidates.len(), 2);
        assert!((outcome.candidates[0].confidence - 0.6).abs() < 1e-9);
        assert_eq!(outcome.candidates[0].confidence, outcome.candidates[1].confidence);
        assert_eq!(outcome.promoted.as_ref().map(|p| p.provider_id.as_str()), Some("a"));

        let reversed = matcher(vec![url_only("b", "/collect"), url_only("a", "example.com/collect")]);
        let outcome = reversed.classify(&record("GET", "https://example.com/collect"));
        assert_eq!(outcome.promoted.as_ref().map(|p| p.provider_id.as_str()), Some("b"));
    }

    #[test]
    fn test_higher_confidence_wins_over_order() {
        let m = matcher(vec![url_only("generic", "/tr"), tr_pixel()]);
        let outcome = m.classify(&record("GET", "https://example.com/tr?id=1"));
        assert_eq!(outcome.promoted.as_ref().map(|p| p.provider_id.as_str()), Some("tr-pixel"));
        assert_eq!(outcome.candidates.len(), 2);
    }

    #[test]
    fn test_no_match_yields_no_candidates() {
        let m = matcher(vec![tr_pixel()]);
        let req = record("GET", "https://example.com/index.html");
        let outcome = m.classify(&req);
        assert!(outcome.candidates.is_empty());
        assert!(!outcome.is_match());
        assert!(promote(&outcome, &req, EventId(1)).is_none());
    }

    #[test]
    fn test_required_param_missing_zeroes_provider() {
        let m = matcher(vec![tr_pixel()]);
        let outcome = m.classify(&record("GET", "https://example.com/tr?ev=PageView"));
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn test_method_mismatch_forces_zero() {
        let mut def = tr_pixel();
        def.patterns.methods = MethodMask::POST;
        let m = matcher(vec![def]);
        assert!(!m.classify(&record("GET", "https://example.com/tr?id=1")).is_match());
        assert!(m.classify(&record("POST", "https://example.com/tr?id=1")).is_match());
    }

    #[test]
    fn test_threshold_is_configurable() {
        let m = matcher(vec![url_only("a", "/collect")]).with_min_confidence(0.7);
        assert!(!m.classify(&record("GET", "https://example.com/collect")).is_match());
    }

    #[test]
    fn test_custom_delta_is_clamped() {
        let mut def = tr_pixel();
        def.rules.push(ConfidenceRule {
            label: "server-side".to_string(),
            condition: RuleCondition::PathContains("/tr".to_string()),
            delta: 0.5,
        });
        let m = matcher(vec![def]);
        let outcome = m.classify(&record("GET", "https://example.com/tr?id=1"));
        let top = outcome.promoted.expect("promoted");
        assert_eq!(top.confidence, 1.0);
        assert!(top.matched_rules.contains(&"rule:server-side".to_string()));
    }

    #[test]
    fn test_negative_delta_can_drop_below_threshold() {
        let mut def = url_only("a", "/collect");
        def.rules.push(ConfidenceRule {
            label: "first-party".to_string(),
            condition: RuleCondition::HostSuffix("example.com".to_string()),
            delta: -0.4,
        });
        let m = matcher(vec![def]);
        assert!(!m.classify(&record("GET", "https://example.com/collect")).is_match());
    }

    #[test]
    fn test_faulty_provider_does_not_block_others() {
        let mut registry = ProviderRegistry::new();
        registry.register(FaultyProvider).expect("register faulty");
        registry.register(DefinedProvider::new(tr_pixel())).expect("register pixel");
        let m = Matcher::new(Arc::new(registry));

        let outcome = m.classify(&record("GET", "https://example.com/tr?id=5&ev=Lead"));
        assert_eq!(outcome.faults.len(), 1);
        assert_eq!(outcome.faults[0].provider, "faulty");
        let top = outcome.promoted.expect("pixel still matches");
        assert_eq!(top.provider_id, "tr-pixel");
        assert_eq!(top.event_type.as_deref(), Some("Lead"));
    }

    #[test]
    fn test_panicking_confidence_does_not_block_others() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(PanickyProvider { in_extraction: false })
            .expect("register panicky");
        registry
            .register(DefinedProvider::new(url_only("good", "/p")))
            .expect("register good");
        let m = Matcher::new(Arc::new(registry));

        let outcome = m.classify(&record("GET", "https://example.com/p"));
        assert_eq!(outcome.faults.len(), 1);
        assert_eq!(outcome.faults[0].provider, "panicky");
        assert!(outcome.faults[0].message.contains("custom confidence threw"));
        assert_eq!(outcome.candidates.len(), 1);
        let top = outcome.promoted.expect("good still matches");
        assert_eq!(top.provider_id, "good");
        assert!((top.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_panicking_extraction_falls_back_to_next_candidate() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(PanickyProvider { in_extraction: true })
            .expect("register panicky");
        registry.register(DefinedProvider::new(tr_pixel())).expect("register pixel");
        let m = Matcher::new(Arc::new(registry));

        let outcome = m.classify(&record("GET", "https://example.com/tr?id=5&ev=Lead"));
        assert_eq!(outcome.faults.len(), 1);
        assert_eq!(outcome.faults[0].provider, "panicky");
        assert_eq!(outcome.candidates.len(), 1);
        let top = outcome.promoted.expect("pixel promoted");
        assert_eq!(top.provider_id, "tr-pixel");
        assert_eq!(top.event_type.as_deref(), Some("Lead"));
    }

    #[test]
    fn test_only_promoted_candidate_is_extracted() {
        let m = matcher(vec![tr_pixel(), url_only("generic", "/tr")]);
        let outcome = m.classify(&record("GET", "https://example.com/tr?id=1&ev=X"));
        assert_eq!(outcome.candidates.len(), 2);
        assert!(outcome.candidates[1].parameters.is_empty());
        assert!(outcome.candidates[1].event_type.is_none());
        assert!(!outcome.promoted.expect("promoted").parameters.is_empty());
    }
}

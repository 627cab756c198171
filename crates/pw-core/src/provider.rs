//! Provider definitions and the `Provider` capability trait
//!
//! A provider identifies one tracking vendor. Most providers are pure data
//! (`ProviderDefinition`) and are wrapped in `DefinedProvider`; vendors that need
//! hand-written heuristics implement `Provider` directly.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::error::ProviderError;
use crate::types::{MethodMask, RequestRecord};
use crate::url::{contains_ignore_ascii_case, host_matches_domain};

// =============================================================================
// Patterns
// =============================================================================

/// A string or regex pattern.
///
/// Literal patterns match by case-insensitive substring containment, regex
/// patterns match if they find a match anywhere in the haystack.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn regex(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Self::Regex)
    }

    #[inline]
    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Self::Literal(text) => contains_ignore_ascii_case(haystack, text),
            Self::Regex(re) => re.is_match(haystack),
        }
    }

    /// Source text, used for rule labels.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(text) => text,
            Self::Regex(re) => re.as_str(),
        }
    }
}

/// Pattern over a single query (or body) parameter.
#[derive(Debug, Clone)]
pub struct QueryParamPattern {
    pub key: String,
    /// Value pattern; `None` means presence is enough
    pub value: Option<Regex>,
    /// A missing or mismatched required key zeroes the provider
    pub required: bool,
    pub weight: f64,
}

impl QueryParamPattern {
    pub fn required(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            required: true,
            weight: 1.0,
        }
    }

    pub fn optional(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            required: false,
            weight: 1.0,
        }
    }

    pub fn with_value(mut self, value: Regex) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Everything a provider matches on.
#[derive(Debug, Clone, Default)]
pub struct PatternConfig {
    /// Matched against the full URL
    pub urls: Vec<Pattern>,
    /// Matched against the host
    pub domains: Vec<Pattern>,
    /// Matched against the path
    pub paths: Vec<Pattern>,
    /// Empty mask = any method
    pub methods: MethodMask,
    pub query_params: Vec<QueryParamPattern>,
}

// =============================================================================
// Parameter Schema
// =============================================================================

/// Transforms a raw string parameter into a structured value.
#[derive(Debug, Clone)]
pub enum ValueParser {
    Trim,
    Lowercase,
    Uppercase,
    Integer,
    Float,
    Boolean,
    Json,
    /// Split on a separator into a list of strings
    List(char),
}

impl ValueParser {
    pub fn apply(&self, raw: &str) -> Result<Value, String> {
        match self {
            Self::Trim => Ok(Value::String(raw.trim().to_string())),
            Self::Lowercase => Ok(Value::String(raw.to_lowercase())),
            Self::Uppercase => Ok(Value::String(raw.to_uppercase())),
            Self::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("not an integer: {e}")),
            Self::Float => raw
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("not a number: {e}"))
                .and_then(|f| {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| "not a finite number".to_string())
                }),
            Self::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
                "0" | "false" | "no" | "off" | "" => Ok(Value::Bool(false)),
                other => Err(format!("not a boolean: {other}")),
            },
            Self::Json => serde_json::from_str(raw).map_err(|e| format!("invalid json: {e}")),
            Self::List(sep) => Ok(Value::Array(
                raw.split(*sep)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )),
        }
    }
}

/// Advisory check on a raw parameter value. Failures are recorded, never fatal.
#[derive(Debug, Clone)]
pub enum Validator {
    NonEmpty,
    Numeric,
    Matches(Regex),
    OneOf(Vec<String>),
    MaxLength(usize),
}

impl Validator {
    pub fn check(&self, raw: &str) -> Result<(), String> {
        match self {
            Self::NonEmpty if raw.trim().is_empty() => Err("is empty".to_string()),
            Self::Numeric if raw.trim().parse::<f64>().is_err() => Err("is not numeric".to_string()),
            Self::Matches(re) if !re.is_match(raw) => Err(format!("does not match /{}/", re.as_str())),
            Self::OneOf(allowed) if !allowed.iter().any(|a| a == raw) => {
                Err(format!("is not one of [{}]", allowed.join(", ")))
            }
            Self::MaxLength(max) if raw.chars().count() > *max => {
                Err(format!("is longer than {max} characters"))
            }
            _ => Ok(()),
        }
    }
}

/// How parameters, event types and account ids are pulled out of a request.
#[derive(Debug, Clone)]
pub struct ParameterSchema {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    /// canonical key -> aliases, tried in order
    pub aliases: Vec<(String, Vec<String>)>,
    pub parsers: BTreeMap<String, ValueParser>,
    pub validators: BTreeMap<String, Vec<Validator>>,
    /// Keys holding the event type, first present wins
    pub event_type_keys: Vec<String>,
    /// Raw event name -> canonical event type
    pub event_type_map: BTreeMap<String, String>,
    pub default_event_type: Option<String>,
    /// Keys holding the account / pixel id, first present wins
    pub account_id_keys: Vec<String>,
    /// Keep every parameter, not only the keys named by the schema
    pub capture_all: bool,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            optional: Vec::new(),
            aliases: Vec::new(),
            parsers: BTreeMap::new(),
            validators: BTreeMap::new(),
            event_type_keys: Vec::new(),
            event_type_map: BTreeMap::new(),
            default_event_type: None,
            account_id_keys: Vec::new(),
            capture_all: true,
        }
    }
}

/// Output of parameter extraction for the promoted provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedParameters {
    /// Raw values after alias backfill
    pub raw: BTreeMap<String, String>,
    /// Parsed values
    pub values: BTreeMap<String, Value>,
    pub issues: Vec<String>,
}

impl ParameterSchema {
    /// Run aliases, parsers and validators over the request's parameters.
    pub fn extract(&self, request: &RequestRecord) -> ExtractedParameters {
        let mut raw: BTreeMap<String, String> = request
            .merged_params()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        for (canonical, aliases) in &self.aliases {
            if raw.contains_key(canonical) {
                continue;
            }
            if let Some(value) = aliases.iter().find_map(|alias| raw.get(alias).cloned()) {
                raw.insert(canonical.clone(), value);
            }
        }

        let mut out = ExtractedParameters::default();

        for key in &self.required {
            if !raw.contains_key(key) {
                out.issues.push(format!("missing required parameter '{key}'"));
            }
        }

        for (key, value) in &raw {
            if !self.capture_all && !self.names_key(key) {
                continue;
            }
            let parsed = match self.parsers.get(key) {
                Some(parser) => parser.apply(value).unwrap_or_else(|e| {
                    out.issues.push(format!("parameter '{key}' {e}"));
                    Value::String(value.clone())
                }),
                None => Value::String(value.clone()),
            };
            out.values.insert(key.clone(), parsed);
        }

        for (key, validators) in &self.validators {
            let Some(value) = raw.get(key) else { continue };
            for validator in validators {
                if let Err(e) = validator.check(value) {
                    out.issues.push(format!("parameter '{key}' {e}"));
                }
            }
        }

        out.raw = raw;
        out
    }

    fn names_key(&self, key: &str) -> bool {
        self.required.iter().any(|k| k == key)
            || self.optional.iter().any(|k| k == key)
            || self.aliases.iter().any(|(k, _)| k == key)
            || self.event_type_keys.iter().any(|k| k == key)
            || self.account_id_keys.iter().any(|k| k == key)
    }

    pub fn event_type(&self, params: &ExtractedParameters) -> Option<String> {
        self.event_type_keys
            .iter()
            .find_map(|key| params.raw.get(key).filter(|v| !v.is_empty()))
            .map(|raw| self.event_type_map.get(raw).cloned().unwrap_or_else(|| raw.clone()))
            .or_else(|| self.default_event_type.clone())
    }

    pub fn account_id(&self, params: &ExtractedParameters) -> Option<String> {
        self.account_id_keys
            .iter()
            .find_map(|key| params.raw.get(key).filter(|v| !v.is_empty()).cloned())
    }
}

// =============================================================================
// Confidence Rules
// =============================================================================

/// Condition for a provider-specific confidence bonus or penalty.
#[derive(Debug, Clone)]
pub enum RuleCondition {
    PathContains(String),
    HostSuffix(String),
    /// Any of the keys is present in the query or body
    AnyParam(Vec<String>),
    /// Every key is present in the query or body
    AllParams(Vec<String>),
    HeaderPresent(String),
    Method(MethodMask),
    HasBody,
}

impl RuleCondition {
    pub fn holds(&self, request: &RequestRecord) -> bool {
        match self {
            Self::PathContains(needle) => contains_ignore_ascii_case(&request.parts.path, needle),
            Self::HostSuffix(domain) => host_matches_domain(&request.parts.host, domain),
            Self::AnyParam(keys) => keys.iter().any(|k| request.has_param(k)),
            Self::AllParams(keys) => keys.iter().all(|k| request.has_param(k)),
            Self::HeaderPresent(name) => request.header(name).is_some(),
            Self::Method(mask) => !mask.is_empty() && mask.allows(&request.method),
            Self::HasBody => request.body.is_some(),
        }
    }
}

/// A labelled confidence delta applied when its condition holds.
#[derive(Debug, Clone)]
pub struct ConfidenceRule {
    pub label: String,
    pub condition: RuleCondition,
    pub delta: f64,
}

// =============================================================================
// Provider Definition
// =============================================================================

/// Immutable, data-only description of a tracking provider.
#[derive(Debug, Clone)]
pub struct ProviderDefinition {
    pub id: String,
    pub name: String,
    pub category: String,
    pub patterns: PatternConfig,
    pub schema: ParameterSchema,
    pub rules: Vec<ConfidenceRule>,
}

/// Raw per-provider scores, combined into a confidence by the matcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// 1.0 if any URL, domain or path pattern matched
    pub pattern: f64,
    /// Weighted fraction of query patterns that matched
    pub query: f64,
    pub method_allowed: bool,
    /// A required query parameter was missing or mismatched
    pub required_failed: bool,
    pub matched_rules: Vec<String>,
}

/// Provider-specific delta on top of the base score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceAdjustment {
    pub delta: f64,
    pub matched_rules: Vec<String>,
}

/// Capability interface every registered provider implements.
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn category(&self) -> &str;

    /// Pattern, query and method scores for a request.
    fn score(&self, request: &RequestRecord) -> Result<ScoreBreakdown, ProviderError>;

    /// Heuristic bonus or penalty, summed with the base score by the matcher.
    fn confidence_adjustment(&self, _request: &RequestRecord) -> Result<ConfidenceAdjustment, ProviderError> {
        Ok(ConfidenceAdjustment::default())
    }

    fn extract_parameters(&self, request: &RequestRecord) -> ExtractedParameters;

    fn extract_event_type(&self, request: &RequestRecord, params: &ExtractedParameters) -> Option<String>;

    fn extract_account_id(&self, _request: &RequestRecord, _params: &ExtractedParameters) -> Option<String> {
        None
    }
}

/// Score a request against a pattern config.
pub fn score_patterns(patterns: &PatternConfig, request: &RequestRecord) -> ScoreBreakdown {
    let mut breakdown = ScoreBreakdown {
        method_allowed: patterns.methods.allows(&request.method),
        ..ScoreBreakdown::default()
    };

    let url_hit = patterns
        .urls
        .iter()
        .find(|p| p.is_match(&request.url))
        .map(|p| format!("url:{}", p.as_str()));
    let domain_hit = patterns
        .domains
        .iter()
        .find(|p| p.is_match(&request.parts.host))
        .map(|p| format!("domain:{}", p.as_str()));
    let path_hit = patterns
        .paths
        .iter()
        .find(|p| p.is_match(&request.parts.path))
        .map(|p| format!("path:{}", p.as_str()));

    for hit in [url_hit, domain_hit, path_hit].into_iter().flatten() {
        breakdown.pattern = 1.0;
        breakdown.matched_rules.push(hit);
    }

    let mut total_weight = 0.0;
    let mut matched_weight = 0.0;
    for param in &patterns.query_params {
        let value = request.param(&param.key);
        let matched = match (value, &param.value) {
            (None, _) => {
                if param.required {
                    breakdown.required_failed = true;
                }
                // Missing optional keys do not count against the provider
                continue;
            }
            (Some(_), None) => true,
            (Some(v), Some(re)) => re.is_match(v),
        };

        total_weight += param.weight;
        if matched {
            matched_weight += param.weight;
            breakdown.matched_rules.push(format!("query:{}", param.key));
        } else if param.required {
            breakdown.required_failed = true;
        }
    }

    if total_weight > 0.0 {
        breakdown.query = matched_weight / total_weight;
    }

    if breakdown.method_allowed && !patterns.methods.is_empty() {
        breakdown.matched_rules.push(format!("method:{}", request.method));
    }

    breakdown
}

/// A provider backed entirely by a `ProviderDefinition`.
#[derive(Debug, Clone)]
pub struct DefinedProvider {
    definition: ProviderDefinition,
}

impl DefinedProvider {
    pub fn new(definition: ProviderDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }
}

impl Provider for DefinedProvider {
    fn id(&self) -> &str {
        &self.definition.id
    }

    fn name(&self) -> &str {
        &self.definition.name
    }

    fn category(&self) -> &str {
        &self.definition.category
    }

    fn score(&self, request: &RequestRecord) -> Result<ScoreBreakdown, ProviderError> {
        Ok(score_patterns(&self.definition.patterns, request))
    }

    fn confidence_adjustment(&self, request: &RequestRecord) -> Result<ConfidenceAdjustment, ProviderError> {
        let mut adjustment = ConfidenceAdjustment::default();
        for rule in &self.definition.rules {
            if rule.condition.holds(request) {
                adjustment.delta += rule.delta;
                adjustment.matched_rules.push(format!("rule:{}", rule.label));
            }
        }
        Ok(adjustment)
    }

    fn extract_parameters(&self, request: &RequestRecord) -> ExtractedParameters {
        self.definition.schema.extract(request)
    }

    fn extract_event_type(&self, _request: &RequestRecord, params: &ExtractedParameters) -> Option<String> {
        self.definition.schema.event_type(params)
    }

    fn extract_account_id(&self, _request: &RequestRecord, params: &ExtractedParameters) -> Option<String> {
        self.definition.schema.account_id(params)
    }
}

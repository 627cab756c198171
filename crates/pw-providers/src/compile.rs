//! Compile provider definition documents into engine definitions
//!
//! Regexes are compiled once here; a definition that fails to compile never
//! reaches the registry.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use thiserror::Error;

use pw_core::provider::{
    ConfidenceRule, ParameterSchema, Pattern, PatternConfig, ProviderDefinition, QueryParamPattern,
    RuleCondition, Validator, ValueParser,
};
use pw_core::{MethodMask, ProviderRegistry, RegistryError};

use crate::document::{
    ConditionDoc, ParameterDoc, ParserDoc, PatternDoc, PatternDocs, ProviderDoc, ValidatorDoc,
};

/// Largest magnitude a single confidence rule may add or subtract.
pub const MAX_RULE_DELTA: f64 = 1.0;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Malformed provider document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider '{provider}': invalid regex in {field}: {source}")]
    InvalidRegex {
        provider: String,
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("Provider '{provider}': {reason}")]
    InvalidProvider { provider: String, reason: String },

    #[error("Provider '{0}' is defined twice with different contents")]
    Duplicate(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Summary of a `dedupe_docs` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub before: usize,
    pub after: usize,
    /// Byte-for-byte repeated definitions that were dropped
    pub deduped: usize,
}

/// Drop exact repeats of a provider; reject conflicting definitions sharing an id.
pub fn dedupe_docs(docs: &mut Vec<ProviderDoc>) -> Result<CompileStats, DefinitionError> {
    let before = docs.len();
    let mut seen: HashMap<String, ProviderDoc> = HashMap::new();
    let mut deduped = 0usize;
    let mut conflict = None;

    docs.retain(|doc| match seen.get(&doc.id) {
        Some(previous) if previous == doc => {
            deduped += 1;
            false
        }
        Some(_) => {
            conflict.get_or_insert_with(|| doc.id.clone());
            false
        }
        None => {
            seen.insert(doc.id.clone(), doc.clone());
            true
        }
    });

    if let Some(id) = conflict {
        return Err(DefinitionError::Duplicate(id));
    }
    if deduped > 0 {
        log::debug!("Dropped {} repeated provider definitions", deduped);
    }

    Ok(CompileStats {
        before,
        after: docs.len(),
        deduped,
    })
}

/// Compile one provider entry.
pub fn compile_provider(doc: &ProviderDoc) -> Result<ProviderDefinition, DefinitionError> {
    let invalid = |reason: String| DefinitionError::InvalidProvider {
        provider: doc.id.clone(),
        reason,
    };

    if doc.id.trim().is_empty() || doc.id.chars().any(char::is_whitespace) {
        return Err(invalid(format!("id '{}' must be non-empty without whitespace", doc.id)));
    }
    if doc.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }

    let patterns = compile_patterns(&doc.id, &doc.patterns)?;
    if patterns.urls.is_empty() && patterns.domains.is_empty() && patterns.paths.is_empty() {
        return Err(invalid("at least one url, domain or path pattern is required".to_string()));
    }

    let schema = compile_schema(&doc.id, &doc.parameters)?;

    let mut rules = Vec::with_capacity(doc.confidence_rules.len());
    for rule in &doc.confidence_rules {
        if !rule.delta.is_finite() || rule.delta.abs() > MAX_RULE_DELTA {
            return Err(invalid(format!(
                "rule '{}' delta {} outside [-{MAX_RULE_DELTA}, {MAX_RULE_DELTA}]",
                rule.label, rule.delta
            )));
        }
        rules.push(ConfidenceRule {
            label: rule.label.clone(),
            condition: compile_condition(&rule.when),
            delta: rule.delta,
        });
    }

    Ok(ProviderDefinition {
        id: doc.id.clone(),
        name: doc.name.clone(),
        category: doc.category.clone(),
        patterns,
        schema,
        rules,
    })
}

/// Dedupe, compile and register a set of docs in document order.
pub fn build_registry(mut docs: Vec<ProviderDoc>) -> Result<ProviderRegistry, DefinitionError> {
    let stats = dedupe_docs(&mut docs)?;
    let definitions = docs.iter().map(compile_provider).collect::<Result<Vec<_>, _>>()?;
    let registry = ProviderRegistry::from_definitions(definitions)?;
    log::info!(
        "Compiled {} providers ({} repeated definitions dropped)",
        stats.after,
        stats.deduped
    );
    Ok(registry)
}

// =============================================================================
// Pattern Compilation
// =============================================================================

fn compile_regex(provider: &str, field: &str, source: &str) -> Result<Regex, DefinitionError> {
    Regex::new(source).map_err(|source| DefinitionError::InvalidRegex {
        provider: provider.to_string(),
        field: field.to_string(),
        source,
    })
}

fn compile_pattern_list(provider: &str, field: &str, entries: &[PatternDoc]) -> Result<Vec<Pattern>, DefinitionError> {
    entries
        .iter()
        .map(|entry| match entry {
            PatternDoc::Literal(text) => Ok(Pattern::literal(text.clone())),
            PatternDoc::Regex { regex } => compile_regex(provider, field, regex).map(Pattern::Regex),
        })
        .collect()
}

fn compile_patterns(provider: &str, patterns: &PatternDocs) -> Result<PatternConfig, DefinitionError> {
    let mut query_params = Vec::with_capacity(patterns.query_params.len());
    for param in &patterns.query_params {
        if !param.weight.is_finite() || param.weight <= 0.0 {
            return Err(DefinitionError::InvalidProvider {
                provider: provider.to_string(),
                reason: format!("query param '{}' weight must be positive", param.key),
            });
        }
        let base = if param.required {
            QueryParamPattern::required(param.key.clone())
        } else {
            QueryParamPattern::optional(param.key.clone())
        };
        let mut pattern = base.with_weight(param.weight);
        if let Some(value) = &param.value {
            let field = format!("query_params.{}", param.key);
            pattern = pattern.with_value(compile_regex(provider, &field, value)?);
        }
        query_params.push(pattern);
    }

    Ok(PatternConfig {
        urls: compile_pattern_list(provider, "urls", &patterns.urls)?,
        domains: compile_pattern_list(provider, "domains", &patterns.domains)?,
        paths: compile_pattern_list(provider, "paths", &patterns.paths)?,
        methods: MethodMask::from_methods(&patterns.methods),
        query_params,
    })
}

// =============================================================================
// Schema Compilation
// =============================================================================

fn compile_parser(doc: &ParserDoc) -> ValueParser {
    match doc {
        ParserDoc::Trim => ValueParser::Trim,
        ParserDoc::Lowercase => ValueParser::Lowercase,
        ParserDoc::Uppercase => ValueParser::Uppercase,
        ParserDoc::Integer => ValueParser::Integer,
        ParserDoc::Float => ValueParser::Float,
        ParserDoc::Boolean => ValueParser::Boolean,
        ParserDoc::Json => ValueParser::Json,
        ParserDoc::List(sep) => ValueParser::List(*sep),
    }
}

fn compile_schema(provider: &str, doc: &ParameterDoc) -> Result<ParameterSchema, DefinitionError> {
    let parsers = doc
        .parsers
        .iter()
        .map(|(key, parser)| (key.clone(), compile_parser(parser)))
        .collect();

    let mut validators = BTreeMap::new();
    for (key, list) in &doc.validators {
        let mut compiled = Vec::with_capacity(list.len());
        for validator in list {
            compiled.push(match validator {
                ValidatorDoc::NonEmpty => Validator::NonEmpty,
                ValidatorDoc::Numeric => Validator::Numeric,
                ValidatorDoc::Matches(source) => {
                    Validator::Matches(compile_regex(provider, &format!("validators.{key}"), source)?)
                }
                ValidatorDoc::OneOf(options) => Validator::OneOf(options.clone()),
                ValidatorDoc::MaxLength(max) => Validator::MaxLength(*max),
            });
        }
        validators.insert(key.clone(), compiled);
    }

    Ok(ParameterSchema {
        required: doc.required.clone(),
        optional: doc.optional.clone(),
        aliases: doc
            .aliases
            .iter()
            .map(|(canonical, aliases)| (canonical.clone(), aliases.clone()))
            .collect(),
        parsers,
        validators,
        event_type_keys: doc.event_type_keys.clone(),
        event_type_map: doc.event_type_map.clone(),
        default_event_type: doc.default_event_type.clone(),
        account_id_keys: doc.account_id_keys.clone(),
        capture_all: doc.capture_all,
    })
}

fn compile_condition(doc: &ConditionDoc) -> RuleCondition {
    match doc {
        ConditionDoc::PathContains(needle) => RuleCondition::PathContains(needle.clone()),
        ConditionDoc::HostSuffix(domain) => RuleCondition::HostSuffix(domain.clone()),
        ConditionDoc::AnyParam(keys) => RuleCondition::AnyParam(keys.clone()),
        ConditionDoc::AllParams(keys) => RuleCondition::AllParams(keys.clone()),
        ConditionDoc::HeaderPresent(name) => RuleCondition::HeaderPresent(name.to_ascii_lowercase()),
        ConditionDoc::Method(methods) => RuleCondition::Method(MethodMask::from_methods(methods)),
        ConditionDoc::HasBody => RuleCondition::HasBody,
    }
}

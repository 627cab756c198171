//! Provider definition document format
//!
//! A document is either a JSON array of providers or an object with a
//! `providers` array. Patterns are plain strings (substring match) or
//! `{"regex": "..."}` objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternDoc {
    Literal(String),
    Regex { regex: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParamDoc {
    pub key: String,
    /// Regex the value must match
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternDocs {
    pub urls: Vec<PatternDoc>,
    pub domains: Vec<PatternDoc>,
    pub paths: Vec<PatternDoc>,
    pub methods: Vec<String>,
    pub query_params: Vec<QueryParamDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserDoc {
    Trim,
    Lowercase,
    Uppercase,
    Integer,
    Float,
    Boolean,
    Json,
    List(char),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorDoc {
    NonEmpty,
    Numeric,
    Matches(String),
    OneOf(Vec<String>),
    MaxLength(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterDoc {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    /// canonical key -> aliases in lookup order
    pub aliases: BTreeMap<String, Vec<String>>,
    pub parsers: BTreeMap<String, ParserDoc>,
    pub validators: BTreeMap<String, Vec<ValidatorDoc>>,
    pub event_type_keys: Vec<String>,
    pub event_type_map: BTreeMap<String, String>,
    pub default_event_type: Option<String>,
    pub account_id_keys: Vec<String>,
    pub capture_all: bool,
}

impl Default for ParameterDoc {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            optional: Vec::new(),
            aliases: BTreeMap::new(),
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionDoc {
    PathContains(String),
    HostSuffix(String),
    AnyParam(Vec<String>),
    AllParams(Vec<String>),
    HeaderPresent(String),
    Method(Vec<String>),
    HasBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceRuleDoc {
    pub label: String,
    pub when: ConditionDoc,
    pub delta: f64,
}

/// One provider as written in a definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDoc {
    pub id: String,
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub patterns: PatternDocs,
    #[serde(default)]
    pub parameters: ParameterDoc,
    #[serde(default)]
    pub confidence_rules: Vec<ConfidenceRuleDoc>,
}

fn default_category() -> String {
    "other".to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    List(Vec<ProviderDoc>),
    Wrapped { providers: Vec<ProviderDoc> },
}

/// Parse a provider definition document.
pub fn parse_provider_docs(text: &str) -> Result<Vec<ProviderDoc>, serde_json::Error> {
    let document: Document = serde_json::from_str(text)?;
    Ok(match document {
        Document::List(docs) => docs,
        Document::Wrapped { providers } => providers,
    })
}

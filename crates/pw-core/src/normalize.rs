//! Request normalization
//!
//! Converts the raw details a host reports for an outbound request into an immutable
//! `RequestRecord`. Malformed URLs and undecodable bodies are rejected here so that
//! nothing downstream has to re-validate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::NormalizationError;
use crate::hash::fingerprint;
use crate::types::{
    unix_millis, HeaderMap, InterceptionPhase, RequestBody, RequestRecord, SessionId, UrlParts,
};
use crate::url::strip_query_and_fragment;

// =============================================================================
// Raw Host Input
// =============================================================================

/// Request body as supplied by the host's interception API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawBody {
    /// Parsed form fields; every key may carry several values
    FormData(BTreeMap<String, Vec<String>>),
    /// Raw bytes, expected to be UTF-8
    Raw(Vec<u8>),
    /// Already-decoded text
    Text(String),
}

/// Details of a "before request sent" callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRequest {
    pub request_id: String,
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default = "default_tab_id")]
    pub tab_id: SessionId,
    #[serde(default)]
    pub body: Option<RawBody>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Host timestamp; the capture time is used when absent
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
}

fn default_tab_id() -> SessionId {
    -1
}

impl RawRequest {
    /// Minimal GET request, mostly useful for tests and the CLI.
    pub fn get(request_id: impl Into<String>, url: impl Into<String>, tab_id: SessionId) -> Self {
        Self {
            request_id: request_id.into(),
            url: url.into(),
            method: "GET".to_string(),
            tab_id,
            body: None,
            headers: BTreeMap::new(),
            timestamp_ms: None,
        }
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize a raw host request into a canonical record.
pub fn normalize(raw: &RawRequest) -> Result<RequestRecord, NormalizationError> {
    let trimmed = raw.url.trim();
    let parsed = Url::parse(trimmed).map_err(|e| NormalizationError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(NormalizationError::UnsupportedScheme(other.to_string())),
    }

    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
        _ => {
            return Err(NormalizationError::InvalidUrl {
                url: trimmed.to_string(),
                reason: "missing host".to_string(),
            })
        }
    };

    let method = if raw.method.trim().is_empty() {
        "GET".to_string()
    } else {
        raw.method.trim().to_ascii_uppercase()
    };

    let mut query = BTreeMap::new();
    for (key, value) in parsed.query_pairs() {
        query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }

    let raw_query = parsed.query().unwrap_or("").to_string();
    let url = parsed.as_str().to_string();
    let fingerprint = fingerprint(&method, strip_query_and_fragment(&url), &raw_query);

    let parts = UrlParts {
        scheme: parsed.scheme().to_string(),
        host,
        port: parsed.port(),
        path: parsed.path().to_string(),
        query: raw_query,
        fragment: parsed.fragment().map(str::to_string),
    };

    let body = raw.body.as_ref().map(normalize_body).transpose()?;

    let headers: HeaderMap = raw
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();

    Ok(RequestRecord {
        request_id: raw.request_id.clone(),
        url,
        method,
        headers,
        body,
        query,
        parts,
        captured_at_ms: raw.timestamp_ms.unwrap_or_else(unix_millis),
        session_id: raw.tab_id,
        phase: InterceptionPhase::BeforeRequest,
        fingerprint,
    })
}

fn normalize_body(body: &RawBody) -> Result<RequestBody, NormalizationError> {
    match body {
        RawBody::FormData(form) => {
            let fields = form
                .iter()
                .filter_map(|(k, values)| values.first().map(|v| (k.clone(), v.clone())))
                .collect();
            Ok(RequestBody { fields, raw: None })
        }
        RawBody::Raw(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| NormalizationError::InvalidBody(e.to_string()))?;
            Ok(parse_text_body(text))
        }
        RawBody::Text(text) => Ok(parse_text_body(text)),
    }
}

/// Decode a text body into fields: a JSON object is flattened one level, url-encoded
/// text (possibly several newline-separated batches) is decoded, anything else is kept raw.
fn parse_text_body(text: &str) -> RequestBody {
    let trimmed = text.trim();
    let mut fields = BTreeMap::new();

    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(trimmed) {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                fields.insert(key, value);
            }
        }
    } else if looks_url_encoded(trimmed) {
        for line in trimmed.lines() {
            for (key, value) in url::form_urlencoded::parse(line.trim().as_bytes()) {
                fields.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
        }
    }

    RequestBody {
        fields,
        raw: Some(text.to_string()),
    }
}

fn looks_url_encoded(text: &str) -> bool {
    !text.is_empty()
        && text.contains('=')
        && !text.contains(' ')
        && !text.starts_with('[')
        && !text.starts_with('<')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_get() {
        let raw = RawRequest::get("1", "https://Example.com/tr?id=123&ev=PageView&id=999#frag", 4);
        let record = normalize(&raw).expect("valid url");

        assert_eq!(record.method, "GET");
        assert_eq!(record.parts.host, "example.com");
        assert_eq!(record.parts.path, "/tr");
        assert_eq!(record.parts.fragment.as_deref(), Some("frag"));
        assert_eq!(record.query.get("id").map(String::as_str), Some("123"));
        assert_eq!(record.query.get("ev").map(String::as_str), Some("PageView"));
        assert_eq!(record.session_id, 4);
        assert_eq!(record.phase, InterceptionPhase::BeforeRequest);
    }

    #[test]
    fn test_normalize_decodes_query() {
        let raw = RawRequest::get("1", "https://example.com/collect?dl=https%3A%2F%2Fshop.test%2F&en=page%20view", 1);
        let record = normalize(&raw).expect("valid url");
        assert_eq!(record.param("dl"), Some("https://shop.test/"));
        assert_eq!(record.param("en"), Some("page view"));
    }

    #[test]
    fn test_normalize_rejects_bad_urls() {
        let bad = RawRequest::get("1", "not a url", 1);
        assert!(matches!(normalize(&bad), Err(NormalizationError::InvalidUrl { .. })));

        let ftp = RawRequest::get("1", "ftp://example.com/file", 1);
        assert_eq!(
            normalize(&ftp),
            Err(NormalizationError::UnsupportedScheme("ftp".to_string()))
        );
    }

    #[test]
    fn test_normalize_method_defaults_and_uppercases() {
        let mut raw = RawRequest::get("1", "https://example.com/", 1);
        raw.method = String::new();
        assert_eq!(normalize(&raw).expect("valid").method, "GET");
        raw.method = "post".to_string();
        assert_eq!(normalize(&raw).expect("valid").method, "POST");
    }

    #[test]
    fn test_normalize_headers_lowercased() {
        let mut raw = RawRequest::get("1", "https://example.com/", 1);
        raw.headers.insert("Content-Type".to_string(), "text/plain".to_string());
        let record = normalize(&raw).expect("valid");
        assert_eq!(record.header("content-type"), Some("text/plain"));
        assert_eq!(record.header("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn test_normalize_form_body() {
        let mut raw = RawRequest::get("1", "https://example.com/tr", 1);
        raw.method = "POST".to_string();
        let mut form = BTreeMap::new();
        form.insert("id".to_string(), vec!["42".to_string(), "43".to_string()]);
        form.insert("empty".to_string(), vec![]);
        raw.body = Some(RawBody::FormData(form));

        let record = normalize(&raw).expect("valid");
        assert_eq!(record.param("id"), Some("42"));
        assert!(!record.has_param("empty"));
    }

    #[test]
    fn test_normalize_json_body() {
        let mut raw = RawRequest::get("1", "https://example.com/events", 1);
        raw.method = "POST".to_string();
        raw.body = Some(RawBody::Raw(br#"{"event":"Purchase","value":12.5,"user":{"id":1}}"#.to_vec()));

        let record = normalize(&raw).expect("valid");
        assert_eq!(record.param("event"), Some("Purchase"));
        assert_eq!(record.param("value"), Some("12.5"));
        assert_eq!(record.param("user"), Some(r#"{"id":1}"#));
    }

    #[test]
    fn test_normalize_urlencoded_batches() {
        let mut raw = RawRequest::get("1", "https://region1.google-analytics.com/g/collect?tid=G-ABC", 1);
        raw.method = "POST".to_string();
        raw.body = Some(RawBody::Text("en=page_view&_et=10\nen=scroll".to_string()));

        let record = normalize(&raw).expect("valid");
        assert_eq!(record.param("en"), Some("page_view"));
        assert_eq!(record.param("_et"), Some("10"));
    }

    #[test]
    fn test_normalize_rejects_invalid_utf8_body() {
        let mut raw = RawRequest::get("1", "https://example.com/tr", 1);
        raw.body = Some(RawBody::Raw(vec![0xff, 0xfe, 0xfd]));
        assert!(matches!(normalize(&raw), Err(NormalizationError::InvalidBody(_))));
    }

    #[test]
    fn test_query_wins_over_body() {
        let mut raw = RawRequest::get("1", "https://example.com/tr?id=1", 1);
        raw.body = Some(RawBody::Text("id=2&ev=Lead".to_string()));
        let record = normalize(&raw).expect("valid");
        let merged = record.merged_params();
        assert_eq!(merged.get("id"), Some(&"1"));
        assert_eq!(merged.get("ev"), Some(&"Lead"));
    }

    #[test]
    fn test_fingerprint_stable_across_query_order() {
        let a = normalize(&RawRequest::get("1", "https://example.com/tr?id=1&ev=A", 1)).expect("valid");
        let b = normalize(&RawRequest::get("2", "https://example.com/tr?ev=A&id=1#x", 2)).expect("valid");
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}

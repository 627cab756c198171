//! URL helpers for matching and fingerprinting
//!
//! Full URL parsing happens once in the normalizer (via the `url` crate). These helpers
//! work on the already-split components and avoid allocating where they can.

// =============================================================================
// Host Suffixes
// =============================================================================

/// Iterator for suffix-walking a host from the full name down to its last label.
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`, `example.com`, `com`.
pub struct HostSuffixIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> HostSuffixIter<'a> {
    pub fn new(host: &'a str) -> Self {
        let host = host.trim_end_matches('.');
        Self {
            remaining: if host.is_empty() { None } else { Some(host) },
        }
    }
}

impl<'a> Iterator for HostSuffixIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.remaining?;
        self.remaining = current.find('.').map(|dot| &current[dot + 1..]);
        Some(current)
    }
}

/// Walk host suffixes from most specific to least.
#[inline]
pub fn walk_host_suffixes(host: &str) -> HostSuffixIter<'_> {
    HostSuffixIter::new(host)
}

/// True if `host` is `domain` or a subdomain of it (case-insensitive).
pub fn host_matches_domain(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches("*.").trim_start_matches('.');
    if domain.is_empty() {
        return false;
    }
    walk_host_suffixes(host).any(|suffix| suffix.eq_ignore_ascii_case(domain))
}

// =============================================================================
// Query Strings
// =============================================================================

/// Split a raw query string into `(key, value)` pairs without decoding.
///
/// Empty segments are skipped, a segment without `=` yields an empty value.
pub fn split_query(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.find('=') {
            Some(idx) => (&part[..idx], &part[idx + 1..]),
            None => (part, ""),
        })
}

/// Canonical query string: pairs sorted by key, then value, re-joined with `&`.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = split_query(query).collect();
    if pairs.is_empty() {
        return String::new();
    }
    pairs.sort_unstable();

    let mut out = String::with_capacity(query.len());
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// Strip the query and fragment from a URL.
#[inline]
pub fn strip_query_and_fragment(url: &str) -> &str {
    let end = url
        .as_bytes()
        .iter()
        .position(|&b| b == b'?' || b == b'#')
        .unwrap_or(url.len());
    &url[..end]
}

/// Case-insensitive substring search on ASCII bytes.
pub fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }

    let last = haystack.len() - needle.len();
    (0..=last).any(|i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

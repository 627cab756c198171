//! Request fingerprint hashing
//!
//! A fingerprint is two Murmur3 passes with different seeds over the canonical
//! request key, packed into a `Hash64`. The dedup cache keys on this fixed-size
//! value instead of the full string. `(0, 0)` never comes out of `hash64`.

use serde::{Deserialize, Serialize};

use crate::url::canonical_query;

/// 64-bit hash kept as two 32-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash64 {
    pub lo: u32,
    pub hi: u32,
}

impl Hash64 {
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.lo == 0 && self.hi == 0
    }

    #[inline]
    pub const fn to_u64(&self) -> u64 {
        ((self.hi as u64) << 32) | (self.lo as u64)
    }

    #[inline]
    pub const fn from_u64(v: u64) -> Self {
        Self {
            lo: v as u32,
            hi: (v >> 32) as u32,
        }
    }
}

impl std::fmt::Display for Hash64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.to_u64())
    }
}

const SEED_LO: u32 = 0x9e3779b9;
const SEED_HI: u32 = 0x85ebca6b;

const C1: u32 = 0xcc9e2d51;
const C2: u32 = 0x1b873593;

#[inline]
fn scramble(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

/// Murmur3 x86 32-bit.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut blocks = data.chunks_exact(4);
    for block in blocks.by_ref() {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= scramble(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let k = tail
            .iter()
            .enumerate()
            .fold(0u32, |k, (i, byte)| k | (u32::from(*byte) << (8 * i)));
        h ^= scramble(k);
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^ (h >> 16)
}

/// Hash arbitrary bytes into a non-empty `Hash64`.
#[inline]
pub fn hash64(data: &[u8]) -> Hash64 {
    let hi = murmur3_32(data, SEED_HI);
    let mut lo = murmur3_32(data, SEED_LO);
    if lo == 0 && hi == 0 {
        lo = 1;
    }
    Hash64 { lo, hi }
}

/// Build the canonical fingerprint string for a request.
///
/// `METHOD origin+path?sorted-query`. The fragment never participates and query
/// pairs are ordered so that `?a=1&b=2` and `?b=2&a=1` collapse to the same key.
pub fn fingerprint_key(method: &str, url_without_query: &str, query: &str) -> String {
    let canonical = canonical_query(query);
    let mut key = String::with_capacity(method.len() + url_without_query.len() + canonical.len() + 2);
    key.push_str(&method.to_ascii_uppercase());
    key.push(' ');
    key.push_str(url_without_query);
    if !canonical.is_empty() {
        key.push('?');
        key.push_str(&canonical);
    }
    key
}

/// Hash the canonical fingerprint of a request.
#[inline]
pub fn fingerprint(method: &str, url_without_query: &str, query: &str) -> Hash64 {
    hash64(fingerprint_key(method, url_without_query, query).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_known_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_32(b"test", 0), 0xba6bd213);
        assert_eq!(murmur3_32(b"Hello, world!", 0x9747b28c), 0x24884cba);
    }

    #[test]
    fn test_seed_changes_hash() {
        assert_ne!(murmur3_32(b"example.com", 0), murmur3_32(b"example.com", 1));
    }

    #[test]
    fn test_hash64_never_zero() {
        let test_strings = [
            b"" as &[u8],
            b"a",
            b"GET https://example.com/tr",
            b"POST https://www.google-analytics.com/g/collect?v=2",
        ];
        for s in test_strings {
            let h = hash64(s);
            assert!(!h.is_empty(), "hash64({:?}) returned empty sentinel", s);
        }
    }

    #[test]
    fn test_hash64_u64_round_trip() {
        let h = hash64(b"pixel");
        assert_eq!(Hash64::from_u64(h.to_u64()), h);
    }

    #[test]
    fn test_fingerprint_ignores_query_order() {
        let a = fingerprint("GET", "https://example.com/tr", "id=1&ev=PageView");
        let b = fingerprint("get", "https://example.com/tr", "ev=PageView&id=1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_method_and_values() {
        let get = fingerprint("GET", "https://example.com/tr", "id=1");
        let post = fingerprint("POST", "https://example.com/tr", "id=1");
        let other = fingerprint("GET", "https://example.com/tr", "id=2");
        assert_ne!(get, post);
        assert_ne!(get, other);
    }

    #[test]
    fn test_fingerprint_key_format() {
        assert_eq!(
            fingerprint_key("get", "https://example.com/tr", "b=2&a=1"),
            "GET https://example.com/tr?a=1&b=2"
        );
        assert_eq!(fingerprint_key("GET", "https://example.com/", ""), "GET https://example.com/");
    }
}

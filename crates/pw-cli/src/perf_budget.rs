use std::sync::Arc;
use std::time::Instant;

use pw_core::dedup::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL};
use pw_core::{normalize, DedupCache, Matcher, ProviderRegistry, RawBody, RawRequest, RequestRecord};

struct Budget {
    name: &'static str,
    limit: f64,
    unit: &'static str,
}

const MATCHER_BUILD: Budget = Budget { name: "Matcher Build", limit: 50.0, unit: "ms" };
const CLASSIFY_P99: Budget = Budget { name: "Classify P99 Latency", limit: 1000.0, unit: "μs" };
const DEDUP_HIT_P99: Budget = Budget { name: "Dedup Hit P99 Latency", limit: 20.0, unit: "μs" };

fn sample_requests() -> Result<Vec<RequestRecord>, String> {
    let urls = [
        "https://www.facebook.com/tr?id=1234567890&ev=PageView&dl=https%3A%2F%2Fshop.example%2F",
        "https://www.google-analytics.com/g/collect?v=2&tid=G-ABC123&en=page_view",
        "https://www.googletagmanager.com/gtm.js?id=GTM-XYZ123",
        "https://cdn.example.com/app.js",
        "https://shop.example/api/cart?items=3",
    ];
    let mut records = urls
        .iter()
        .enumerate()
        .map(|(i, url)| normalize(&RawRequest::get(i.to_string(), *url, 1)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid sample request: {}", e))?;

    let post = RawRequest {
        method: "POST".to_string(),
        body: Some(RawBody::Text(
            r#"{"event":"CompletePayment","context":{"ad":{"callback":"abc"}}}"#.to_string(),
        )),
        ..RawRequest::get("post", "https://analytics.tiktok.com/api/v2/pixel", 1)
    };
    records.push(normalize(&post).map_err(|e| format!("Invalid sample request: {}", e))?);
    Ok(records)
}

pub fn run_perf_budget(registry: Arc<ProviderRegistry>, iterations: usize) -> Result<(), String> {
    println!("Performance Budget Check");
    println!("==================================================");

    let requests = sample_requests()?;

    let build_start = Instant::now();
    let matcher = Matcher::new(Arc::clone(&registry));
    let build_ms = build_start.elapsed().as_secs_f64() * 1000.0;

    println!("Warming up...");
    for _ in 0..100 {
        for request in &requests {
            let _ = matcher.classify(request);
        }
    }

    println!("Measuring classification latency ({} providers)...", registry.len());
    let mut latencies = Vec::with_capacity(iterations * requests.len());
    for _ in 0..iterations {
        for request in &requests {
            let start = Instant::now();
            let _ = matcher.classify(request);
            latencies.push(start.elapsed().as_secs_f64() * 1_000_000.0);
        }
    }
    let p99_us = p99(&mut latencies);

    println!("Measuring dedup hits...");
    let mut cache = DedupCache::new(DEFAULT_DEDUP_TTL, DEFAULT_DEDUP_CAPACITY);
    for request in &requests {
        cache.get_or_compute(request.fingerprint, || matcher.classify(request));
    }
    let mut hits = Vec::with_capacity(iterations * requests.len());
    for _ in 0..iterations {
        for request in &requests {
            let start = Instant::now();
            let _ = cache.get(request.fingerprint);
            hits.push(start.elapsed().as_secs_f64() * 1_000_000.0);
        }
    }
    let hit_p99_us = p99(&mut hits);

    println!();
    println!("Results");
    println!("--------------------------------------------------");

    let results = [
        MATCHER_BUILD.check(build_ms),
        CLASSIFY_P99.check(p99_us),
        DEDUP_HIT_P99.check(hit_p99_us),
    ];
    let passed = results.iter().all(|ok| *ok);

    println!();
    println!("==================================================");

    if passed {
        println!("✓ All performance budgets passed");
        Ok(())
    } else {
        Err("Performance budget exceeded".to_string())
    }
}

impl Budget {
    fn check(&self, actual: f64) -> bool {
        let passed = actual <= self.limit;
        let status = if passed { "✓" } else { "✗" };
        println!(
            "{} {}: {:.2} {} (limit: {:.2} {})",
            status, self.name, actual, self.unit, self.limit, self.unit
        );
        passed
    }
}

/// Nearest-rank 99th percentile; sorts in place.
fn p99(samples: &mut [f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(f64::total_cmp);
    let rank = (samples.len() * 99).div_ceil(100);
    samples[rank.saturating_sub(1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p99() {
        let mut samples: Vec<f64> = (1..=100).rev().map(f64::from).collect();
        assert_eq!(p99(&mut samples), 99.0);
        assert_eq!(p99(&mut [3.0]), 3.0);
        assert_eq!(p99(&mut []), 0.0);
    }

    #[test]
    fn test_sample_requests_normalize() {
        let requests = sample_requests().expect("valid samples");
        assert_eq!(requests.len(), 6);
        assert_eq!(requests[5].method, "POST");
    }
}

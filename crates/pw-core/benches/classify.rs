use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pw_core::provider::{ParameterSchema, Pattern, PatternConfig, ProviderDefinition, QueryParamPattern};
use pw_core::{normalize, DedupCache, Matcher, ProviderRegistry, RawRequest};

fn synthetic_registry(count: usize) -> ProviderRegistry {
    let definitions = (0..count).map(|i| ProviderDefinition {
        id: format!("vendor-{i}"),
        name: format!("Vendor {i}"),
        category: "analytics".to_string(),
        patterns: PatternConfig {
            domains: vec![Pattern::literal(format!("tracker{i}.example"))],
            paths: vec![Pattern::regex(&format!(r"^/v{i}/(collect|event)")).expect("regex")],
            query_params: vec![QueryParamPattern::required("id"), QueryParamPattern::optional("ev")],
            ..PatternConfig::default()
        },
        schema: ParameterSchema {
            event_type_keys: vec!["ev".to_string()],
            account_id_keys: vec!["id".to_string()],
            ..ParameterSchema::default()
        },
        rules: Vec::new(),
    });
    ProviderRegistry::from_definitions(definitions).expect("unique ids")
}

fn bench_classify(c: &mut Criterion) {
    let matcher = Matcher::new(Arc::new(synthetic_registry(40)));
    let hit = normalize(&RawRequest::get("1", "https://tracker17.example/v17/collect?id=42&ev=PageView", 1))
        .expect("valid url");
    let miss = normalize(&RawRequest::get("2", "https://cdn.example.org/static/app.js", 1)).expect("valid url");

    c.bench_function("classify_hit_40_providers", |b| b.iter(|| matcher.classify(black_box(&hit))));
    c.bench_function("classify_miss_40_providers", |b| b.iter(|| matcher.classify(black_box(&miss))));

    let mut cache = DedupCache::default();
    c.bench_function("classify_dedup_hit", |b| {
        b.iter(|| cache.get_or_compute(black_box(hit.fingerprint), || matcher.classify(&hit)))
    });
}

fn bench_normalize(c: &mut Criterion) {
    let raw = RawRequest::get(
        "1",
        "https://www.facebook.com/tr/?id=1234567890&ev=PageView&dl=https%3A%2F%2Fshop.example%2F&rl=&if=false&ts=1700000000000",
        1,
    );
    c.bench_function("normalize_pixel_url", |b| b.iter(|| normalize(black_box(&raw))));
}

criterion_group!(benches, bench_classify, bench_normalize);
criterion_main!(benches);

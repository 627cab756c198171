use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use pw_core::{HeaderMap, ProviderRegistry, RawRequest, SessionId};
use pw_pipeline::{BusPayload, NoopSource, Pipeline, PipelineConfig, ERROR};

/// One recorded host callback.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HostCallback {
    BeforeRequest(RawRequest),
    SendHeaders {
        request_id: String,
        #[serde(default)]
        headers: HeaderMap,
    },
    HeadersReceived {
        request_id: String,
        #[serde(default)]
        headers: HeaderMap,
        status: u16,
    },
    SessionCreated {
        session: SessionId,
    },
    SessionNavigated {
        session: SessionId,
        url: String,
    },
    SessionRemoved {
        session: SessionId,
    },
}

fn parse_capture(content: &str) -> Result<Vec<HostCallback>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| format!("Line {}: {}", index + 1, e))
        })
        .collect()
}

pub fn run_replay(
    input: &str,
    registry: Arc<ProviderRegistry>,
    config_path: Option<&str>,
    print_stats: bool,
) -> Result<(), String> {
    let content = fs::read_to_string(input)
        .map_err(|e| format!("Failed to read '{}': {}", input, e))?;
    let callbacks = parse_capture(&content)?;

    let mut config = match config_path {
        Some(path) => PipelineConfig::load_from_file(path)
            .map_err(|e| format!("Invalid configuration '{}': {}", path, e))?,
        None => PipelineConfig::default(),
    };
    // Offline traffic never stalls
    config.health.enabled = false;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;

    runtime.block_on(async move {
        let pipeline = Pipeline::new(config, registry, Arc::new(NoopSource))
            .map_err(|e| format!("Invalid configuration: {}", e))?;

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        pipeline.bus().on(ERROR, move |envelope| {
            if let BusPayload::Error { message, .. } = &envelope.payload {
                eprintln!("  ! {}", message);
            }
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        pipeline.start().map_err(|e| format!("Failed to start pipeline: {}", e))?;

        let start = Instant::now();
        let mut requests = 0usize;
        let mut matched = 0usize;
        for callback in &callbacks {
            match callback {
                HostCallback::BeforeRequest(raw) => {
                    requests += 1;
                    // Failures are reported on the bus
                    if let Ok(Some(event)) = pipeline.on_before_request(raw).await {
                        matched += 1;
                        let line = serde_json::to_string(&event)
                            .map_err(|e| format!("Failed to encode event: {}", e))?;
                        println!("{}", line);
                    }
                }
                HostCallback::SendHeaders { request_id, headers } => {
                    pipeline.on_send_headers(request_id, headers.clone());
                }
                HostCallback::HeadersReceived {
                    request_id,
                    headers,
                    status,
                } => {
                    pipeline.on_headers_received(request_id, headers.clone(), *status);
                }
                HostCallback::SessionCreated { session } => pipeline.session_created(*session),
                HostCallback::SessionNavigated { session, url } => {
                    pipeline.session_navigated(*session, url)
                }
                HostCallback::SessionRemoved { session } => pipeline.session_removed(*session),
            }
        }
        let elapsed = start.elapsed();

        pipeline.bus().flush().await;
        let stats = pipeline.stats();
        let sample = pipeline.performance_sample();
        pipeline.stop().await;

        eprintln!(
            "Replayed {} callbacks: {} requests, {} matched, {} errors in {:.1}ms",
            callbacks.len(),
            requests,
            matched,
            errors.load(Ordering::SeqCst),
            elapsed.as_secs_f64() * 1000.0
        );

        if print_stats {
            let encoded = serde_json::to_string_pretty(&stats)
                .map_err(|e| format!("Failed to encode stats: {}", e))?;
            eprintln!("{}", encoded);
            eprintln!(
                "Latency: p50 {:.2}ms, p95 {:.2}ms, max {:.2}ms",
                sample.p50_ms, sample.p95_ms, sample.max_ms
            );
        }

        Ok::<(), String>(())
    })
}

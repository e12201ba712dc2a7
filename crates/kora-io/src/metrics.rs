//! Prometheus metrics and the HTTP endpoint that serves them.
//!
//! `/metrics` is the Prometheus text format, `/status` the engine status
//! report as JSON, `/health` liveness and `/ready` readiness (at least one
//! completed scan cycle).

use kora_core::status::EngineStatus;
use kora_core::tags::TagRegistry;
use prometheus::core::Collector;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!("Failed to register metric: {}", e);
    }
    collector
}

// ============================================================================
// Scan Metrics
// ============================================================================

pub static SCAN_CYCLES: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new("kora_scan_cycles_total", "Completed scan cycles")
            .expect("valid metric definition"),
    )
});

pub static SCAN_OVERRUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "kora_scan_overruns_total",
            "Scan cycles that took longer than the scan period",
        )
        .expect("valid metric definition"),
    )
});

/// Scan cycle duration distribution in microseconds
pub static SCAN_CYCLE_DURATION_US: LazyLock<Histogram> = LazyLock::new(|| {
    register(
        Histogram::with_opts(
            HistogramOpts::new(
                "kora_scan_cycle_duration_us",
                "Scan cycle duration in microseconds",
            )
            .buckets(vec![
                100.0, 500.0, 1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0, 500_000.0,
                1_000_000.0, 2_000_000.0,
            ]),
        )
        .expect("valid metric definition"),
    )
});

pub static READ_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("kora_read_failures_total", "Failed tag reads"),
            &["tag", "kind"],
        )
        .expect("valid metric definition"),
    )
});

pub static ENGINE_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    register(
        IntGauge::new("kora_engine_running", "1 while the scan loop is running")
            .expect("valid metric definition"),
    )
});

// ============================================================================
// Tag Metrics
// ============================================================================

pub static TAG_VALUE: LazyLock<GaugeVec> = LazyLock::new(|| {
    register(
        GaugeVec::new(Opts::new("kora_tag_value", "Last value read per tag"), &["tag"])
            .expect("valid metric definition"),
    )
});

pub static TAG_STALE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new("kora_tag_stale", "1 when the tag missed its last read"),
            &["tag"],
        )
        .expect("valid metric definition"),
    )
});

pub static ALARMS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("kora_alarms_total", "Threshold alarms raised"),
            &["tag"],
        )
        .expect("valid metric definition"),
    )
});

pub static ANOMALIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("kora_anomalies_total", "Anomalies detected"),
            &["tag", "strategy"],
        )
        .expect("valid metric definition"),
    )
});

pub static ANOMALY_CONFIDENCE: LazyLock<GaugeVec> = LazyLock::new(|| {
    register(
        GaugeVec::new(
            Opts::new(
                "kora_anomaly_confidence",
                "Confidence of the latest anomaly verdict (0.0-1.0)",
            ),
            &["tag"],
        )
        .expect("valid metric definition"),
    )
});

// ============================================================================
// Queue & Sync Metrics
// ============================================================================

pub static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    register(
        IntGauge::new("kora_queue_depth", "Readings waiting for the backend")
            .expect("valid metric definition"),
    )
});

pub static QUEUE_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "kora_queue_dropped_total",
            "Oldest readings displaced from a full queue",
        )
        .expect("valid metric definition"),
    )
});

pub static READINGS_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new(
            "kora_readings_published_total",
            "Readings acknowledged by the backend",
        )
        .expect("valid metric definition"),
    )
});

pub static PUBLISH_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    register(
        IntCounter::new("kora_publish_retries_total", "Publish attempts retried")
            .expect("valid metric definition"),
    )
});

pub static SYNC_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kora_sync_dropped_total",
                "Readings that never reached the backend",
            ),
            &["reason"],
        )
        .expect("valid metric definition"),
    )
});

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = SCAN_CYCLES.get();
    let _ = SCAN_OVERRUNS.get();
    let _ = SCAN_CYCLE_DURATION_US.get_sample_count();
    let _ = &*READ_FAILURES;
    let _ = ENGINE_RUNNING.get();
    let _ = &*TAG_VALUE;
    let _ = &*TAG_STALE;
    let _ = &*ALARMS;
    let _ = &*ANOMALIES;
    let _ = &*ANOMALY_CONFIDENCE;
    let _ = QUEUE_DEPTH.get();
    let _ = QUEUE_DROPPED.get();
    let _ = READINGS_PUBLISHED.get();
    let _ = PUBLISH_RETRIES.get();
    let _ = &*SYNC_DROPPED;
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Engine state exposed by the HTTP endpoint.
#[derive(Clone)]
pub struct StatusEndpoint {
    pub status: Arc<EngineStatus>,
    pub registry: Arc<TagRegistry>,
}

struct Reply {
    code: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn text(code: u16, body: &str) -> Self {
        Self {
            code,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }
}

fn route(path: &str, endpoint: &StatusEndpoint) -> Reply {
    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/metrics" => {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                tracing::warn!("Failed to encode metrics: {}", e);
                return Reply::text(500, "Internal Server Error");
            }
            Reply {
                code: 200,
                content_type: "text/plain; version=0.0.4",
                body: buffer,
            }
        }
        "/status" => {
            let report = endpoint.status.report(&endpoint.registry);
            match serde_json::to_vec(&report) {
                Ok(body) => Reply {
                    code: 200,
                    content_type: "application/json",
                    body,
                },
                Err(e) => {
                    tracing::warn!("Failed to encode status: {}", e);
                    Reply::text(500, "Internal Server Error")
                }
            }
        }
        "/health" => Reply::text(200, "OK"),
        "/ready" => {
            if endpoint.status.is_running() && endpoint.status.cycles_completed() > 0 {
                Reply::text(200, "Ready")
            } else {
                Reply::text(503, "Not Ready")
            }
        }
        _ => Reply::text(404, "Not Found"),
    }
}

/// Bind `bind_addr` and serve requests on a background thread until `stop`
/// is set. Binding errors are returned to the caller.
pub fn serve_metrics(
    bind_addr: &str,
    endpoint: StatusEndpoint,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    let server = Server::http(bind_addr)
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;
    tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

    thread::Builder::new()
        .name("kora-metrics".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let request = match server.recv_timeout(Duration::from_millis(200)) {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Metrics server stopped: {}", e);
                        break;
                    }
                };

                let reply = route(request.url(), &endpoint);
                let mut response = Response::from_data(reply.body).with_status_code(reply.code);
                if let Ok(header) =
                    Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes())
                {
                    response = response.with_header(header);
                }
                if let Err(e) = request.respond(response) {
                    tracing::debug!("Failed to send metrics response: {}", e);
                }
            }
        })
}

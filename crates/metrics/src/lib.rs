//! Metrics and tracing setup for shardstate.
//!
//! Provides a global [`StateMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<StateMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static StateMetrics {
    METRICS.get_or_init(StateMetrics::new)
}

/// All Prometheus metrics for a state adapter process.
pub struct StateMetrics {
    pub registry: Registry,

    // ── Store operations ──
    pub store_ops: IntCounterVec,
    pub store_latency_secs: HistogramVec,

    // ── Routing ──
    pub node_retries: IntCounter,
    pub nodes_unavailable: IntCounter,
    pub redirects: IntCounter,
    pub topology_refreshes: IntCounter,

    // ── Batches ──
    pub batches_applied: IntCounter,
    pub batches_skipped: IntCounter,
    pub partial_failures: IntCounter,
    pub keys_written: IntCounter,
    pub keys_skipped: IntCounter,
    pub keys_read: IntCounter,
    pub batch_latency_secs: HistogramVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for StateMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for store/batch latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

impl StateMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let store_ops = IntCounterVec::new(
            Opts::new("shardstate_store_ops_total", "Store operations issued, by type"),
            &["op_type"],
        )
        .expect("store_ops counter vec");
        let store_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "shardstate_store_latency_seconds",
                "Store operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("store_latency_secs histogram");

        let node_retries = counter(
            "shardstate_node_retries_total",
            "Store operations retried after a node failure",
        );
        let nodes_unavailable = counter(
            "shardstate_nodes_unavailable_total",
            "Operations that exhausted their retry budget",
        );
        let redirects = counter(
            "shardstate_redirects_total",
            "Redirect responses received from store nodes",
        );
        let topology_refreshes = counter(
            "shardstate_topology_refreshes_total",
            "Routing table refreshes",
        );

        let batches_applied = counter(
            "shardstate_batches_applied_total",
            "Batches whose writes were fully confirmed",
        );
        let batches_skipped = counter(
            "shardstate_batches_skipped_total",
            "Replayed batches skipped because they were already committed",
        );
        let partial_failures = counter(
            "shardstate_partial_failures_total",
            "Batches that failed with unconfirmed keys",
        );
        let keys_written = counter("shardstate_keys_written_total", "Keys written");
        let keys_skipped = counter(
            "shardstate_keys_skipped_total",
            "Keys skipped on replay because they already carried the batch stamp",
        );
        let keys_read = counter("shardstate_keys_read_total", "Keys looked up");
        let batch_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "shardstate_batch_latency_seconds",
                "Batch update/query latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("batch_latency_secs histogram");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(store_ops.clone()),
            Box::new(store_latency_secs.clone()),
            Box::new(node_retries.clone()),
            Box::new(nodes_unavailable.clone()),
            Box::new(redirects.clone()),
            Box::new(topology_refreshes.clone()),
            Box::new(batches_applied.clone()),
            Box::new(batches_skipped.clone()),
            Box::new(partial_failures.clone()),
            Box::new(keys_written.clone()),
            Box::new(keys_skipped.clone()),
            Box::new(keys_read.clone()),
            Box::new(batch_latency_secs.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            store_ops,
            store_latency_secs,
            node_retries,
            nodes_unavailable,
            redirects,
            topology_refreshes,
            batches_applied,
            batches_skipped,
            partial_failures,
            keys_written,
            keys_skipped,
            keys_read,
            batch_latency_secs,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Count a store operation and start its latency timer.
pub fn start_store_timer(op_type: &str) -> prometheus::HistogramTimer {
    let m = metrics();
    m.store_ops.with_label_values(&[op_type]).inc();
    m.store_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

/// Start a batch operation latency timer ("update" / "query").
pub fn start_batch_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .batch_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

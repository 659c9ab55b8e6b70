use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::monitor::snapshot::SnapshotStore;

const NAMESPACE: &str = "cloud_exporter";

/// Prometheus metrics describing the exporter itself, plus the HTTP server
/// exposing them next to the cloud metric snapshot.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Scrape cycle ===
    /// Completed scrapes by status (ok/partial).
    pub scrapes_total: CounterVec,
    /// Wall time of a scrape cycle.
    pub scrape_duration: Histogram,
    /// Per-job failures by job and stage.
    pub job_errors_total: CounterVec,
    /// Failed jobs served from the last-good cache, by job.
    pub job_fallbacks_total: CounterVec,
    /// Resources surviving discovery, by job.
    pub resources_discovered: GaugeVec,
    /// Candidate series queried, by job.
    pub candidate_series: GaugeVec,

    // === Snapshot ===
    /// Metrics in the published snapshot.
    pub snapshot_metrics: Gauge,
    /// Generation of the published snapshot.
    pub snapshot_generation: Gauge,
    /// Jobs held in the last-good cache.
    pub cache_entries: Gauge,

    // === Remote calls ===
    /// Remote page requests by operation and status (ok/retry/error).
    pub remote_requests_total: CounterVec,
    /// Retried remote page requests by operation.
    pub remote_retries_total: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let scrapes_total = CounterVec::new(
            Opts::new("scrapes_total", "Completed scrape cycles by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new(
                "scrape_duration_seconds",
                "Wall time of a scrape cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let job_errors_total = CounterVec::new(
            Opts::new(
                "job_errors_total",
                "Per-job scrape failures by job and pipeline stage.",
            )
            .namespace(NAMESPACE),
            &["job", "stage"],
        )?;
        let job_fallbacks_total = CounterVec::new(
            Opts::new(
                "job_fallbacks_total",
                "Failed jobs served from the last-good result cache.",
            )
            .namespace(NAMESPACE),
            &["job"],
        )?;
        let resources_discovered = GaugeVec::new(
            Opts::new(
                "resources_discovered",
                "Resources surviving tag filtering in the last scrape.",
            )
            .namespace(NAMESPACE),
            &["job"],
        )?;
        let candidate_series = GaugeVec::new(
            Opts::new(
                "candidate_series",
                "Series queried for metric data in the last scrape.",
            )
            .namespace(NAMESPACE),
            &["job"],
        )?;
        let snapshot_metrics = Gauge::with_opts(
            Opts::new("snapshot_metrics", "Metrics in the published snapshot.")
                .namespace(NAMESPACE),
        )?;
        let snapshot_generation = Gauge::with_opts(
            Opts::new(
                "snapshot_generation",
                "Generation of the published snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let cache_entries = Gauge::with_opts(
            Opts::new("cache_entries", "Jobs held in the last-good result cache.")
                .namespace(NAMESPACE),
        )?;
        let remote_requests_total = CounterVec::new(
            Opts::new(
                "remote_requests_total",
                "Remote page requests by operation and status.",
            )
            .namespace(NAMESPACE),
            &["operation", "status"],
        )?;
        let remote_retries_total = CounterVec::new(
            Opts::new(
                "remote_retries_total",
                "Retried remote page requests by operation.",
            )
            .namespace(NAMESPACE),
            &["operation"],
        )?;

        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(job_errors_total.clone()))?;
        registry.register(Box::new(job_fallbacks_total.clone()))?;
        registry.register(Box::new(resources_discovered.clone()))?;
        registry.register(Box::new(candidate_series.clone()))?;
        registry.register(Box::new(snapshot_metrics.clone()))?;
        registry.register(Box::new(snapshot_generation.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(remote_requests_total.clone()))?;
        registry.register(Box::new(remote_retries_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            scrapes_total,
            scrape_duration,
            job_errors_total,
            job_fallbacks_total,
            resources_discovered,
            candidate_series,
            snapshot_metrics,
            snapshot_generation,
            cache_entries,
            remote_requests_total,
            remote_retries_total,
        })
    }

    /// Starts the HTTP server serving /metrics, /monitor and /healthz.
    /// Returns the bound address.
    pub async fn start(&self, snapshots: Arc<SnapshotStore>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            snapshots,
        });

        let app = router(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "http server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    snapshots: Arc<SnapshotStore>,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/monitor", get(monitor_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// GET /metrics - exporter self-metrics.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /monitor - the latest cloud metric snapshot.
async fn monitor_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.snapshots.load().encode_text() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding snapshot");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

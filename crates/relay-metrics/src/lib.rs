//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Metrics collection and export utilities."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use prometheus;

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Router exposing the registry at `/metrics`, for embedding into other servers.
pub fn metrics_router(registry: SharedRegistry) -> Router {
    Router::new().route(
        "/metrics",
        get(move || metrics_handler(registry.clone())),
    )
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = metrics_router(registry);

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Render every relay metric family in the Prometheus text format.
///
/// Encoding only fails on malformed families; the scrape then gets a 500 with
/// the encoder message so the gap is visible on the collector side.
pub async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let content_type = HeaderValue::from_static(prometheus::TEXT_FORMAT);
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body),
        Err(err) => {
            error!(error = %err, "relay metrics could not be encoded");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                format!("relay metrics unavailable: {err}"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the listener is bound to (resolved when port 0 was requested).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Reason label values for transform fallbacks.
pub mod fallback_reason {
    pub const TIMEOUT: &str = "timeout";
    pub const TRANSPORT: &str = "transport";
    pub const STATUS: &str = "status";
    pub const DECODE: &str = "decode";
}

/// Metrics recorded by the relay engine.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: SharedRegistry,
    received_total: IntCounter,
    forwarded_total: IntCounter,
    skipped_total: IntCounter,
    publish_failures_total: IntCounter,
    transform_fallbacks_total: IntCounterVec,
    transform_seconds: Histogram,
    subscribed: IntGauge,
}

impl RelayMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let received_total = IntCounter::with_opts(Opts::new(
            "relay_messages_received_total",
            "Messages delivered by the broker on the relay subscription",
        ))?;
        registry.register(Box::new(received_total.clone()))?;

        let forwarded_total = IntCounter::with_opts(Opts::new(
            "relay_messages_forwarded_total",
            "Transformed envelopes published to the forward topic",
        ))?;
        registry.register(Box::new(forwarded_total.clone()))?;

        let skipped_total = IntCounter::with_opts(Opts::new(
            "relay_messages_skipped_total",
            "Messages ignored because they arrived on the forward topic",
        ))?;
        registry.register(Box::new(skipped_total.clone()))?;

        let publish_failures_total = IntCounter::with_opts(Opts::new(
            "relay_publish_failures_total",
            "Forward publishes rejected by the broker client",
        ))?;
        registry.register(Box::new(publish_failures_total.clone()))?;

        let transform_fallbacks_total = IntCounterVec::new(
            Opts::new(
                "relay_transform_fallbacks_total",
                "Transform calls that fell back to the original payload",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(transform_fallbacks_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let transform_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "relay_transform_duration_seconds",
                "Wall-clock time spent waiting on the transformer",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(transform_seconds.clone()))?;

        let subscribed = IntGauge::with_opts(Opts::new(
            "relay_subscribed",
            "1 while the relay holds an active subscription",
        ))?;
        registry.register(Box::new(subscribed.clone()))?;

        Ok(Self {
            registry,
            received_total,
            forwarded_total,
            skipped_total,
            publish_failures_total,
            transform_fallbacks_total,
            transform_seconds,
            subscribed,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_received(&self) {
        self.received_total.inc();
    }

    pub fn record_forwarded(&self) {
        self.forwarded_total.inc();
    }

    pub fn record_skipped(&self) {
        self.skipped_total.inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures_total.inc();
    }

    pub fn record_transform(&self, elapsed: Duration) {
        self.transform_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn record_fallback(&self, reason: &str) {
        self.transform_fallbacks_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.set(i64::from(subscribed));
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded_total.get()
    }

    pub fn received(&self) -> u64 {
        self.received_total.get()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_total.get()
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures_total.get()
    }

    pub fn fallbacks(&self, reason: &str) -> u64 {
        self.transform_fallbacks_total
            .with_label_values(&[reason])
            .get()
    }
}

/// Per-source counters for broadcaster and publisher processes.
#[derive(Clone)]
pub struct EmitterMetrics {
    published_total: IntCounterVec,
    failures_total: IntCounterVec,
    active_sources: IntGauge,
}

impl EmitterMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let published_total = IntCounterVec::new(
            Opts::new(
                "relay_emitter_published_total",
                "Messages published by each source",
            ),
            &["source"],
        )?;
        registry.register(Box::new(published_total.clone()))?;

        let failures_total = IntCounterVec::new(
            Opts::new(
                "relay_emitter_publish_failures_total",
                "Publish attempts rejected per source",
            ),
            &["source"],
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        let active_sources = IntGauge::with_opts(Opts::new(
            "relay_emitter_active_sources",
            "Sources currently running a publish loop",
        ))?;
        registry.register(Box::new(active_sources.clone()))?;

        Ok(Self {
            published_total,
            failures_total,
            active_sources,
        })
    }

    pub fn record_published(&self, source: &str) {
        self.published_total.with_label_values(&[source]).inc();
    }

    pub fn record_failure(&self, source: &str) {
        self.failures_total.with_label_values(&[source]).inc();
    }

    pub fn source_started(&self) {
        self.active_sources.inc();
    }

    pub fn source_stopped(&self) {
        self.active_sources.dec();
    }

    pub fn published(&self, source: &str) -> u64 {
        self.published_total.with_label_values(&[source]).get()
    }

    pub fn failures(&self, source: &str) -> u64 {
        self.failures_total.with_label_values(&[source]).get()
    }

    pub fn active_sources(&self) -> i64 {
        self.active_sources.get()
    }
}

/// Request counters for the transformer HTTP service.
#[derive(Clone)]
pub struct TransformerMetrics {
    requests_total: IntCounterVec,
}

impl TransformerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "relay_transformer_requests_total",
                "Requests served by the transformer, per endpoint",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;
        Ok(Self { requests_total })
    }

    pub fn record_request(&self, endpoint: &str) {
        self.requests_total.with_label_values(&[endpoint]).inc();
    }

    pub fn requests(&self, endpoint: &str) -> u64 {
        self.requests_total.with_label_values(&[endpoint]).get()
    }
}

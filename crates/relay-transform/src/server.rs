//! ---
//! relay_section: "05-networking-external-interfaces"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Transform client and transformer HTTP service."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_metrics::{metrics_handler, SharedRegistry, TransformerMetrics};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{payload_text, TransformBody};

/// Prefix the reference transformer adds to every payload.
pub const PROCESSED_PREFIX: &str = "PROCESSED: ";

struct TransformerState {
    metrics: Option<TransformerMetrics>,
    registry: Option<SharedRegistry>,
}

/// Builder used to configure and spawn the transformer HTTP service.
#[derive(Clone)]
pub struct TransformerServer {
    listen: SocketAddr,
    registry: Option<SharedRegistry>,
}

impl TransformerServer {
    /// Serve on `listen`; port 0 picks a free port.
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            registry: None,
        }
    }

    /// Count requests into `registry` and expose it at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind the listener and start serving in the background.
    pub async fn spawn(self) -> anyhow::Result<TransformerHandle> {
        let metrics = match &self.registry {
            Some(registry) => Some(TransformerMetrics::new(registry)?),
            None => None,
        };
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "transformer listening");

        let state = TransformerState {
            metrics,
            registry: self.registry,
        };
        let router = Router::new()
            .route("/health", get(get_health))
            .route("/transform", post(post_transform))
            .route("/metrics", get(get_metrics))
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "transformer server exited with error");
            }
        });

        Ok(TransformerHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Running transformer; dropping it leaves the server running until the runtime stops.
pub struct TransformerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl TransformerHandle {
    /// Retrieve the socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// URL of the `/transform` endpoint on this server.
    pub fn transform_url(&self) -> String {
        format!("http://{}/transform", self.address)
    }

    /// Request graceful shutdown and wait for in-flight requests to drain.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

impl TransformerState {
    fn record(&self, endpoint: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request(endpoint);
        }
    }
}

async fn get_health(State(state): State<Arc<TransformerState>>) -> Json<serde_json::Value> {
    state.record("health");
    Json(json!({ "status": "ok" }))
}

async fn post_transform(
    State(state): State<Arc<TransformerState>>,
    Json(request): Json<TransformBody>,
) -> Json<TransformBody> {
    state.record("transform");
    let message = format!("{PROCESSED_PREFIX}{}", payload_text(&request.payload));
    debug!(length = message.len(), "payload processed");
    Json(TransformBody {
        payload: serde_json::Value::String(message),
    })
}

async fn get_metrics(State(state): State<Arc<TransformerState>>) -> Response {
    let Some(registry) = &state.registry else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };
    metrics_handler(registry.clone()).await.into_response()
}

//! `HeraldServer`: the axum HTTP surface.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use herald_settings::ServerSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::delivery::DeliveryService;
use crate::health::{self, HealthResponse};
use crate::sse::events_handler;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The process's delivery strategy.
    pub delivery: Arc<dyn DeliveryService>,
    /// When the server started.
    pub start_time: Instant,
    /// Open streams allowed before `/events` answers 503.
    pub max_connections: usize,
    /// Prometheus render handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Cancelled when the process shuts down; ends open streams.
    pub shutdown: CancellationToken,
}

/// The Herald HTTP server.
pub struct HeraldServer {
    settings: ServerSettings,
    delivery: Arc<dyn DeliveryService>,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl HeraldServer {
    /// Create a server over `delivery`.
    pub fn new(
        settings: ServerSettings,
        delivery: Arc<dyn DeliveryService>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            delivery,
            metrics: None,
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            delivery: Arc::clone(&self.delivery),
            start_time: self.start_time,
            max_connections: self.settings.max_connections,
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        };

        Router::new()
            .route("/events", get(events_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve on `listener` until the shutdown token fires, then drain.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, strategy = ?self.delivery.strategy(), "herald listening");
        let token = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        info!("http listener stopped");
        Ok(())
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// The delivery strategy handlers use.
    pub fn delivery(&self) -> &Arc<dyn DeliveryService> {
        &self.delivery
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.delivery.registry();
    Json(health::health_check(
        state.start_time,
        registry.connection_count(),
        registry.receiver_count(),
        state.delivery.strategy(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

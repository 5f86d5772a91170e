//! HTTP endpoints for Prometheus scraping and kubelet health checks.

use crate::error::ControllerError;
use crate::metrics::PrometheusMetrics;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serves `/metrics`, `/healthz` and `/readyz` until the listener fails.
pub async fn serve(addr: SocketAddr, metrics: Arc<PrometheusMetrics>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics and health endpoints on {}", addr);
    axum::serve(listener, router(metrics)).await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&metrics.registry().gather(), &mut buffer) {
        Ok(()) => ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

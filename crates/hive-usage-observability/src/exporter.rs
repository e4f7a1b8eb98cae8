//! `/metrics` endpoint in the Prometheus text format.
//!
//! The default router serves the global [`REGISTRY`]. Tests and embedders
//! with their own registry use [`registry_router`].

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};

use crate::metrics::REGISTRY;

/// Render every metric family in `registry`.
pub fn encode_registry(registry: &Registry) -> prometheus::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn registry_handler(State(registry): State<Registry>) -> Response {
    match encode_registry(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode usage metrics: {}", e),
        )
            .into_response(),
    }
}

/// Handler serving the global registry.
pub async fn metrics_handler() -> Response {
    registry_handler(State(REGISTRY.clone())).await
}

/// `/metrics` router over an explicit registry.
pub fn registry_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(registry_handler))
        .with_state(registry)
}

/// `/metrics` router over the global registry.
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

//! Hive Usage Server
//!
//! HTTP front for the usage pipeline.
//!
//! ## Endpoints
//!
//! - `POST /usage`: submit a report; `202` when accepted, `503` while the
//!   pipeline is not ready
//! - `GET /_health`: liveness, always `200` with the current status
//! - `GET /_readiness`: `200` when ready, `503` otherwise
//! - `GET /metrics`: Prometheus exposition

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hive_usage::{HealthStatus, RawReport, UsageError, UsageService};
use serde::Serialize;
use tracing::error;

pub mod shutdown;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: UsageService,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: HealthStatus,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/usage", post(collect))
        .route("/_health", get(health))
        .route("/_readiness", get(readiness))
        .with_state(state)
        .merge(hive_usage_observability::exporter::create_metrics_router())
}

async fn collect(State(state): State<AppState>, Json(report): Json<RawReport>) -> Response {
    match state.service.collect(report) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(UsageError::NotReady) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: UsageError::NotReady.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Unexpected collect error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        status: state.service.status(),
    })
}

async fn readiness(State(state): State<AppState>) -> Response {
    let body = Json(StatusBody {
        status: state.service.status(),
    });
    if state.service.readiness() {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

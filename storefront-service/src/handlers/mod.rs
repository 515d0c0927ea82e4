//! HTTP handlers for storefront-service.

pub mod admin;
pub mod checkout;
pub mod orders;
pub mod plans;
pub mod providers;
pub mod webhook;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use service_core::middleware::metrics::render_metrics;

use crate::startup::AppState;

/// Liveness probe.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "storefront-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness probe: the store must answer. Mail delivery is reported but
/// does not gate readiness, since a failed email never fails an order.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let email = if !state.email.is_enabled() {
        "disabled"
    } else {
        match state.email.health_check().await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::warn!(error = %e, "Email transport health check failed");
                "degraded"
            }
        }
    };

    match state.repo.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "email": email })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "email": email })),
            )
        }
    }
}

pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        render_metrics(),
    )
}

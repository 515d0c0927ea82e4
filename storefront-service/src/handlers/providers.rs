use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use service_core::error::AppError;

use crate::dtos::ProbeQuery;
use crate::startup::AppState;

/// `GET /api/providers/health`. `?probe=true` calls every enabled provider.
pub async fn provider_health(
    State(state): State<AppState>,
    Query(params): Query<ProbeQuery>,
) -> Json<serde_json::Value> {
    let status = state.providers.health_status();
    if !params.probe {
        return Json(json!({ "success": true, "health": status }));
    }

    let probes = state.providers.probe_health().await;
    let healthy = status.healthy && probes.iter().any(|p| p.healthy);
    Json(json!({
        "success": true,
        "health": status,
        "healthy": healthy,
        "probes": probes,
    }))
}

/// `GET /api/providers/availability/:plan_id`
pub async fn availability(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let availability = state.providers.check_availability(&plan_id).await?;
    Ok(Json(json!({ "success": true, "availability": availability })))
}

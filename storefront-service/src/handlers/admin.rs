//! Operator endpoints. Every handler takes [`AdminAuth`].

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use service_core::error::AppError;

use crate::dtos::{AdminOrdersQuery, InvalidateCacheRequest, OrderResponse, RetryProvisioningQuery};
use crate::middleware::AdminAuth;
use crate::services::{FulfillmentOutcome, OrderFilter};
use crate::startup::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// `GET /api/admin/orders`
pub async fn list_orders(
    _admin: AdminAuth,
    State(state): State<AppState>,
    Query(params): Query<AdminOrdersQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = OrderFilter {
        status: params.status,
        fulfillment: params.fulfillment,
        limit: params
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: params.offset.unwrap_or(0),
    };

    let orders: Vec<OrderResponse> = state
        .orchestrator
        .list_orders(&filter)
        .await?
        .into_iter()
        .map(OrderResponse::from)
        .collect();

    Ok(Json(json!({
        "success": true,
        "count": orders.len(),
        "limit": filter.limit,
        "offset": filter.offset,
        "orders": orders,
    })))
}

/// `POST /api/admin/orders/:order_id/retry-provisioning?force`
pub async fn retry_provisioning(
    _admin: AdminAuth,
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Query(params): Query<RetryProvisioningQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!(order_id = %order_id, force = params.force, "Admin requested provisioning retry");

    let outcome = state
        .orchestrator
        .retry_provisioning(&order_id, params.force)
        .await?;
    let label = outcome.as_str();

    let body = match outcome {
        FulfillmentOutcome::Provisioned { order, esims }
        | FulfillmentOutcome::AlreadyProcessed { order, esims } => json!({
            "success": true,
            "outcome": label,
            "order": OrderResponse::new(order, esims),
        }),
        FulfillmentOutcome::Failed { order, reason } => json!({
            "success": false,
            "outcome": label,
            "error": reason,
            "order": OrderResponse::from(order),
        }),
    };

    Ok(Json(body))
}

/// `POST /api/admin/plans/sync`
pub async fn sync_plans(
    _admin: AdminAuth,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (stored, listing) = state.orchestrator.sync_plans().await?;
    Ok(Json(json!({
        "success": true,
        "stored": stored,
        "failed_providers": listing.failed_providers,
    })))
}

/// `POST /api/admin/cache/invalidate`
pub async fn invalidate_cache(
    _admin: AdminAuth,
    State(state): State<AppState>,
    payload: Option<Json<InvalidateCacheRequest>>,
) -> Json<serde_json::Value> {
    let provider_id = payload.and_then(|Json(body)| body.provider_id);
    let removed = state.providers.invalidate_cache(provider_id.as_deref());
    Json(json!({
        "success": true,
        "removed": removed,
        "provider_id": provider_id,
    }))
}

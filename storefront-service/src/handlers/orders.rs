use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use service_core::error::AppError;

use crate::dtos::{OrderLookupQuery, OrderResponse};
use crate::startup::AppState;

/// `GET /api/orders/:order_id?email=`
///
/// Guest orders are looked up by id plus the purchasing email. A wrong
/// email answers 404 so order ids cannot be probed.
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Query(params): Query<OrderLookupQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let email = params
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("email is required")))?;

    let (order, esims) = state
        .orchestrator
        .get_order_for_customer(&order_id, email)
        .await?;

    Ok(Json(json!({
        "success": true,
        "order": OrderResponse::new(order, esims),
    })))
}

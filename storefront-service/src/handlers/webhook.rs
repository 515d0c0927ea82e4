use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use service_core::error::AppError;

use crate::dtos::WebhookResponse;
use crate::services::stripe::SIGNATURE_HEADER;
use crate::startup::AppState;

/// `POST /api/stripe-webhook`
///
/// The raw body is verified before parsing. Any non-2xx answer makes Stripe
/// redeliver, so only signature and payload problems are client errors.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook received without signature header");
            AppError::Unauthorized(anyhow::anyhow!("Missing {} header", SIGNATURE_HEADER))
        })?;

    let outcome = state.orchestrator.handle_webhook(&body, signature).await?;

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            received: true,
            outcome: outcome.as_str(),
        }),
    ))
}

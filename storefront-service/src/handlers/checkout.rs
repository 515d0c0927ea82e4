//! Checkout: PaymentIntent creation and client-driven confirmation.

use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{
    CheckoutRequest, CheckoutResponse, OrderResponse, PurchaseConfirmRequest, PurchaseResponse,
};
use crate::services::FulfillmentOutcome;
use crate::startup::AppState;

/// `POST /api/checkout/payment-intent`
pub async fn create_payment_intent(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    tracing::info!(
        plan_id = %payload.plan_id,
        quantity = payload.quantity,
        "Creating checkout"
    );

    let session = state.orchestrator.create_checkout(&payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            success: true,
            client_secret: session.client_secret,
            payment_intent_id: session.payment_intent_id,
            order_id: session.order_id,
            amount: session.amount,
            currency: session.currency,
            publishable_key: state.stripe.publishable_key().to_string(),
        }),
    ))
}

/// `POST /api/purchase`
///
/// Called by the storefront after Stripe.js reports success. The intent is
/// re-read from Stripe; the request body is never trusted for payment state.
pub async fn purchase(
    State(state): State<AppState>,
    Json(payload): Json<PurchaseConfirmRequest>,
) -> Result<(StatusCode, Json<PurchaseResponse>), AppError> {
    payload.validate()?;

    let outcome = state
        .orchestrator
        .confirm_client_payment(payload.payment_intent_id.trim())
        .await?;

    let label = outcome.as_str();
    let response = match outcome {
        FulfillmentOutcome::Provisioned { order, esims }
        | FulfillmentOutcome::AlreadyProcessed { order, esims } => (
            StatusCode::OK,
            Json(PurchaseResponse {
                success: true,
                outcome: label,
                order: OrderResponse::new(order, esims),
                error: None,
            }),
        ),
        FulfillmentOutcome::Failed { order, reason } => (
            StatusCode::BAD_GATEWAY,
            Json(PurchaseResponse {
                success: false,
                outcome: label,
                order: OrderResponse::from(order),
                error: Some(reason),
            }),
        ),
    };

    Ok(response)
}

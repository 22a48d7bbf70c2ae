//! Stripe webhook endpoint
//!
//! Response contract: 400 only for missing/invalid signatures, 500 only
//! for failures before event processing begins. A handler failure is
//! acknowledged with HTTP 200 and `success: false` in the body — Stripe
//! retries on non-2xx, and replaying an event whose handler is failing
//! deterministically would only amplify the failure. The
//! `stripe_webhook_events` audit table is what surfaces those failures.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// POST /api/stripe/webhook
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = match headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => {
            tracing::warn!("Stripe webhook missing signature header");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Missing Stripe signature" })),
            )
                .into_response();
        }
    };

    let event = match state.billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Stripe webhook signature verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid signature" })),
            )
                .into_response();
        }
    };

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    match state.billing.webhooks.handle_event(event).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Webhook event processing failed");
            (
                StatusCode::OK,
                Json(json!({
                    "success": false,
                    "error": e.to_string(),
                    "handled": false,
                })),
            )
                .into_response()
        }
    }
}

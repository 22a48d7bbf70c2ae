//! HTTP routes

pub mod health;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/stripe/webhook", post(webhooks::stripe_webhook))
        .with_state(state)
}

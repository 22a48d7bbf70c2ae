//! Health check endpoint

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Health check database probe failed");
            ApiError::ServiceUnavailable
        })?;

    Ok(Json(json!({ "status": "ok", "database": "ok" })))
}

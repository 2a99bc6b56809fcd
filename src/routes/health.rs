use axum::{extract::State, http::StatusCode, response::Json};
use diesel::connection::SimpleConnection;
use serde_json::json;

use crate::state::AppState;

/// Liveness plus a trivial round-trip to the database.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let database = state
        .blocking(|conn| {
            conn.batch_execute("SELECT 1")
                .map_err(crate::error::AppError::from)
        })
        .await;

    match database {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unavailable" })),
        ),
    }
}

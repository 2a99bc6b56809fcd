use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::AuditLog;
use crate::records::audit::{self, AuditLogFilter};
use crate::state::AppState;

pub async fn list_audit_logs(
    State(state): State<AppState>,
    Query(filter): Query<AuditLogFilter>,
) -> AppResult<Json<Vec<AuditLog>>> {
    let mut conn = state.db()?;
    Ok(Json(audit::list_audit_logs(&mut conn, &filter)?))
}

pub async fn get_audit_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<AuditLog>> {
    let mut conn = state.db()?;
    Ok(Json(audit::get_audit_log(&mut conn, id)?))
}

// The trail is written only as a side effect of audited mutations.

pub async fn create_audit_log(user: AuthenticatedUser) -> AppResult<(StatusCode, Json<AuditLog>)> {
    tracing::warn!(user_id = %user.user_id, "attempt to write an audit entry directly");
    let log = audit::create_audit_log(&user.actor())?;
    Ok((StatusCode::CREATED, Json(log)))
}

pub async fn update_audit_log(
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<AuditLog>> {
    tracing::warn!(user_id = %user.user_id, audit_id = %id, "attempt to modify an audit entry");
    Ok(Json(audit::update_audit_log(&user.actor(), id)?))
}

pub async fn delete_audit_log(
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    tracing::warn!(user_id = %user.user_id, audit_id = %id, "attempt to delete an audit entry");
    audit::delete_audit_log(&user.actor(), id)?;
    Ok(StatusCode::NO_CONTENT)
}

use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    auth::{password, AuthenticatedUser},
    error::{AppError, AppResult},
    models::User,
    records::Role,
    schema::users::dsl,
    state::AppState,
};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let mut conn = state.db()?;

    let user: Option<User> = dsl::users
        .filter(dsl::username.eq(payload.username.trim()))
        .first(&mut conn)
        .optional()?;
    let Some(user) = user else {
        tracing::info!(username = %payload.username, "login rejected: unknown user");
        return Err(AppError::unauthorized());
    };

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        tracing::info!(user_id = %user.id, "login rejected: wrong password");
        return Err(AppError::unauthorized());
    }

    let role = Role::parse_or_viewer(&user.role);
    let access_token = state
        .jwt
        .generate_token(user.id, &user.username, role)
        .map_err(AppError::from)?;

    tracing::info!(user_id = %user.id, role = %role, "user logged in");
    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt.expires_in_seconds(),
    }))
}

pub async fn me(user: AuthenticatedUser) -> Json<AuthenticatedUser> {
    Json(user)
}

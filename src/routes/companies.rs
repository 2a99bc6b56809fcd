use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::Company;
use crate::records::companies;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CompanyListQuery {
    pub search: Option<String>,
}

#[derive(Deserialize)]
pub struct CompanyPayload {
    pub name: String,
}

#[derive(Serialize)]
pub struct CompanyResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_count: Option<i64>,
}

impl From<Company> for CompanyResponse {
    fn from(company: Company) -> Self {
        Self {
            id: company.id,
            name: company.name,
            created_at: company.created_at,
            project_count: None,
        }
    }
}

pub async fn list_companies(
    State(state): State<AppState>,
    Query(query): Query<CompanyListQuery>,
) -> AppResult<Json<Vec<CompanyResponse>>> {
    let mut conn = state.db()?;
    let rows = companies::list_companies(&mut conn, query.search.as_deref())?;
    Ok(Json(rows.into_iter().map(CompanyResponse::from).collect()))
}

pub async fn get_company(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
) -> AppResult<Json<CompanyResponse>> {
    let mut conn = state.db()?;
    let company = companies::get_company(&mut conn, company_id)?;
    let project_count = companies::project_count(&mut conn, company_id)?;
    Ok(Json(CompanyResponse {
        project_count: Some(project_count),
        ..company.into()
    }))
}

pub async fn create_company(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CompanyPayload>,
) -> AppResult<(StatusCode, Json<CompanyResponse>)> {
    let mut conn = state.db()?;
    let company = companies::create_company(&mut conn, &user.actor(), &payload.name)?;
    Ok((StatusCode::CREATED, Json(company.into())))
}

pub async fn update_company(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(company_id): Path<Uuid>,
    Json(payload): Json<CompanyPayload>,
) -> AppResult<Json<CompanyResponse>> {
    let mut conn = state.db()?;
    let company =
        companies::update_company(&mut conn, &user.actor(), company_id, &payload.name)?;
    Ok(Json(company.into()))
}

pub async fn delete_company(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(company_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    companies::delete_company(&mut conn, &user.actor(), company_id)?;
    Ok(StatusCode::NO_CONTENT)
}

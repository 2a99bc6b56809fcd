use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{Project, ProjectMember};
use crate::records::projects::{self, CreateProject, ProjectChanges, ProjectFilter};
use crate::records::status::ProjectStatus;
use crate::state::AppState;
use crate::utils::json::{classify_nullable, optional_string, reject_fields, NullableValue};

const READ_ONLY_PROJECT_FIELDS: &[&str] = &["id", "code", "company_id", "created_at", "updated_at"];

#[derive(Deserialize)]
pub struct ProjectListQuery {
    pub company_id: Option<Uuid>,
    pub status: Option<String>,
    pub search: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateProjectPayload {
    pub company_id: Uuid,
    pub code: String,
    pub name: String,
    pub status: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct AddMemberPayload {
    pub user_id: Uuid,
}

fn parse_status(value: Option<&str>) -> AppResult<Option<ProjectStatus>> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ProjectStatus>().map_err(AppError::from))
        .transpose()
}

fn parse_date(field: &str, value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::bad_request(format!("{field} must be a date in YYYY-MM-DD format")))
}

pub async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ProjectListQuery>,
) -> AppResult<Json<Vec<Project>>> {
    let filter = ProjectFilter {
        company_id: query.company_id,
        status: parse_status(query.status.as_deref())?,
        search: query.search,
    };
    let mut conn = state.db()?;
    Ok(Json(projects::list_projects(&mut conn, &filter)?))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<Project>> {
    let mut conn = state.db()?;
    Ok(Json(projects::get_project(&mut conn, project_id)?))
}

pub async fn create_project(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateProjectPayload>,
) -> AppResult<(StatusCode, Json<Project>)> {
    let input = CreateProject {
        company_id: payload.company_id,
        code: payload.code,
        name: payload.name,
        status: parse_status(payload.status.as_deref())?,
        start_date: payload.start_date,
        end_date: payload.end_date,
    };
    let mut conn = state.db()?;
    let project = projects::create_project(&mut conn, &user.actor(), input)?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn update_project(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(project_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<Project>> {
    reject_fields(&body, READ_ONLY_PROJECT_FIELDS).map_err(AppError::bad_request)?;

    let status = optional_string(&body, "status").map_err(AppError::bad_request)?;
    let start_date = optional_string(&body, "start_date")
        .map_err(AppError::bad_request)?
        .map(|value| parse_date("start_date", &value))
        .transpose()?;
    let end_date = match classify_nullable(body.get("end_date"))
        .map_err(|err| AppError::bad_request(format!("end_date: {err}")))?
    {
        NullableValue::Omitted => None,
        NullableValue::Null => Some(None),
        NullableValue::String(value) => Some(Some(parse_date("end_date", &value)?)),
    };

    let changes = ProjectChanges {
        name: optional_string(&body, "name").map_err(AppError::bad_request)?,
        status: parse_status(status.as_deref())?,
        start_date,
        end_date,
    };

    let mut conn = state.db()?;
    let project = projects::update_project(&mut conn, &user.actor(), project_id, changes)?;
    Ok(Json(project))
}

pub async fn list_members(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<Vec<ProjectMember>>> {
    let mut conn = state.db()?;
    projects::get_project(&mut conn, project_id)?;
    Ok(Json(projects::list_members(&mut conn, project_id)?))
}

pub async fn add_member(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<AddMemberPayload>,
) -> AppResult<(StatusCode, Json<ProjectMember>)> {
    let mut conn = state.db()?;
    let member = projects::add_member(&mut conn, &user.actor(), project_id, payload.user_id)?;
    tracing::info!(project_id = %project_id, user_id = %payload.user_id, "project member added");
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn remove_member(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((project_id, member_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    projects::remove_member(&mut conn, &user.actor(), project_id, member_id)?;
    tracing::info!(project_id = %project_id, user_id = %member_id, "project member removed");
    Ok(StatusCode::NO_CONTENT)
}

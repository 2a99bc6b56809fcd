use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{AuditLog, Document, DocumentVersion};
use crate::records::audit;
use crate::records::documents::{
    self, CreateDocument, DocumentChanges, DocumentFilter, DocumentRecord,
};
use crate::records::status::DocumentStatus;
use crate::state::AppState;
use crate::utils::json::{optional_string, reject_fields};

/// Authorship and identity are assigned by the server.
const SERVER_ASSIGNED_FIELDS: &[&str] = &["id", "created_by", "created_at", "updated_at", "status"];
const READ_ONLY_ON_UPDATE: &[&str] = &[
    "id",
    "created_by",
    "created_at",
    "updated_at",
    "document_number",
    "project_id",
];

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub company_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub discipline: Option<String>,
    pub doc_type: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
}

#[derive(Deserialize)]
struct CreateDocumentPayload {
    project_id: Uuid,
    document_number: String,
    title: String,
    discipline: String,
    doc_type: String,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    #[serde(flatten)]
    pub document: Document,
    pub current_version: Option<DocumentVersion>,
    pub version_count: i64,
}

impl From<DocumentRecord> for DocumentResponse {
    fn from(record: DocumentRecord) -> Self {
        Self {
            document: record.document,
            current_version: record.current_version,
            version_count: record.version_count,
        }
    }
}

fn parse_status(value: Option<&str>) -> AppResult<Option<DocumentStatus>> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<DocumentStatus>().map_err(AppError::from))
        .transpose()
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<DocumentListQuery>,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let filter = DocumentFilter {
        company_id: query.company_id,
        project_id: query.project_id,
        discipline: query.discipline,
        doc_type: query.doc_type,
        status: parse_status(query.status.as_deref())?,
        search: query.search,
    };
    let mut conn = state.db()?;
    let rows = documents::list_documents(&mut conn, &filter)?;
    Ok(Json(rows.into_iter().map(DocumentResponse::from).collect()))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let mut conn = state.db()?;
    Ok(Json(documents::get_document(&mut conn, document_id)?.into()))
}

pub async fn create_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    reject_fields(&body, SERVER_ASSIGNED_FIELDS).map_err(AppError::bad_request)?;
    let payload: CreateDocumentPayload = serde_json::from_value(body)?;

    let input = CreateDocument {
        project_id: payload.project_id,
        document_number: payload.document_number,
        title: payload.title,
        discipline: payload.discipline,
        doc_type: payload.doc_type,
    };
    let mut conn = state.db()?;
    let document = documents::create_document(&mut conn, &user.actor(), input)?;
    let record = documents::get_document(&mut conn, document.id)?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

pub async fn update_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<DocumentResponse>> {
    reject_fields(&body, READ_ONLY_ON_UPDATE).map_err(AppError::bad_request)?;

    let status = optional_string(&body, "status").map_err(AppError::bad_request)?;
    let changes = DocumentChanges {
        title: optional_string(&body, "title").map_err(AppError::bad_request)?,
        discipline: optional_string(&body, "discipline").map_err(AppError::bad_request)?,
        doc_type: optional_string(&body, "doc_type").map_err(AppError::bad_request)?,
        status: parse_status(status.as_deref())?,
    };

    let mut conn = state.db()?;
    documents::update_document(&mut conn, &user.actor(), document_id, changes)?;
    Ok(Json(documents::get_document(&mut conn, document_id)?.into()))
}

/// Audit entries of the document and all of its versions, oldest first.
pub async fn document_history(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<Vec<AuditLog>>> {
    let mut conn = state.db()?;
    documents::get_document(&mut conn, document_id)?;
    Ok(Json(audit::document_history(&mut conn, document_id)?))
}

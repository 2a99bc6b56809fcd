use std::time::Duration;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::DocumentVersion;
use crate::records::versions::{self, VersionContent, VersionFilter};
use crate::state::AppState;
use crate::storage::{
    content_checksum, inline_content_disposition, resolve_content_type, version_object_key,
};

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;
/// Multipart fields a client may not set on a new version.
const SERVER_ASSIGNED_FIELDS: &[&str] = &[
    "version_number",
    "uploaded_by",
    "uploaded_at",
    "checksum",
    "size_bytes",
    "s3_key",
];

#[derive(Deserialize)]
pub struct VersionListQuery {
    pub project_id: Option<Uuid>,
    pub search: Option<String>,
}

#[derive(Serialize)]
pub struct VersionListEntry {
    #[serde(flatten)]
    pub version: DocumentVersion,
    pub document_number: String,
}

#[derive(Serialize)]
pub struct VersionDownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
}

struct UploadedFile {
    bytes: Vec<u8>,
    original_name: String,
    content_type: Option<String>,
}

async fn read_upload(mut multipart: Multipart, max_bytes: usize) -> AppResult<UploadedFile> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                original_name = field.file_name().map(|n| n.to_string());
                content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some(field_name) if SERVER_ASSIGNED_FIELDS.contains(&field_name) => {
                return Err(AppError::bad_request(format!(
                    "{field_name} is assigned by the server and cannot be supplied"
                )));
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    if bytes.len() > max_bytes {
        return Err(AppError::payload_too_large(max_bytes));
    }
    let original_name = original_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::bad_request("filename is required"))?;

    Ok(UploadedFile {
        content_type: resolve_content_type(content_type.as_deref(), &original_name),
        bytes,
        original_name,
    })
}

/// Stores the bytes, then appends the version record. The object is
/// removed again when the record cannot be written.
pub async fn upload_version(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentVersion>)> {
    let upload = read_upload(multipart, state.config.max_upload_bytes).await?;
    let actor = user.actor();

    {
        let actor = actor.clone();
        state
            .blocking(move |conn| {
                versions::ensure_appendable(conn, &actor, document_id).map_err(AppError::from)
            })
            .await?;
    }

    let version_id = Uuid::new_v4();
    let content = VersionContent {
        id: version_id,
        s3_key: version_object_key(document_id, version_id),
        checksum: content_checksum(&upload.bytes),
        size_bytes: upload.bytes.len() as i64,
        content_type: upload.content_type.clone(),
        original_name: upload.original_name.clone(),
    };

    state
        .storage
        .put_object(
            &content.s3_key,
            upload.bytes,
            upload.content_type,
            inline_content_disposition(&upload.original_name),
        )
        .await
        .map_err(|err| {
            error!(error = %err, key = %content.s3_key, "failed to store version content");
            AppError::internal(format!("failed to store version content: {err}"))
        })?;

    let policy = state.version_retry_policy();
    let result = {
        let content = content.clone();
        state
            .blocking(move |conn| {
                versions::create_version_with_retry(conn, &actor, document_id, &content, policy)
                    .map_err(AppError::from)
            })
            .await
    };

    match result {
        Ok(version) => {
            info!(
                document_id = %document_id,
                version_number = version.version_number,
                size_bytes = version.size_bytes,
                "version upload succeeded"
            );
            Ok((StatusCode::CREATED, Json(version)))
        }
        Err(err) => {
            if let Err(cleanup) = state.storage.delete_object(&content.s3_key).await {
                warn!(
                    error = %cleanup,
                    key = %content.s3_key,
                    "failed to remove content of rejected version"
                );
            }
            Err(err)
        }
    }
}

pub async fn list_document_versions(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<Vec<DocumentVersion>>> {
    let mut conn = state.db()?;
    Ok(Json(versions::list_versions(&mut conn, document_id)?))
}

pub async fn list_versions(
    State(state): State<AppState>,
    Query(query): Query<VersionListQuery>,
) -> AppResult<Json<Vec<VersionListEntry>>> {
    let filter = VersionFilter {
        project_id: query.project_id,
        search: query.search,
    };
    let mut conn = state.db()?;
    let rows = versions::list_all_versions(&mut conn, &filter)?;
    Ok(Json(
        rows.into_iter()
            .map(|(version, document_number)| VersionListEntry {
                version,
                document_number,
            })
            .collect(),
    ))
}

pub async fn get_version(
    State(state): State<AppState>,
    Path(version_id): Path<Uuid>,
) -> AppResult<Json<DocumentVersion>> {
    let mut conn = state.db()?;
    Ok(Json(versions::get_version(&mut conn, version_id)?))
}

pub async fn update_version(
    user: AuthenticatedUser,
    Path(version_id): Path<Uuid>,
) -> AppResult<Json<DocumentVersion>> {
    warn!(user_id = %user.user_id, version_id = %version_id, "attempt to modify a version");
    Ok(Json(versions::update_version(&user.actor(), version_id)?))
}

pub async fn delete_version(
    user: AuthenticatedUser,
    Path(version_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    warn!(user_id = %user.user_id, version_id = %version_id, "attempt to delete a version");
    versions::delete_version(&user.actor(), version_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn download_version(
    State(state): State<AppState>,
    Path(version_id): Path<Uuid>,
) -> AppResult<Json<VersionDownloadResponse>> {
    let version = {
        let mut conn = state.db()?;
        versions::get_version(&mut conn, version_id)?
    };

    let url = state
        .storage
        .presign_get_object(
            &version.s3_key,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Json(VersionDownloadResponse {
        url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
        filename: version.original_name,
        content_type: version.content_type,
        size_bytes: version.size_bytes,
        checksum: version.checksum,
    }))
}

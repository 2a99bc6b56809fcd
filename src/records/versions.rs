//! Version history of a document.
//!
//! Versions are only ever appended through [`create_version`]. The number is
//! assigned here as `max + 1` while the document row is locked; the unique
//! `(document_id, version_number)` constraint and the sequence trigger back
//! that up when two uploads race on a connection that bypassed the lock.
//! A version row is never updated or deleted.

use std::thread;
use std::time::Duration;

use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use super::audit::{audited, AuditEntry, EntityType};
use super::policy::{authorize, Capability};
use super::status::DocumentStatus;
use super::{search_pattern, Actor, RecordError, RecordResult};
use crate::models::{Document, DocumentVersion, NewDocumentVersion};
use crate::schema::{document_versions, documents};

/// Where the bytes of a version live and what they are.
#[derive(Debug, Clone, Serialize)]
pub struct VersionContent {
    pub id: Uuid,
    pub s3_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Linear backoff: attempt 1 waits one base delay, attempt 2 two, and so on.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

#[derive(Debug, Clone, Default)]
pub struct VersionFilter {
    pub project_id: Option<Uuid>,
    pub search: Option<String>,
}

/// Checks that `actor` may append a version to the document right now.
/// Lets callers reject an upload before storing any bytes.
pub fn ensure_appendable(
    conn: &mut PgConnection,
    actor: &Actor,
    document_id: Uuid,
) -> RecordResult<Document> {
    let document: Document = documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or(RecordError::NotFound("document"))?;
    check_appendable(conn, actor, &document)?;
    Ok(document)
}

fn check_appendable(conn: &mut PgConnection, actor: &Actor, document: &Document) -> RecordResult<()> {
    authorize(conn, actor, Capability::UploadVersions(document.project_id))?;
    let status: DocumentStatus = document.status.parse()?;
    if !status.accepts_new_versions() {
        return Err(RecordError::validation(format!(
            "document is {status}; new versions can only be added to draft or in-review documents"
        )));
    }
    Ok(())
}

/// Appends a new version and its audit row in one transaction.
pub fn create_version(
    conn: &mut PgConnection,
    actor: &Actor,
    document_id: Uuid,
    content: &VersionContent,
) -> RecordResult<DocumentVersion> {
    let version = audited(conn, actor, |conn| {
        let document: Document = documents::table
            .find(document_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(RecordError::NotFound("document"))?;
        check_appendable(conn, actor, &document)?;

        let latest: Option<DocumentVersion> = document_versions::table
            .filter(document_versions::document_id.eq(document_id))
            .order(document_versions::version_number.desc())
            .first(conn)
            .optional()?;
        if let Some(latest) = latest.as_ref() {
            if latest.checksum == content.checksum {
                return Err(RecordError::validation(format!(
                    "upload is identical to version {}",
                    latest.version_number
                )));
            }
        }
        let version_number = latest.map(|v| v.version_number).unwrap_or(0) + 1;

        let version: DocumentVersion = diesel::insert_into(document_versions::table)
            .values(&NewDocumentVersion {
                id: content.id,
                document_id,
                version_number,
                s3_key: content.s3_key.clone(),
                original_name: content.original_name.clone(),
                content_type: content.content_type.clone(),
                size_bytes: content.size_bytes,
                checksum: content.checksum.clone(),
                uploaded_by: actor.user_id,
            })
            .get_result(conn)?;

        let entry = AuditEntry::created(EntityType::DocumentVersion, version.id, &version)?;
        Ok((version, entry))
    })?;

    tracing::info!(
        document_id = %document_id,
        version_id = %version.id,
        version_number = version.version_number,
        uploaded_by = %version.uploaded_by,
        "document version created"
    );
    Ok(version)
}

/// [`create_version`], retried with backoff when it loses a numbering race.
/// Every other error is returned immediately.
pub fn create_version_with_retry(
    conn: &mut PgConnection,
    actor: &Actor,
    document_id: Uuid,
    content: &VersionContent,
    policy: RetryPolicy,
) -> RecordResult<DocumentVersion> {
    retry_conflicts(policy, document_id, |_| create_version(conn, actor, document_id, content))
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached. `operation` receives the attempt number,
/// starting at 1.
pub fn retry_conflicts<T, F>(
    policy: RetryPolicy,
    document_id: Uuid,
    mut operation: F,
) -> RecordResult<T>
where
    F: FnMut(u32) -> RecordResult<T>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    document_id = %document_id,
                    attempt,
                    ?delay,
                    error = %err,
                    "version number conflict, retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) if err.is_retryable() => {
                tracing::error!(
                    document_id = %document_id,
                    attempts = attempt,
                    error = %err,
                    "version number conflict, giving up"
                );
                return Err(err);
            }
            result => return result,
        }
    }
}

pub fn get_version(conn: &mut PgConnection, version_id: Uuid) -> RecordResult<DocumentVersion> {
    document_versions::table
        .find(version_id)
        .first(conn)
        .optional()?
        .ok_or(RecordError::NotFound("document version"))
}

/// Highest-numbered version, if any were uploaded.
pub fn current_version(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> RecordResult<Option<DocumentVersion>> {
    let version = document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .order(document_versions::version_number.desc())
        .first(conn)
        .optional()?;
    Ok(version)
}

/// Newest version first.
pub fn list_versions(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> RecordResult<Vec<DocumentVersion>> {
    let exists: bool = diesel::select(diesel::dsl::exists(documents::table.find(document_id)))
        .get_result(conn)?;
    if !exists {
        return Err(RecordError::NotFound("document"));
    }

    let rows = document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .order(document_versions::version_number.desc())
        .load(conn)?;
    Ok(rows)
}

/// Versions across documents, most recent upload first, paired with the
/// owning document number.
pub fn list_all_versions(
    conn: &mut PgConnection,
    filter: &VersionFilter,
) -> RecordResult<Vec<(DocumentVersion, String)>> {
    let mut query = document_versions::table
        .inner_join(documents::table)
        .select((document_versions::all_columns, documents::document_number))
        .into_boxed();

    if let Some(project_id) = filter.project_id {
        query = query.filter(documents::project_id.eq(project_id));
    }
    if let Some(pattern) = search_pattern(filter.search.as_deref()) {
        query = query.filter(documents::document_number.ilike(pattern));
    }

    let rows = query
        .order((
            document_versions::uploaded_at.desc(),
            document_versions::version_number.desc(),
        ))
        .load(conn)?;
    Ok(rows)
}

/// Versions are never edited, whoever asks.
pub fn update_version(_actor: &Actor, _version_id: Uuid) -> RecordResult<DocumentVersion> {
    Err(RecordError::immutable("document versions cannot be modified"))
}

pub fn delete_version(_actor: &Actor, _version_id: Uuid) -> RecordResult<()> {
    Err(RecordError::immutable("document versions cannot be deleted"))
}

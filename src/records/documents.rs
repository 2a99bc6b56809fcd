use std::collections::HashMap;

use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use super::audit::{audited, AuditEntry, ChangeSet, EntityType};
use super::policy::{authorize, Capability};
use super::status::{DocumentStatus, ProjectStatus};
use super::{required_text, search_pattern, Actor, RecordError, RecordResult};
use crate::models::{Document, DocumentVersion, NewDocument, Project};
use crate::schema::{document_versions, documents, projects};

/// Authorship (`created_by`, `created_at`) is deliberately absent: it is
/// taken from the acting principal and the database clock.
#[derive(Debug, Clone)]
pub struct CreateDocument {
    pub project_id: Uuid,
    pub document_number: String,
    pub title: String,
    pub discipline: String,
    pub doc_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentChanges {
    pub title: Option<String>,
    pub discipline: Option<String>,
    pub doc_type: Option<String>,
    pub status: Option<DocumentStatus>,
}

impl DocumentChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.discipline.is_none()
            && self.doc_type.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub company_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub discipline: Option<String>,
    pub doc_type: Option<String>,
    pub status: Option<DocumentStatus>,
    pub search: Option<String>,
}

/// A document together with its version summary.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub document: Document,
    pub current_version: Option<DocumentVersion>,
    pub version_count: i64,
}

#[derive(AsChangeset)]
#[diesel(table_name = documents)]
struct DocumentChangeset {
    title: String,
    discipline: String,
    doc_type: String,
    status: String,
    updated_at: chrono::NaiveDateTime,
}

pub fn create_document(
    conn: &mut PgConnection,
    actor: &Actor,
    input: CreateDocument,
) -> RecordResult<Document> {
    let document_number = required_text("document_number", &input.document_number)?;
    let title = required_text("title", &input.title)?;
    let discipline = required_text("discipline", &input.discipline)?;
    let doc_type = required_text("doc_type", &input.doc_type)?;

    let document = audited(conn, actor, |conn| {
        // Shared lock: a concurrent close waits for this insert, or this
        // insert sees the closed status.
        let project: Project = projects::table
            .find(input.project_id)
            .for_share()
            .first(conn)
            .optional()?
            .ok_or(RecordError::NotFound("project"))?;
        authorize(conn, actor, Capability::EditDocuments(project.id))?;

        let project_status: ProjectStatus = project.status.parse()?;
        if !project_status.accepts_new_documents() {
            return Err(RecordError::validation(
                "documents cannot be added to a closed project",
            ));
        }

        let document: Document = diesel::insert_into(documents::table)
            .values(&NewDocument {
                id: Uuid::new_v4(),
                project_id: project.id,
                document_number,
                title,
                discipline,
                doc_type,
                status: DocumentStatus::Draft.as_str().to_string(),
                created_by: actor.user_id,
            })
            .get_result(conn)?;
        let entry = AuditEntry::created(EntityType::Document, document.id, &document)?;
        Ok((document, entry))
    })?;

    tracing::info!(
        document_id = %document.id,
        project_id = %document.project_id,
        document_number = %document.document_number,
        created_by = %document.created_by,
        "document created"
    );
    Ok(document)
}

/// Applies allowed field changes. The audit row carries only the fields
/// that actually changed; an update that changes nothing writes nothing.
pub fn update_document(
    conn: &mut PgConnection,
    actor: &Actor,
    document_id: Uuid,
    changes: DocumentChanges,
) -> RecordResult<Document> {
    if changes.is_empty() {
        return Err(RecordError::validation("no changes provided"));
    }

    conn.transaction::<Document, RecordError, _>(|conn| {
        let existing: Document = documents::table
            .find(document_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(RecordError::NotFound("document"))?;
        authorize(conn, actor, Capability::EditDocuments(existing.project_id))?;

        let title = match changes.title.as_deref() {
            Some(value) => required_text("title", value)?,
            None => existing.title.clone(),
        };
        let discipline = match changes.discipline.as_deref() {
            Some(value) => required_text("discipline", value)?,
            None => existing.discipline.clone(),
        };
        let doc_type = match changes.doc_type.as_deref() {
            Some(value) => required_text("doc_type", value)?,
            None => existing.doc_type.clone(),
        };

        let current_status: DocumentStatus = existing.status.parse()?;
        let status = match changes.status {
            Some(next) => {
                current_status.check_transition(next)?;
                next
            }
            None => current_status,
        };

        let mut diff = ChangeSet::new();
        diff.track("title", &existing.title, &title)?;
        diff.track("discipline", &existing.discipline, &discipline)?;
        diff.track("doc_type", &existing.doc_type, &doc_type)?;
        diff.track("status", &existing.status, &status.as_str().to_string())?;
        if diff.is_empty() {
            return Ok(existing);
        }
        let changed: Vec<String> = diff.fields().map(str::to_string).collect();

        let document = audited(conn, actor, |conn| {
            let document: Document = diesel::update(documents::table.find(document_id))
                .set(&DocumentChangeset {
                    title,
                    discipline,
                    doc_type,
                    status: status.as_str().to_string(),
                    updated_at: Utc::now().naive_utc(),
                })
                .get_result(conn)?;
            Ok((
                document,
                AuditEntry::updated(EntityType::Document, document_id, diff),
            ))
        })?;

        tracing::info!(
            document_id = %document_id,
            fields = ?changed,
            status = %document.status,
            "document updated"
        );
        Ok(document)
    })
}

pub fn get_document(conn: &mut PgConnection, document_id: Uuid) -> RecordResult<DocumentRecord> {
    let document: Document = documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or(RecordError::NotFound("document"))?;
    let mut stats = load_version_stats(conn, &[document_id])?;
    let (current_version, version_count) = stats.remove(&document_id).unwrap_or((None, 0));
    Ok(DocumentRecord {
        document,
        current_version,
        version_count,
    })
}

/// Ordered by document number.
pub fn list_documents(
    conn: &mut PgConnection,
    filter: &DocumentFilter,
) -> RecordResult<Vec<DocumentRecord>> {
    let mut query = documents::table
        .inner_join(projects::table)
        .select(documents::all_columns)
        .into_boxed();

    if let Some(company_id) = filter.company_id {
        query = query.filter(projects::company_id.eq(company_id));
    }
    if let Some(project_id) = filter.project_id {
        query = query.filter(documents::project_id.eq(project_id));
    }
    if let Some(discipline) = non_blank(filter.discipline.as_deref()) {
        query = query.filter(documents::discipline.eq(discipline));
    }
    if let Some(doc_type) = non_blank(filter.doc_type.as_deref()) {
        query = query.filter(documents::doc_type.eq(doc_type));
    }
    if let Some(status) = filter.status {
        query = query.filter(documents::status.eq(status.as_str()));
    }
    if let Some(pattern) = search_pattern(filter.search.as_deref()) {
        query = query.filter(
            documents::document_number
                .ilike(pattern.clone())
                .or(documents::title.ilike(pattern)),
        );
    }

    let docs: Vec<Document> = query
        .order((documents::document_number.asc(), documents::id.asc()))
        .load(conn)?;

    let ids: Vec<Uuid> = docs.iter().map(|doc| doc.id).collect();
    let mut stats = load_version_stats(conn, &ids)?;

    Ok(docs
        .into_iter()
        .map(|document| {
            let (current_version, version_count) =
                stats.remove(&document.id).unwrap_or((None, 0));
            DocumentRecord {
                document,
                current_version,
                version_count,
            }
        })
        .collect())
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Highest-numbered version and version count per document.
fn load_version_stats(
    conn: &mut PgConnection,
    document_ids: &[Uuid],
) -> RecordResult<HashMap<Uuid, (Option<DocumentVersion>, i64)>> {
    if document_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let versions: Vec<DocumentVersion> = document_versions::table
        .filter(document_versions::document_id.eq_any(document_ids))
        .order((
            document_versions::document_id.asc(),
            document_versions::version_number.desc(),
        ))
        .load(conn)?;

    let mut stats: HashMap<Uuid, (Option<DocumentVersion>, i64)> = HashMap::new();
    for version in versions {
        let entry = stats.entry(version.document_id).or_insert((None, 0));
        entry.1 += 1;
        if entry.0.is_none() {
            entry.0 = Some(version);
        }
    }
    Ok(stats)
}

//! Append-only audit trail.
//!
//! [`record`] is the only write path into `audit_logs`. Callers normally go
//! through [`audited`], which runs the entity mutation and its audit row in
//! one transaction so the two can never diverge.

use std::fmt;
use std::str::FromStr;

use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{search_pattern, Actor, RecordError, RecordResult};
use crate::models::{AuditLog, NewAuditLog};
use crate::schema::{audit_logs, document_versions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Company,
    Project,
    ProjectMember,
    Document,
    DocumentVersion,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "Company",
            Self::Project => "Project",
            Self::ProjectMember => "ProjectMember",
            Self::Document => "Document",
            Self::DocumentVersion => "DocumentVersion",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for AuditAction {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(RecordError::validation(format!(
                "invalid audit action '{other}'. Allowed: create, update, delete"
            ))),
        }
    }
}

/// One mutation to be written to the trail.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: AuditAction,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl AuditEntry {
    pub fn created<T: Serialize>(
        entity_type: EntityType,
        entity_id: impl ToString,
        snapshot: &T,
    ) -> RecordResult<Self> {
        Ok(Self {
            entity_type,
            entity_id: entity_id.to_string(),
            action: AuditAction::Create,
            old_value: None,
            new_value: Some(snapshot_of(snapshot)?),
        })
    }

    pub fn updated(entity_type: EntityType, entity_id: impl ToString, changes: ChangeSet) -> Self {
        let (old_value, new_value) = changes.into_values();
        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            action: AuditAction::Update,
            old_value: Some(old_value),
            new_value: Some(new_value),
        }
    }

    pub fn deleted<T: Serialize>(
        entity_type: EntityType,
        entity_id: impl ToString,
        snapshot: &T,
    ) -> RecordResult<Self> {
        Ok(Self {
            entity_type,
            entity_id: entity_id.to_string(),
            action: AuditAction::Delete,
            old_value: Some(snapshot_of(snapshot)?),
            new_value: None,
        })
    }
}

fn snapshot_of<T: Serialize>(value: &T) -> RecordResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| RecordError::validation(format!("failed to snapshot record: {err}")))
}

/// Old and new values of the fields an update actually changed.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    old: Map<String, Value>,
    new: Map<String, Value>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `field` only when `before` and `after` differ. Returns whether it did.
    pub fn track<T>(&mut self, field: &str, before: &T, after: &T) -> RecordResult<bool>
    where
        T: Serialize + PartialEq,
    {
        if before == after {
            return Ok(false);
        }
        let old = snapshot_of(before)?;
        let new = snapshot_of(after)?;
        self.old.insert(field.to_string(), old);
        self.new.insert(field.to_string(), new);
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.new.keys().map(String::as_str)
    }

    fn into_values(self) -> (Value, Value) {
        (Value::Object(self.old), Value::Object(self.new))
    }
}

/// Appends one row to the trail. Must run inside the transaction of the
/// mutation it describes.
pub fn record(conn: &mut PgConnection, actor: &Actor, entry: AuditEntry) -> RecordResult<AuditLog> {
    let row = NewAuditLog {
        id: Uuid::new_v4(),
        entity_type: entry.entity_type.as_str().to_string(),
        entity_id: entry.entity_id,
        action: entry.action.as_str().to_string(),
        old_value: entry.old_value,
        new_value: entry.new_value,
        performed_by: actor.user_id,
    };

    let log = diesel::insert_into(audit_logs::table)
        .values(&row)
        .get_result::<AuditLog>(conn)?;
    Ok(log)
}

/// Runs `mutation` and the audit row it produces in one transaction.
pub fn audited<T, F>(conn: &mut PgConnection, actor: &Actor, mutation: F) -> RecordResult<T>
where
    F: FnOnce(&mut PgConnection) -> RecordResult<(T, AuditEntry)>,
{
    conn.transaction::<T, RecordError, _>(|conn| {
        let (value, entry) = mutation(conn)?;
        let log = record(conn, actor, entry)?;
        tracing::debug!(
            audit_id = %log.id,
            entity_type = %log.entity_type,
            entity_id = %log.entity_id,
            action = %log.action,
            "audit entry recorded"
        );
        Ok(value)
    })
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuditLogFilter {
    pub entity_type: Option<String>,
    pub action: Option<String>,
    pub search: Option<String>,
    pub limit: Option<i64>,
}

const DEFAULT_AUDIT_PAGE: i64 = 200;
const MAX_AUDIT_PAGE: i64 = 1000;

/// Newest first.
pub fn list_audit_logs(
    conn: &mut PgConnection,
    filter: &AuditLogFilter,
) -> RecordResult<Vec<AuditLog>> {
    let mut query = audit_logs::table.into_boxed();

    if let Some(entity_type) = filter
        .entity_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        query = query.filter(audit_logs::entity_type.eq(entity_type.to_string()));
    }

    if let Some(action) = filter.action.as_deref().filter(|s| !s.trim().is_empty()) {
        let action: AuditAction = action.parse()?;
        query = query.filter(audit_logs::action.eq(action.as_str()));
    }

    if let Some(pattern) = search_pattern(filter.search.as_deref()) {
        query = query.filter(audit_logs::entity_id.ilike(pattern));
    }

    let limit = filter
        .limit
        .unwrap_or(DEFAULT_AUDIT_PAGE)
        .clamp(1, MAX_AUDIT_PAGE);

    let rows = query
        .order((audit_logs::performed_at.desc(), audit_logs::id.desc()))
        .limit(limit)
        .load(conn)?;
    Ok(rows)
}

pub fn get_audit_log(conn: &mut PgConnection, id: Uuid) -> RecordResult<AuditLog> {
    audit_logs::table
        .find(id)
        .first(conn)
        .optional()?
        .ok_or(RecordError::NotFound("audit log entry"))
}

/// Entries for one entity, oldest first.
pub fn entity_history(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> RecordResult<Vec<AuditLog>> {
    let rows = audit_logs::table
        .filter(audit_logs::entity_type.eq(entity_type.as_str()))
        .filter(audit_logs::entity_id.eq(entity_id))
        .order(audit_logs::performed_at.asc())
        .load(conn)?;
    Ok(rows)
}

/// A document's own entries plus the entries of all of its versions, oldest first.
pub fn document_history(conn: &mut PgConnection, document_id: Uuid) -> RecordResult<Vec<AuditLog>> {
    let version_ids: Vec<String> = document_versions::table
        .filter(document_versions::document_id.eq(document_id))
        .select(document_versions::id)
        .load::<Uuid>(conn)?
        .into_iter()
        .map(|id| id.to_string())
        .collect();

    let document_filter = audit_logs::entity_type
        .eq(EntityType::Document.as_str())
        .and(audit_logs::entity_id.eq(document_id.to_string()));
    let versions_filter = audit_logs::entity_type
        .eq(EntityType::DocumentVersion.as_str())
        .and(audit_logs::entity_id.eq_any(version_ids));

    let rows = audit_logs::table
        .filter(document_filter.or(versions_filter))
        .order(audit_logs::performed_at.asc())
        .load(conn)?;
    Ok(rows)
}

/// Audit rows can only be produced by [`record`].
pub fn create_audit_log(_actor: &Actor) -> RecordResult<AuditLog> {
    Err(RecordError::immutable(
        "audit log entries are written by the system and cannot be created directly",
    ))
}

pub fn update_audit_log(_actor: &Actor, _id: Uuid) -> RecordResult<AuditLog> {
    Err(RecordError::immutable("audit log entries cannot be modified"))
}

pub fn delete_audit_log(_actor: &Actor, _id: Uuid) -> RecordResult<()> {
    Err(RecordError::immutable("audit log entries cannot be deleted"))
}

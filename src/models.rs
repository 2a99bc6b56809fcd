use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable)]
#[diesel(table_name = companies)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = companies)]
pub struct NewCompany {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable, Associations)]
#[diesel(table_name = projects)]
#[diesel(belongs_to(Company))]
pub struct Project {
    pub id: Uuid,
    pub company_id: Uuid,
    pub code: String,
    pub name: String,
    pub status: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = projects)]
pub struct NewProject {
    pub id: Uuid,
    pub company_id: Uuid,
    pub code: String,
    pub name: String,
    pub status: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Queryable, Associations)]
#[diesel(table_name = project_members)]
#[diesel(belongs_to(Project))]
#[diesel(primary_key(project_id, user_id))]
pub struct ProjectMember {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub added_at: NaiveDateTime,
    pub added_by: Option<Uuid>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = project_members)]
pub struct NewProjectMember {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub added_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(Project))]
pub struct Document {
    pub id: Uuid,
    pub project_id: Uuid,
    pub document_number: String,
    pub title: String,
    pub discipline: String,
    pub doc_type: String,
    pub status: String,
    pub created_by: Uuid,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// created_by is filled in from the acting principal; created_at comes
/// from the column default.
#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub project_id: Uuid,
    pub document_number: String,
    pub title: String,
    pub discipline: String,
    pub doc_type: String,
    pub status: String,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_versions)]
#[diesel(belongs_to(Document))]
pub struct DocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i32,
    pub s3_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_by: Uuid,
    pub uploaded_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_versions)]
pub struct NewDocumentVersion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i32,
    pub s3_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_by: Uuid,
}

#[derive(Debug, Clone, Serialize, Queryable, Identifiable)]
#[diesel(table_name = audit_logs)]
pub struct AuditLog {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub performed_by: Uuid,
    pub performed_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = audit_logs)]
pub struct NewAuditLog {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub performed_by: Uuid,
}

//! Domain core: companies, projects, documents, their immutable versions
//! and the append-only audit trail.
//!
//! Every operation takes the connection and the acting principal
//! explicitly. Mutations run inside a single transaction that also writes
//! the matching audit row, see [`audit::audited`].

use std::fmt;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod audit;
pub mod companies;
pub mod documents;
pub mod integrity;
pub mod policy;
pub mod projects;
pub mod status;
pub mod versions;

/// Postgres hint raised by the history triggers on UPDATE/DELETE.
pub const HINT_IMMUTABLE_RECORD: &str = "immutable_record";
/// Postgres hint raised when an inserted version number is not `max + 1`.
pub const HINT_VERSION_SEQUENCE: &str = "version_sequence";

const VERSION_NUMBER_CONSTRAINT: &str = "document_versions_document_id_version_number_key";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{0}")]
    Validation(String),
    #[error("cannot change status from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },
    #[error("{0}")]
    Authorization(String),
    #[error("{0}")]
    ConcurrencyConflict(String),
    #[error("{0}")]
    ImmutabilityViolation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("database error: {0}")]
    Database(DieselError),
}

pub type RecordResult<T> = Result<T, RecordError>;

impl RecordError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn immutable(message: impl Into<String>) -> Self {
        Self::ImmutabilityViolation(message.into())
    }

    /// Only lost version-number races are worth an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Authorization(_) => "authorization_error",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::ImmutabilityViolation(_) => "immutability_violation",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "internal_error",
        }
    }
}

impl From<DieselError> for RecordError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => RecordError::NotFound("record"),
            DieselError::DatabaseError(kind, info) => {
                if info.hint() == Some(HINT_IMMUTABLE_RECORD) {
                    return RecordError::immutable(info.message().to_string());
                }
                if info.hint() == Some(HINT_VERSION_SEQUENCE) {
                    return RecordError::ConcurrencyConflict(
                        "another version was created concurrently; retry the upload".to_string(),
                    );
                }
                let constraint = info.constraint_name().map(str::to_owned);
                match kind {
                    DatabaseErrorKind::UniqueViolation => match constraint.as_deref() {
                        Some(VERSION_NUMBER_CONSTRAINT) => RecordError::ConcurrencyConflict(
                            "another version was created concurrently; retry the upload"
                                .to_string(),
                        ),
                        Some(constraint) => {
                            RecordError::Validation(unique_violation_message(constraint))
                        }
                        None => RecordError::validation("record already exists"),
                    },
                    DatabaseErrorKind::CheckViolation => {
                        RecordError::validation(info.message().to_string())
                    }
                    DatabaseErrorKind::ForeignKeyViolation => {
                        RecordError::validation("referenced record does not exist")
                    }
                    kind => RecordError::Database(DieselError::DatabaseError(kind, info)),
                }
            }
            other => RecordError::Database(other),
        }
    }
}

fn unique_violation_message(constraint: &str) -> String {
    match constraint {
        "companies_name_key" => "a company with that name already exists".to_string(),
        "projects_company_id_code_key" => {
            "a project with that code already exists for this company".to_string()
        }
        "documents_project_id_document_number_key" => {
            "document number already exists in this project".to_string()
        }
        "project_members_pkey" => "user is already a member of this project".to_string(),
        _ => "record already exists".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Unknown role strings get the least privilege.
    pub fn parse_or_viewer(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "editor" => Role::Editor,
            _ => Role::Viewer,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated principal a mutation is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, username: impl Into<String>, role: Role) -> Self {
        Self {
            user_id,
            username: username.into(),
            role,
        }
    }
}

pub(crate) fn required_text(field: &str, value: &str) -> RecordResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RecordError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn search_pattern(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let escaped = s
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("%{escaped}%")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_error(kind: DatabaseErrorKind, message: &str) -> DieselError {
        DieselError::DatabaseError(kind, Box::new(message.to_string()))
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let err = RecordError::from(DieselError::NotFound);
        assert!(matches!(err, RecordError::NotFound(_)));
    }

    #[test]
    fn check_violation_is_validation() {
        let err = RecordError::from(db_error(
            DatabaseErrorKind::CheckViolation,
            "violates check constraint",
        ));
        assert!(matches!(err, RecordError::Validation(_)));
    }

    #[test]
    fn unique_violation_without_constraint_is_validation() {
        let err = RecordError::from(db_error(DatabaseErrorKind::UniqueViolation, "duplicate"));
        assert!(matches!(err, RecordError::Validation(_)));
    }

    #[test]
    fn unclassified_errors_stay_internal() {
        let err = RecordError::from(db_error(DatabaseErrorKind::Unknown, "boom"));
        assert!(matches!(err, RecordError::Database(_)));
        assert_eq!(err.kind(), "internal_error");
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(RecordError::ConcurrencyConflict("race".into()).is_retryable());
        assert!(!RecordError::validation("bad").is_retryable());
        assert!(!RecordError::immutable("no").is_retryable());
        assert!(!RecordError::forbidden("no").is_retryable());
    }

    #[test]
    fn unknown_roles_degrade_to_viewer() {
        assert_eq!(Role::parse_or_viewer("ADMIN"), Role::Admin);
        assert_eq!(Role::parse_or_viewer("editor"), Role::Editor);
        assert_eq!(Role::parse_or_viewer("superuser"), Role::Viewer);
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn search_pattern_escapes_wildcards() {
        assert_eq!(search_pattern(Some("  ")), None);
        assert_eq!(search_pattern(Some("A_1%")).as_deref(), Some("%A\\_1\\%%"));
    }
}

//! Offline consistency checks over the version history and the audit trail.

use std::collections::{BTreeMap, HashMap};

use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use super::audit::{AuditAction, EntityType};
use super::RecordResult;
use crate::schema::{audit_logs, document_versions, documents};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Version numbers of a document are not exactly `1..=n`.
    VersionGap {
        document_id: Uuid,
        numbers: Vec<i32>,
    },
    /// A document or version without exactly one `create` audit row.
    CreateAuditCount {
        entity_type: String,
        entity_id: Uuid,
        count: i64,
    },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IntegrityReport {
    pub documents_checked: usize,
    pub versions_checked: usize,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

pub fn verify(conn: &mut PgConnection) -> RecordResult<IntegrityReport> {
    let document_ids: Vec<Uuid> = documents::table
        .select(documents::id)
        .order(documents::id.asc())
        .load(conn)?;
    let versions: Vec<(Uuid, Uuid, i32)> = document_versions::table
        .select((
            document_versions::id,
            document_versions::document_id,
            document_versions::version_number,
        ))
        .order((
            document_versions::document_id.asc(),
            document_versions::version_number.asc(),
        ))
        .load(conn)?;

    let mut report = IntegrityReport {
        documents_checked: document_ids.len(),
        versions_checked: versions.len(),
        violations: Vec::new(),
    };

    let mut numbers_by_document: BTreeMap<Uuid, Vec<i32>> = BTreeMap::new();
    for (_, document_id, number) in &versions {
        numbers_by_document
            .entry(*document_id)
            .or_default()
            .push(*number);
    }
    for (document_id, numbers) in numbers_by_document {
        if !is_contiguous(&numbers) {
            report.violations.push(Violation::VersionGap {
                document_id,
                numbers,
            });
        }
    }

    let document_creates = create_counts(conn, EntityType::Document)?;
    for id in &document_ids {
        check_create_count(&mut report, EntityType::Document, *id, &document_creates);
    }
    let version_creates = create_counts(conn, EntityType::DocumentVersion)?;
    for (id, _, _) in &versions {
        check_create_count(&mut report, EntityType::DocumentVersion, *id, &version_creates);
    }

    Ok(report)
}

/// `numbers` must be sorted ascending.
fn is_contiguous(numbers: &[i32]) -> bool {
    numbers
        .iter()
        .enumerate()
        .all(|(idx, number)| i64::from(*number) == idx as i64 + 1)
}

fn create_counts(
    conn: &mut PgConnection,
    entity_type: EntityType,
) -> RecordResult<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = audit_logs::table
        .filter(audit_logs::entity_type.eq(entity_type.as_str()))
        .filter(audit_logs::action.eq(AuditAction::Create.as_str()))
        .group_by(audit_logs::entity_id)
        .select((audit_logs::entity_id, count_star()))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

fn check_create_count(
    report: &mut IntegrityReport,
    entity_type: EntityType,
    id: Uuid,
    counts: &HashMap<String, i64>,
) {
    let count = counts.get(&id.to_string()).copied().unwrap_or(0);
    if count != 1 {
        report.violations.push(Violation::CreateAuditCount {
            entity_type: entity_type.as_str().to_string(),
            entity_id: id,
            count,
        });
    }
}

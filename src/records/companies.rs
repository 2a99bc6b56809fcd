use diesel::dsl::{count_star, exists};
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use super::audit::{audited, AuditEntry, ChangeSet, EntityType};
use super::policy::{authorize, Capability};
use super::{required_text, search_pattern, Actor, RecordError, RecordResult};
use crate::models::{Company, NewCompany};
use crate::schema::{companies, projects};

pub fn create_company(conn: &mut PgConnection, actor: &Actor, name: &str) -> RecordResult<Company> {
    authorize(conn, actor, Capability::ManageCompanies)?;
    let name = required_text("name", name)?;

    let company = audited(conn, actor, |conn| {
        let company: Company = diesel::insert_into(companies::table)
            .values(&NewCompany {
                id: Uuid::new_v4(),
                name,
            })
            .get_result(conn)?;
        let entry = AuditEntry::created(EntityType::Company, company.id, &company)?;
        Ok((company, entry))
    })?;

    tracing::info!(company_id = %company.id, name = %company.name, "company created");
    Ok(company)
}

pub fn update_company(
    conn: &mut PgConnection,
    actor: &Actor,
    company_id: Uuid,
    name: &str,
) -> RecordResult<Company> {
    authorize(conn, actor, Capability::ManageCompanies)?;
    let name = required_text("name", name)?;

    conn.transaction::<Company, RecordError, _>(|conn| {
        let existing: Company = companies::table
            .find(company_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(RecordError::NotFound("company"))?;

        let mut changes = ChangeSet::new();
        if !changes.track("name", &existing.name, &name)? {
            return Ok(existing);
        }

        let company = audited(conn, actor, |conn| {
            let company: Company = diesel::update(companies::table.find(company_id))
                .set(companies::name.eq(&name))
                .get_result(conn)?;
            Ok((
                company,
                AuditEntry::updated(EntityType::Company, company_id, changes),
            ))
        })?;

        tracing::info!(company_id = %company_id, name = %company.name, "company renamed");
        Ok(company)
    })
}

/// Companies that still own projects are kept; there is no cascade.
pub fn delete_company(conn: &mut PgConnection, actor: &Actor, company_id: Uuid) -> RecordResult<()> {
    authorize(conn, actor, Capability::ManageCompanies)?;

    audited(conn, actor, |conn| {
        let company: Company = companies::table
            .find(company_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(RecordError::NotFound("company"))?;

        let has_projects: bool = diesel::select(exists(
            projects::table.filter(projects::company_id.eq(company_id)),
        ))
        .get_result(conn)?;
        if has_projects {
            return Err(RecordError::validation(
                "cannot delete a company that still has projects",
            ));
        }

        diesel::delete(companies::table.find(company_id)).execute(conn)?;
        let entry = AuditEntry::deleted(EntityType::Company, company_id, &company)?;
        Ok(((), entry))
    })?;

    tracing::info!(company_id = %company_id, "company deleted");
    Ok(())
}

pub fn get_company(conn: &mut PgConnection, company_id: Uuid) -> RecordResult<Company> {
    companies::table
        .find(company_id)
        .first(conn)
        .optional()?
        .ok_or(RecordError::NotFound("company"))
}

pub fn list_companies(conn: &mut PgConnection, search: Option<&str>) -> RecordResult<Vec<Company>> {
    let mut query = companies::table.into_boxed();
    if let Some(pattern) = search_pattern(search) {
        query = query.filter(companies::name.ilike(pattern));
    }
    let rows = query.order(companies::name.asc()).load(conn)?;
    Ok(rows)
}

pub fn project_count(conn: &mut PgConnection, company_id: Uuid) -> RecordResult<i64> {
    let count = projects::table
        .filter(projects::company_id.eq(company_id))
        .select(count_star())
        .first(conn)?;
    Ok(count)
}

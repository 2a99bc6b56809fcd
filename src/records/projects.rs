use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use serde::Serialize;
use uuid::Uuid;

use super::audit::{audited, AuditEntry, ChangeSet, EntityType};
use super::companies::get_company;
use super::policy::{authorize, Capability};
use super::status::ProjectStatus;
use super::{required_text, search_pattern, Actor, RecordError, RecordResult};
use crate::models::{NewProject, NewProjectMember, Project, ProjectMember};
use crate::schema::{companies, project_members, projects, users};

#[derive(Debug, Clone)]
pub struct CreateProject {
    pub company_id: Uuid,
    pub code: String,
    pub name: String,
    pub status: Option<ProjectStatus>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// `None` leaves a field untouched. `end_date: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct ProjectChanges {
    pub name: Option<String>,
    pub status: Option<ProjectStatus>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<Option<NaiveDate>>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub company_id: Option<Uuid>,
    pub status: Option<ProjectStatus>,
    pub search: Option<String>,
}

#[derive(AsChangeset)]
#[diesel(table_name = projects, treat_none_as_null = true)]
struct ProjectChangeset {
    name: String,
    status: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    updated_at: chrono::NaiveDateTime,
}

fn check_dates(start: NaiveDate, end: Option<NaiveDate>) -> RecordResult<()> {
    match end {
        Some(end) if end < start => Err(RecordError::validation(
            "end_date must not be before start_date",
        )),
        _ => Ok(()),
    }
}

pub fn create_project(
    conn: &mut PgConnection,
    actor: &Actor,
    input: CreateProject,
) -> RecordResult<Project> {
    authorize(conn, actor, Capability::ManageProjects)?;
    let code = required_text("code", &input.code)?;
    let name = required_text("name", &input.name)?;
    check_dates(input.start_date, input.end_date)?;
    get_company(conn, input.company_id)?;

    let project = audited(conn, actor, |conn| {
        let project: Project = diesel::insert_into(projects::table)
            .values(&NewProject {
                id: Uuid::new_v4(),
                company_id: input.company_id,
                code,
                name,
                status: input
                    .status
                    .unwrap_or(ProjectStatus::Active)
                    .as_str()
                    .to_string(),
                start_date: input.start_date,
                end_date: input.end_date,
            })
            .get_result(conn)?;
        let entry = AuditEntry::created(EntityType::Project, project.id, &project)?;
        Ok((project, entry))
    })?;

    tracing::info!(
        project_id = %project.id,
        company_id = %project.company_id,
        code = %project.code,
        "project created"
    );
    Ok(project)
}

/// `code` and `company_id` are fixed at creation.
pub fn update_project(
    conn: &mut PgConnection,
    actor: &Actor,
    project_id: Uuid,
    changes: ProjectChanges,
) -> RecordResult<Project> {
    authorize(conn, actor, Capability::ManageProjects)?;

    conn.transaction::<Project, RecordError, _>(|conn| {
        let existing: Project = projects::table
            .find(project_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(RecordError::NotFound("project"))?;
        let current_status: ProjectStatus = existing.status.parse()?;

        let name = match changes.name.as_deref() {
            Some(name) => required_text("name", name)?,
            None => existing.name.clone(),
        };
        let status = changes.status.unwrap_or(current_status);
        if !current_status.can_transition_to(status) {
            return Err(RecordError::InvalidTransition {
                from: current_status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        let start_date = changes.start_date.unwrap_or(existing.start_date);
        let end_date = changes.end_date.unwrap_or(existing.end_date);
        check_dates(start_date, end_date)?;

        let mut diff = ChangeSet::new();
        diff.track("name", &existing.name, &name)?;
        diff.track("status", &existing.status, &status.as_str().to_string())?;
        diff.track("start_date", &existing.start_date, &start_date)?;
        diff.track("end_date", &existing.end_date, &end_date)?;
        if diff.is_empty() {
            return Ok(existing);
        }

        let updated = audited(conn, actor, |conn| {
            let project: Project = diesel::update(projects::table.find(project_id))
                .set(&ProjectChangeset {
                    name,
                    status: status.as_str().to_string(),
                    start_date,
                    end_date,
                    updated_at: Utc::now().naive_utc(),
                })
                .get_result(conn)?;
            Ok((
                project,
                AuditEntry::updated(EntityType::Project, project_id, diff),
            ))
        })?;

        tracing::info!(project_id = %project_id, status = %updated.status, "project updated");
        Ok(updated)
    })
}

pub fn get_project(conn: &mut PgConnection, project_id: Uuid) -> RecordResult<Project> {
    projects::table
        .find(project_id)
        .first(conn)
        .optional()?
        .ok_or(RecordError::NotFound("project"))
}

/// Ordered by company name, then project code.
pub fn list_projects(conn: &mut PgConnection, filter: &ProjectFilter) -> RecordResult<Vec<Project>> {
    let mut query = projects::table
        .inner_join(companies::table)
        .select(projects::all_columns)
        .into_boxed();

    if let Some(company_id) = filter.company_id {
        query = query.filter(projects::company_id.eq(company_id));
    }
    if let Some(status) = filter.status {
        query = query.filter(projects::status.eq(status.as_str()));
    }
    if let Some(pattern) = search_pattern(filter.search.as_deref()) {
        query = query.filter(
            projects::code
                .ilike(pattern.clone())
                .or(projects::name.ilike(pattern)),
        );
    }

    let rows = query
        .order((companies::name.asc(), projects::code.asc()))
        .load(conn)?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
struct MembershipSnapshot {
    project_id: Uuid,
    user_id: Uuid,
}

fn membership_id(project_id: Uuid, user_id: Uuid) -> String {
    format!("{project_id}:{user_id}")
}

pub fn add_member(
    conn: &mut PgConnection,
    actor: &Actor,
    project_id: Uuid,
    user_id: Uuid,
) -> RecordResult<ProjectMember> {
    authorize(conn, actor, Capability::ManageMembers(project_id))?;

    audited(conn, actor, |conn| {
        projects::table
            .find(project_id)
            .select(projects::id)
            .for_share()
            .first::<Uuid>(conn)
            .optional()?
            .ok_or(RecordError::NotFound("project"))?;
        let user_exists: bool = diesel::select(diesel::dsl::exists(users::table.find(user_id)))
            .get_result(conn)?;
        if !user_exists {
            return Err(RecordError::NotFound("user"));
        }

        let member: ProjectMember = diesel::insert_into(project_members::table)
            .values(&NewProjectMember {
                project_id,
                user_id,
                added_by: Some(actor.user_id),
            })
            .get_result(conn)?;
        let entry = AuditEntry::created(
            EntityType::ProjectMember,
            membership_id(project_id, user_id),
            &MembershipSnapshot {
                project_id,
                user_id,
            },
        )?;
        Ok((member, entry))
    })
}

pub fn remove_member(
    conn: &mut PgConnection,
    actor: &Actor,
    project_id: Uuid,
    user_id: Uuid,
) -> RecordResult<()> {
    authorize(conn, actor, Capability::ManageMembers(project_id))?;

    audited(conn, actor, |conn| {
        let removed = diesel::delete(
            project_members::table
                .filter(project_members::project_id.eq(project_id))
                .filter(project_members::user_id.eq(user_id)),
        )
        .execute(conn)?;
        if removed == 0 {
            return Err(RecordError::NotFound("project member"));
        }
        let entry = AuditEntry::deleted(
            EntityType::ProjectMember,
            membership_id(project_id, user_id),
            &MembershipSnapshot {
                project_id,
                user_id,
            },
        )?;
        Ok(((), entry))
    })
}

pub fn list_members(conn: &mut PgConnection, project_id: Uuid) -> RecordResult<Vec<ProjectMember>> {
    let rows = project_members::table
        .filter(project_members::project_id.eq(project_id))
        .order(project_members::added_at.asc())
        .load(conn)?;
    Ok(rows)
}

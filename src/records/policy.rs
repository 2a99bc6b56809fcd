use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use super::{Actor, RecordError, RecordResult, Role};
use crate::schema::project_members;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ViewRecords,
    ManageCompanies,
    ManageProjects,
    ManageMembers(Uuid),
    EditDocuments(Uuid),
    UploadVersions(Uuid),
}

/// What a role grants before project membership is taken into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Allowed,
    Denied,
    RequiresMembership(Uuid),
}

pub fn role_grant(role: Role, capability: Capability) -> Grant {
    match (role, capability) {
        (_, Capability::ViewRecords) => Grant::Allowed,
        (Role::Admin, _) => Grant::Allowed,
        (Role::Editor, Capability::EditDocuments(project_id))
        | (Role::Editor, Capability::UploadVersions(project_id)) => {
            Grant::RequiresMembership(project_id)
        }
        _ => Grant::Denied,
    }
}

pub fn authorize(conn: &mut PgConnection, actor: &Actor, capability: Capability) -> RecordResult<()> {
    match role_grant(actor.role, capability) {
        Grant::Allowed => Ok(()),
        Grant::Denied => {
            tracing::debug!(user_id = %actor.user_id, ?capability, "capability denied");
            Err(RecordError::forbidden(denial_message(capability)))
        }
        Grant::RequiresMembership(project_id) => {
            if is_project_member(conn, project_id, actor.user_id)? {
                Ok(())
            } else {
                tracing::debug!(
                    user_id = %actor.user_id,
                    project_id = %project_id,
                    "actor is not a member of the project"
                );
                Err(RecordError::forbidden(denial_message(capability)))
            }
        }
    }
}

pub fn is_project_member(
    conn: &mut PgConnection,
    project_id: Uuid,
    user_id: Uuid,
) -> RecordResult<bool> {
    let member: bool = diesel::select(exists(
        project_members::table
            .filter(project_members::project_id.eq(project_id))
            .filter(project_members::user_id.eq(user_id)),
    ))
    .get_result(conn)?;
    Ok(member)
}

fn denial_message(capability: Capability) -> &'static str {
    match capability {
        Capability::ViewRecords => "not allowed to view records",
        Capability::ManageCompanies => "only administrators can manage companies",
        Capability::ManageProjects => "only administrators can manage projects",
        Capability::ManageMembers(_) => "only administrators can manage project members",
        Capability::EditDocuments(_) => "not allowed to edit documents in this project",
        Capability::UploadVersions(_) => "not allowed to upload versions in this project",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everyone_can_view() {
        for role in [Role::Admin, Role::Editor, Role::Viewer] {
            assert_eq!(role_grant(role, Capability::ViewRecords), Grant::Allowed);
        }
    }

    #[test]
    fn admin_is_granted_everything() {
        let project = Uuid::new_v4();
        for capability in [
            Capability::ManageCompanies,
            Capability::ManageProjects,
            Capability::ManageMembers(project),
            Capability::EditDocuments(project),
            Capability::UploadVersions(project),
        ] {
            assert_eq!(role_grant(Role::Admin, capability), Grant::Allowed);
        }
    }

    #[test]
    fn editors_need_membership_for_document_work() {
        let project = Uuid::new_v4();
        assert_eq!(
            role_grant(Role::Editor, Capability::UploadVersions(project)),
            Grant::RequiresMembership(project)
        );
        assert_eq!(
            role_grant(Role::Editor, Capability::ManageProjects),
            Grant::Denied
        );
        assert_eq!(
            role_grant(Role::Editor, Capability::ManageMembers(project)),
            Grant::Denied
        );
    }

    #[test]
    fn viewers_cannot_write() {
        let project = Uuid::new_v4();
        assert_eq!(
            role_grant(Role::Viewer, Capability::EditDocuments(project)),
            Grant::Denied
        );
        assert_eq!(
            role_grant(Role::Viewer, Capability::ManageCompanies),
            Grant::Denied
        );
    }
}

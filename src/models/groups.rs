//! Contact groups. Manual groups have explicit membership; query groups
//! derive theirs from a contact search and are repopulated by a task.

use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;

use super::{ContactId, GroupId, OrgId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Initializing,
    Evaluating,
    Ready,
}

impl GroupStatus {
    pub fn from_code(code: &str) -> GroupStatus {
        match code {
            "I" => GroupStatus::Initializing,
            "V" => GroupStatus::Evaluating,
            _ => GroupStatus::Ready,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GroupStatus::Initializing => "I",
            GroupStatus::Evaluating => "V",
            GroupStatus::Ready => "R",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Group {
    pub id: GroupId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    /// non-empty for query-based groups
    pub query: Option<String>,
    pub status: String,
}

impl Group {
    pub fn is_dynamic(&self) -> bool {
        self.query.as_deref().map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub async fn load_for_org(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            "SELECT id, uuid, org_id, name, query, status FROM contact_groups WHERE org_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(db)
        .await?;

        Ok(groups)
    }
}

/// One (contact, group) membership pair for bulk add/remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub contact_id: ContactId,
    pub group_id: GroupId,
}

/// Adds the passed in memberships in one statement, ignoring pairs that
/// already exist.
pub async fn add_memberships(
    db: impl sqlx::PgExecutor<'_>,
    memberships: &[GroupMembership],
) -> Result<()> {
    if memberships.is_empty() {
        return Ok(());
    }
    let contact_ids: Vec<ContactId> = memberships.iter().map(|m| m.contact_id).collect();
    let group_ids: Vec<GroupId> = memberships.iter().map(|m| m.group_id).collect();

    sqlx::query(
        r#"
        INSERT INTO contact_group_members(contact_id, group_id)
        SELECT * FROM UNNEST($1::bigint[], $2::int[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&contact_ids)
    .bind(&group_ids)
    .execute(db)
    .await?;

    Ok(())
}

/// Removes the passed in memberships in one statement.
pub async fn remove_memberships(
    db: impl sqlx::PgExecutor<'_>,
    memberships: &[GroupMembership],
) -> Result<()> {
    if memberships.is_empty() {
        return Ok(());
    }
    let contact_ids: Vec<ContactId> = memberships.iter().map(|m| m.contact_id).collect();
    let group_ids: Vec<GroupId> = memberships.iter().map(|m| m.group_id).collect();

    sqlx::query(
        r#"
        DELETE FROM contact_group_members cgm
         USING UNNEST($1::bigint[], $2::int[]) AS r(contact_id, group_id)
         WHERE cgm.contact_id = r.contact_id AND cgm.group_id = r.group_id
        "#,
    )
    .bind(&contact_ids)
    .bind(&group_ids)
    .execute(db)
    .await?;

    Ok(())
}

/// The contact ids belonging to a group.
pub async fn member_ids(
    db: impl sqlx::PgExecutor<'_>,
    group_id: GroupId,
) -> Result<Vec<ContactId>> {
    let rows: Vec<(ContactId,)> =
        sqlx::query_as("SELECT contact_id FROM contact_group_members WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(db)
            .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Clears and repopulates a query group's membership, returning the new
/// member count. Used by the populate task after a query change.
pub async fn set_members(
    db: &mut sqlx::PgConnection,
    group_id: GroupId,
    contact_ids: &[ContactId],
) -> Result<usize> {
    sqlx::query("DELETE FROM contact_group_members WHERE group_id = $1")
        .bind(group_id)
        .execute(&mut *db)
        .await?;

    let memberships: Vec<GroupMembership> = contact_ids
        .iter()
        .map(|&contact_id| GroupMembership { contact_id, group_id })
        .collect();
    add_memberships(&mut *db, &memberships).await?;

    sqlx::query("UPDATE contact_groups SET status = 'R' WHERE id = $1")
        .bind(group_id)
        .execute(&mut *db)
        .await?;

    Ok(contact_ids.len())
}

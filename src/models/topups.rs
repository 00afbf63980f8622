//! Topups: message credits for orgs that meter their sending.

use crate::error::Result;

use super::{OrgId, TopupId};

/// Allocates credit for `count` outgoing messages from the org's active
/// topup, returning its id, or `None` when the org doesn't use topups or
/// has no remaining credit. The decrement and the remaining-credit check
/// happen in one statement so concurrent sprints can't oversell.
pub async fn allocate_topup(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    count: i64,
) -> Result<Option<TopupId>> {
    let row: Option<(TopupId,)> = sqlx::query_as(
        r#"
        UPDATE topups
           SET used = used + $2
         WHERE id = (
               SELECT id FROM topups
                WHERE org_id = $1 AND is_active = TRUE AND expires_on > NOW() AND used + $2 <= credits
                ORDER BY expires_on
                LIMIT 1
                FOR UPDATE SKIP LOCKED
         )
        RETURNING id
        "#,
    )
    .bind(org_id)
    .bind(count)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| r.0))
}

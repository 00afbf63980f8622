//! Wait expiry cron: timed-out waits become resume tasks so the
//! interpreter can route the contact down its timeout path, and voice
//! waits simply expire.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::models::sessions;
use crate::queue::{self, Priority, TaskEnvelope};
use crate::runtime::Runtime;
use crate::tasks::handler::{ContactEvent, HANDLE_CONTACT_EVENT};

/// Sessions swept per tick.
const EXPIRE_BATCH: i64 = 500;

pub async fn expire_waits(rt: &Arc<Runtime>) -> Result<()> {
    // messaging waits resume through the engine's timeout path
    let rows: Vec<(i32, i64, i64)> = sqlx::query_as(
        r#"
        SELECT org_id, id, contact_id FROM flow_sessions
         WHERE status = 'W' AND session_type = 'M' AND timeout_on <= NOW()
         ORDER BY timeout_on
         LIMIT $1
        "#,
    )
    .bind(EXPIRE_BATCH)
    .fetch_all(&rt.db)
    .await?;

    for (org_id, session_id, contact_id) in &rows {
        // clear the timeout so the next tick doesn't requeue it while the
        // resume task is in flight
        sqlx::query("UPDATE flow_sessions SET timeout_on = NULL WHERE id = $1")
            .bind(session_id)
            .execute(&rt.db)
            .await?;

        let event = ContactEvent::WaitTimeout { contact_id: *contact_id, session_id: *session_id };
        queue::push(
            &rt.db,
            queue::HANDLER,
            *org_id,
            Priority::High,
            &TaskEnvelope::new(HANDLE_CONTACT_EVENT, *org_id, serde_json::to_value(&event)?),
        )
        .await?;
    }

    // voice waits have no timeout path to resume; they expire in place
    let mut conn = rt.db.acquire().await?;
    let expired = sessions::expire_timed_out_sessions(
        &mut *conn,
        crate::models::FlowType::Voice,
        chrono::Utc::now(),
    )
    .await?;

    if !rows.is_empty() || !expired.is_empty() {
        info!(timeouts = rows.len(), expired = expired.len(), "session waits swept");
    }
    Ok(())
}

//! Interrupting contacts' waiting sessions, e.g. when a contact is
//! blocked or deleted from the UI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::models::{sessions, ContactId, OrgId};
use crate::runtime::Runtime;
use crate::tasks::Task;

pub const INTERRUPT_SESSIONS: &str = "interrupt_sessions";

pub fn decode(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let task: InterruptSessionsTask = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InterruptSessionsTask {
    pub contact_ids: Vec<ContactId>,
}

#[async_trait]
impl Task for InterruptSessionsTask {
    fn kind(&self) -> &'static str {
        INTERRUPT_SESSIONS
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        let mut conn = rt.db.acquire().await?;
        let interrupted =
            sessions::interrupt_waiting_sessions(&mut *conn, org_id, &self.contact_ids).await?;

        info!(org_id, interrupted, "sessions interrupted");
        Ok(())
    }
}

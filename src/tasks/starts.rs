//! Flow start tasks: the batcher that expands a start spec into
//! fixed-size batches, and the batch task that runs each one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::UuidGenerator;
use crate::error::{Result, WrapErr};
use crate::models::starts::{FlowStart, FlowStartBatch, StartStatus};
use crate::models::{groups, ContactId, OrgId};
use crate::queue::{self, Priority, TaskEnvelope};
use crate::runner;
use crate::runtime::Runtime;
use crate::search::SearchClient;
use crate::search;
use crate::tasks::Task;

pub const START_FLOW: &str = "start_flow";
pub const START_FLOW_BATCH: &str = "start_flow_batch";

/// Group and query starts can reach most of an org; explicit-contact
/// starts this small stay on the latency-sensitive lane.
const SMALL_START_THRESHOLD: usize = 5;

pub fn decode_start_flow(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let start: FlowStart = serde_json::from_value(payload)?;
    Ok(Box::new(StartFlowTask { start }))
}

pub fn decode_start_flow_batch(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let batch: FlowStartBatch = serde_json::from_value(payload)?;
    Ok(Box::new(StartFlowBatchTask { batch }))
}

/// Expands a start spec into batches and enqueues one batch task each.
pub struct StartFlowTask {
    pub start: FlowStart,
}

#[async_trait]
impl Task for StartFlowTask {
    fn kind(&self) -> &'static str {
        START_FLOW
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        let outcome = create_flow_batches(&rt, org_id, &self.start).await;
        if let Err(err) = &outcome {
            warn!(org_id, error = %err, "flow start failed");
            if self.start.id.is_some() {
                // best effort; the original failure is what surfaces
                let _ = self.start.set_status(&rt.db, StartStatus::Failed, 0).await;
            }
        }
        outcome
    }
}

/// Resolves the start's contact set, chunks it and enqueues the batches.
pub async fn create_flow_batches(rt: &Arc<Runtime>, org_id: OrgId, start: &FlowStart) -> Result<()> {
    let assets = rt.cache.get(&rt.db, org_id).await?;

    // the selection set: explicit ids, group members, query hits
    let mut contact_ids: Vec<ContactId> = start.contact_ids.clone();
    for &group_id in &start.group_ids {
        contact_ids.extend(groups::member_ids(&rt.db, group_id).await?);
    }

    if let Some(query) = &start.query {
        let parsed = search::parse_query(&assets, query).wrap_err("error parsing start query")?;
        let hits = rt
            .search
            .contact_ids(&assets, None, &parsed, 10_000_000)
            .await
            .wrap_err("error querying contacts")?;
        contact_ids.extend(hits);
    }

    if start.create_contact {
        let mut conn = rt.db.acquire().await?;
        let contact = crate::models::Contact::create(
            &mut *conn,
            org_id,
            rt.uuids.next(),
            None,
            None,
            &[],
        )
        .await?;
        contact_ids.push(contact.id);
    }

    contact_ids.sort_unstable();
    contact_ids.dedup();

    // subtraction: excluded groups now, session/run exclusions per batch
    if !start.exclude_group_ids.is_empty() {
        let mut excluded: Vec<ContactId> = Vec::new();
        for &group_id in &start.exclude_group_ids {
            excluded.extend(groups::member_ids(&rt.db, group_id).await?);
        }
        contact_ids.retain(|id| !excluded.contains(id));
    }

    let contact_count = contact_ids.len() as i64;

    if contact_ids.is_empty() {
        start.set_status(&rt.db, StartStatus::Complete, 0).await?;
        return Ok(());
    }

    start.set_status(&rt.db, StartStatus::Starting, contact_count).await?;

    // group and query starts can be huge; they go to the batch lane
    let (queue, priority) = if start.group_ids.is_empty()
        && start.query.is_none()
        && contact_ids.len() <= SMALL_START_THRESHOLD
    {
        (queue::HANDLER, Priority::High)
    } else {
        (queue::BATCH, Priority::Bulk)
    };

    let batches = start.create_batches(&contact_ids, rt.config.start_batch_size);
    let batch_count = batches.len();
    for batch in batches {
        queue::push(
            &rt.db,
            queue,
            org_id,
            priority,
            &TaskEnvelope::new(START_FLOW_BATCH, org_id, serde_json::to_value(&batch)?),
        )
        .await?;
    }

    info!(org_id, contact_count, batch_count, "flow start batched");
    Ok(())
}

/// Runs one batch of a start through the session runner.
pub struct StartFlowBatchTask {
    pub batch: FlowStartBatch,
}

#[async_trait]
impl Task for StartFlowBatchTask {
    fn kind(&self) -> &'static str {
        START_FLOW_BATCH
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(900)
    }

    async fn perform(&self, rt: Arc<Runtime>, _org_id: OrgId) -> Result<()> {
        let outcome = runner::start_flow_batch(&rt, &self.batch).await;

        if let Some(start_id) = self.batch.start_id {
            if self.batch.is_last {
                let status = if outcome.is_ok() { StartStatus::Complete } else { StartStatus::Failed };
                sqlx::query(
                    "UPDATE flow_starts SET status = $2, modified_on = NOW() WHERE id = $1",
                )
                .bind(start_id)
                .bind(status.code())
                .execute(&rt.db)
                .await?;
            }
        }

        outcome.map(|started| {
            info!(started, batch_size = self.batch.contact_ids.len(), "start batch complete");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::starts::StartType;

    #[test]
    fn small_explicit_starts_use_the_handler_lane() {
        let explicit = FlowStart::new(1, StartType::Manual, 3).with_contact_ids(vec![1, 2]);
        assert!(explicit.group_ids.is_empty() && explicit.query.is_none());

        let grouped = FlowStart::new(1, StartType::Manual, 3).with_group_ids(vec![9]);
        assert!(!grouped.group_ids.is_empty());
    }
}

//! Campaign tasks: recomputing an event's fires and firing due ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::TriggerOrigin;
use crate::error::{FlowhubError, Result, WrapErr};
use crate::locker;
use crate::models::campaigns::{self, CampaignEvent};
use crate::models::{CampaignEventId, EventFireId, OrgId};
use crate::queue::{self, Priority, TaskEnvelope};
use crate::runner::{self, StartOptions};
use crate::runtime::Runtime;
use crate::tasks::Task;

pub const SCHEDULE_CAMPAIGN_EVENT: &str = "schedule_campaign_event";
pub const FIRE_CAMPAIGN_EVENT: &str = "fire_campaign_event";

/// Fires handled per queued fire task.
const FIRES_PER_TASK: usize = 100;

pub fn decode_schedule(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let task: ScheduleCampaignEventTask = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

pub fn decode_fire(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let task: FireCampaignEventTask = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

/// Recomputes every unfired fire for one campaign event.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleCampaignEventTask {
    pub campaign_event_id: CampaignEventId,
}

#[async_trait]
impl Task for ScheduleCampaignEventTask {
    fn kind(&self) -> &'static str {
        SCHEDULE_CAMPAIGN_EVENT
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        // the lock TTL matches the task timeout so a holder can't outlive
        // its lease; a second scheduler gives up after the wait
        let lock_name = format!("schedule_campaign_event_{}", self.campaign_event_id);
        let token = locker::acquire(
            &rt.db,
            &lock_name,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .await
        .wrap_err(format!(
            "error grabbing lock to schedule campaign event {}",
            self.campaign_event_id
        ))?;

        let result = schedule(&rt, org_id, self.campaign_event_id).await;

        let _ = locker::release(&rt.db, &lock_name, &token).await;
        result.wrap_err(format!("error scheduling campaign event {}", self.campaign_event_id))
    }
}

async fn schedule(rt: &Arc<Runtime>, org_id: OrgId, event_id: CampaignEventId) -> Result<()> {
    let assets = rt.cache.get(&rt.db, org_id).await?;
    let tz = assets.timezone()?;

    let Some(event) = CampaignEvent::load(&rt.db, event_id).await? else {
        warn!(event_id, "scheduling missing campaign event");
        return Ok(());
    };
    if !event.is_active {
        return Ok(());
    }
    let group_id = sqlx::query_as::<_, (i32,)>("SELECT group_id FROM campaigns WHERE id = $1")
        .bind(event.campaign_id)
        .fetch_one(&rt.db)
        .await?
        .0;

    let mut conn = rt.db.acquire().await?;
    let scheduled = campaigns::schedule_event_fires(&mut *conn, tz, &event, group_id).await?;
    info!(org_id, event_id, scheduled, "campaign event scheduled");
    Ok(())
}

/// Fires a set of due event fires: starts the event's flow for their
/// contacts and deletes the fires.
#[derive(Debug, Serialize, Deserialize)]
pub struct FireCampaignEventTask {
    pub campaign_event_id: CampaignEventId,
    pub fire_ids: Vec<EventFireId>,
}

#[async_trait]
impl Task for FireCampaignEventTask {
    fn kind(&self) -> &'static str {
        FIRE_CAMPAIGN_EVENT
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(900)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        let assets = rt.cache.get(&rt.db, org_id).await?;

        let fires = campaigns::load_fires(&rt.db, &self.fire_ids).await?;
        if fires.is_empty() {
            return Ok(());
        }

        let Some(event) = CampaignEvent::load(&rt.db, self.campaign_event_id).await? else {
            // event deleted since scheduling; consume the fires
            campaigns::mark_fires_fired(&rt.db, &self.fire_ids).await?;
            return Ok(());
        };
        let Ok(flow) = assets.flow(event.flow_id) else {
            campaigns::mark_fires_fired(&rt.db, &self.fire_ids).await?;
            return Ok(());
        };

        // contacts deleted between schedule and fire simply drop out of
        // the loaded contact set inside the runner
        let contact_ids: Vec<_> = fires.iter().map(|f| f.contact_id).collect();
        runner::start_flow_for_contacts(
            &rt,
            &assets,
            &flow,
            &contact_ids,
            TriggerOrigin::Campaign { event_uuid: event.uuid },
            serde_json::Value::Null,
            StartOptions { interrupt: true, start_id: None, connection_id: None },
        )
        .await?;

        let handled: Vec<EventFireId> = fires.iter().map(|f| f.id).collect();
        campaigns::mark_fires_fired(&rt.db, &handled).await?;

        info!(org_id, event_id = event.id, fired = handled.len(), "campaign event fired");
        Ok(())
    }
}

/// Cron: sweeps due fires into fire tasks, grouped by event.
pub async fn queue_due_fires(rt: &Arc<Runtime>) -> Result<()> {
    let fires = campaigns::load_due_fires(&rt.db, 5000).await?;
    if fires.is_empty() {
        return Ok(());
    }

    // fires group under their event; each task carries one event's chunk
    let mut by_event: HashMap<CampaignEventId, Vec<&campaigns::EventFire>> = HashMap::new();
    for fire in &fires {
        by_event.entry(fire.event_id).or_default().push(fire);
    }

    for (event_id, event_fires) in by_event {
        let org_id = org_for_event(rt, event_id).await?;
        for chunk in event_fires.chunks(FIRES_PER_TASK) {
            let task = FireCampaignEventTask {
                campaign_event_id: event_id,
                fire_ids: chunk.iter().map(|f| f.id).collect(),
            };
            queue::push(
                &rt.db,
                queue::BATCH,
                org_id,
                Priority::Bulk,
                &TaskEnvelope::new(FIRE_CAMPAIGN_EVENT, org_id, serde_json::to_value(&task)?),
            )
            .await?;
        }
    }

    Ok(())
}

async fn org_for_event(rt: &Arc<Runtime>, event_id: CampaignEventId) -> Result<OrgId> {
    let row: Option<(OrgId,)> = sqlx::query_as(
        r#"
        SELECT c.org_id FROM campaigns c
         INNER JOIN campaign_events ce ON ce.campaign_id = c.id
         WHERE ce.id = $1
        "#,
    )
    .bind(event_id)
    .fetch_optional(&rt.db)
    .await?;
    row.map(|r| r.0)
        .ok_or_else(|| FlowhubError::AssetMissing(format!("no org for campaign event: {event_id}")))
}

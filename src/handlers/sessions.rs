//! Handler for sub-flow session triggers.

use async_trait::async_trait;
use tracing::debug;

use crate::assets::OrgAssets;
use crate::engine::Event;
use crate::error::{FlowhubError, Result};
use crate::hooks::{HookId, HookItem};
use crate::models::starts::{FlowStart, StartType};
use crate::runtime::Runtime;

use super::{EventHandler, Scene};

pub struct SessionTriggeredHandler;

#[async_trait]
impl EventHandler for SessionTriggeredHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::SessionTriggered { flow, contact_uuids, groups, run_summary } = event else {
            return Ok(());
        };

        let flow_asset = assets.flow_by_uuid(&flow.uuid).ok_or_else(|| {
            FlowhubError::AssetMissing(format!("unable to find flow with UUID: {}", flow.uuid))
        })?;
        debug!(contact_uuid = %scene.contact.uuid, flow = %flow_asset.name, "session triggered");

        let mut contact_ids = Vec::with_capacity(contact_uuids.len());
        for contact_uuid in contact_uuids {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM contacts WHERE org_id = $1 AND uuid = $2")
                    .bind(assets.org_id())
                    .bind(contact_uuid)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some((id,)) = row {
                contact_ids.push(id);
            }
        }

        let mut group_ids = Vec::with_capacity(groups.len());
        for group in groups {
            let asset = assets.group_by_uuid(&group.uuid).ok_or_else(|| {
                FlowhubError::AssetMissing(format!("unable to find group with UUID: {}", group.uuid))
            })?;
            group_ids.push(asset.id);
        }

        let mut start = FlowStart::new(assets.org_id(), StartType::FlowAction, flow_asset.id)
            .with_contact_ids(contact_ids)
            .with_group_ids(group_ids);
        start.params = run_summary.clone();

        // enqueued after commit so the child start only exists if this
        // sprint lands
        scene.stage_post(HookId::CommitSessionTriggers, HookItem::SessionTrigger(start));
        Ok(())
    }
}

//! Post-commit hook enqueueing the sub-flow starts a sprint triggered.

use async_trait::async_trait;
use tracing::info;

use crate::assets::OrgAssets;
use crate::error::Result;
use crate::queue::{self, Priority, TaskEnvelope};
use crate::runtime::Runtime;
use crate::tasks::starts::START_FLOW;

use super::{CommitHook, HookId, HookItem, SceneItems};

pub struct CommitSessionTriggersHook;

#[async_trait]
impl CommitHook for CommitSessionTriggersHook {
    fn id(&self) -> HookId {
        HookId::CommitSessionTriggers
    }

    async fn apply(
        &self,
        rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        for scene in scenes {
            for item in scene.items {
                if let HookItem::SessionTrigger(mut start) = item {
                    start.insert(&mut *tx).await?;
                    info!(
                        org_id = assets.org_id(),
                        flow_id = start.flow_id,
                        "queueing triggered flow start"
                    );
                    queue::push(
                        &rt.db,
                        queue::HANDLER,
                        assets.org_id(),
                        Priority::High,
                        &TaskEnvelope::new(START_FLOW, assets.org_id(), serde_json::to_value(&start)?),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

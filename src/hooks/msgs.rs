//! Hooks committing messages, label adds and broadcasts.

use async_trait::async_trait;

use crate::assets::OrgAssets;
use crate::error::{FlowhubError, Result, WrapErr};
use crate::models::msgs::{self, Broadcast, MsgLabelAdd};
use crate::models::topups;
use crate::runtime::Runtime;

use super::{CommitHook, HookId, HookItem, SceneItems};

/// Inserts all of a sprint's messages in one statement, allocating topup
/// credit when the org meters sending and resolving any engine-attached
/// labels.
pub struct CommitMessagesHook;

#[async_trait]
impl CommitHook for CommitMessagesHook {
    fn id(&self) -> HookId {
        HookId::CommitMessages
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut rows = Vec::new();
        for scene in scenes {
            for item in scene.items {
                if let HookItem::Msg(msg) = item {
                    rows.push(msg);
                }
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        if assets.org().config.uses_topups {
            let topup = topups::allocate_topup(&mut *tx, assets.org_id(), rows.len() as i64)
                .await
                .wrap_err("error allocating topup")?;
            if let Some(topup) = topup {
                for msg in &mut rows {
                    msg.topup_id = Some(topup);
                }
            }
        }

        msgs::insert_msgs(&mut *tx, &mut rows).await.wrap_err("error writing messages")?;

        // labels attached by the engine resolve against the snapshot and
        // land with the message ids we just got back
        let mut label_adds = Vec::new();
        for msg in &rows {
            for label_uuid in &msg.label_uuids {
                let label = assets.label_by_uuid(label_uuid).ok_or_else(|| {
                    FlowhubError::AssetMissing(format!(
                        "unable to find label with UUID: {label_uuid}"
                    ))
                })?;
                let msg_id = msg.id.ok_or_else(|| {
                    FlowhubError::Validation("message missing id after insert".to_string())
                })?;
                label_adds.push(MsgLabelAdd { msg_id, label_id: label.id });
            }
        }
        msgs::add_msg_labels(&mut *tx, &label_adds)
            .await
            .wrap_err("error adding labels to messages")?;

        Ok(())
    }
}

/// Applies label adds staged against already-persisted input messages.
pub struct CommitAddedLabelsHook;

#[async_trait]
impl CommitHook for CommitAddedLabelsHook {
    fn id(&self) -> HookId {
        HookId::CommitAddedLabels
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut adds = Vec::new();
        for scene in &scenes {
            for item in &scene.items {
                if let HookItem::LabelAdd { msg_id, label_id } = item {
                    adds.push(MsgLabelAdd { msg_id: *msg_id, label_id: *label_id });
                }
            }
        }
        msgs::add_msg_labels(tx, &adds).await
    }
}

/// Inserts broadcasts staged by the engine after the session commit.
pub struct CommitBroadcastsHook;

#[async_trait]
impl CommitHook for CommitBroadcastsHook {
    fn id(&self) -> HookId {
        HookId::CommitBroadcasts
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut broadcasts: Vec<Broadcast> = Vec::new();
        for scene in scenes {
            for item in scene.items {
                if let HookItem::Broadcast(broadcast) = item {
                    broadcasts.push(broadcast);
                }
            }
        }
        msgs::insert_broadcasts(tx, &broadcasts).await
    }
}

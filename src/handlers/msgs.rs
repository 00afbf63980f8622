//! Handlers for message and broadcast events.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::assets::OrgAssets;
use crate::engine::Event;
use crate::error::{FlowhubError, Result};
use crate::hooks::{HookId, HookItem};
use crate::models::msgs::{self, Broadcast};
use crate::models::urns::Urn;
use crate::models::Msg;
use crate::runtime::Runtime;

use super::{EventHandler, Scene};

/// Builds the message row for an outgoing engine message.
fn msg_for_event(assets: &OrgAssets, scene: &Scene, msg: &crate::engine::MsgOut) -> Msg {
    let channel_id = msg
        .channel
        .as_ref()
        .and_then(|c| assets.channel_by_uuid(&c.uuid))
        .map(|c| c.id);

    let mut row = Msg::out(
        assets.org_id(),
        scene.contact.id,
        msg.uuid,
        &msg.text,
        msg.urn.clone(),
        channel_id,
    );
    row.session_id = scene.session_id;
    row.attachments = msg.attachments.clone();
    row.quick_replies = msg.quick_replies.clone();
    row
}

pub struct MsgCreatedHandler;

#[async_trait]
impl EventHandler for MsgCreatedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::MsgCreated { msg } = event else { return Ok(()) };
        debug!(contact_uuid = %scene.contact.uuid, text = %msg.text, "msg created");

        scene.stage_pre(HookId::CommitMessages, HookItem::Msg(msg_for_event(assets, scene, msg)));
        Ok(())
    }
}

pub struct IvrCreatedHandler;

#[async_trait]
impl EventHandler for IvrCreatedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::IvrCreated { msg } = event else { return Ok(()) };

        let mut row = msg_for_event(assets, scene, msg);
        row.connection_id = scene.connection_id();
        scene.stage_pre(HookId::CommitMessages, HookItem::Msg(row));
        Ok(())
    }
}

pub struct MsgReceivedHandler;

#[async_trait]
impl EventHandler for MsgReceivedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::MsgReceived { msg_uuid, text, urn } = event else { return Ok(()) };

        // surveyor sessions deliver their incoming messages as events; for
        // everything else the gateway already wrote the row
        if scene.incoming_msg_id.is_some() {
            return Ok(());
        }

        let mut row = Msg::out(assets.org_id(), scene.contact.id, *msg_uuid, text, urn.clone(), None);
        row.direction = msgs::MsgDirection::In.code().to_string();
        row.status = "H".to_string();
        row.session_id = scene.session_id;
        scene.stage_pre(HookId::CommitMessages, HookItem::Msg(row));
        Ok(())
    }
}

/// Before the session is written, a received message updates the
/// contact's last seen and is cached on the scene for label resolution.
pub struct MsgReceivedPreWriteHandler;

#[async_trait]
impl EventHandler for MsgReceivedPreWriteHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::MsgReceived { .. } = event else { return Ok(()) };
        scene.stage_pre(HookId::ContactLastSeen, HookItem::LastSeen(chrono::Utc::now()));
        Ok(())
    }
}

pub struct InputLabelsAddedHandler;

#[async_trait]
impl EventHandler for InputLabelsAddedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::InputLabelsAdded { input_uuid, labels } = event else { return Ok(()) };

        if scene.session_id.is_none() {
            return Err(FlowhubError::Validation("cannot add label, not in a session".to_string()));
        }
        debug!(contact_uuid = %scene.contact.uuid, labels = labels.len(), "input labels added");

        // the sprint's incoming message id is cached on the session; fall
        // back to resolving the engine's message uuid
        let input_msg_id = match scene.incoming_msg_id {
            Some(id) => id,
            None => msgs::id_for_uuid(&mut *tx, assets.org_id(), *input_uuid)
                .await?
                .ok_or_else(|| {
                    FlowhubError::Validation(format!("unable to find input message: {input_uuid}"))
                })?,
        };

        for label in labels {
            let asset = assets.label_by_uuid(&label.uuid).ok_or_else(|| {
                FlowhubError::AssetMissing(format!("unable to find label with UUID: {}", label.uuid))
            })?;
            scene.stage_pre(
                HookId::CommitAddedLabels,
                HookItem::LabelAdd { msg_id: input_msg_id, label_id: asset.id },
            );
        }

        Ok(())
    }
}

pub struct BroadcastCreatedHandler;

#[async_trait]
impl EventHandler for BroadcastCreatedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::BroadcastCreated { translations, base_language, contact_uuids, groups, urns } =
            event
        else {
            return Ok(());
        };

        // resolve contact references to row ids now so the commit is pure
        let mut contact_ids = Vec::with_capacity(contact_uuids.len());
        for contact_uuid in contact_uuids {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM contacts WHERE org_id = $1 AND uuid = $2")
                    .bind(assets.org_id())
                    .bind(contact_uuid)
                    .fetch_optional(&mut *tx)
                    .await?;
            match row {
                Some((id,)) => contact_ids.push(id),
                None => warn!(%contact_uuid, "broadcast recipient no longer exists"),
            }
        }

        let mut group_ids = Vec::with_capacity(groups.len());
        for group in groups {
            let asset = assets.group_by_uuid(&group.uuid).ok_or_else(|| {
                FlowhubError::AssetMissing(format!("unable to find group with UUID: {}", group.uuid))
            })?;
            group_ids.push(asset.id);
        }

        let parsed_urns: Result<Vec<Urn>> = urns.iter().map(|u| Urn::parse(u)).collect();
        let urns: Vec<String> = parsed_urns?.iter().map(|u| u.identity()).collect();

        scene.stage_post(
            HookId::CommitBroadcasts,
            HookItem::Broadcast(Broadcast {
                org_id: assets.org_id(),
                translations: serde_json::to_value(translations)?,
                base_language: base_language.clone(),
                contact_ids,
                group_ids,
                urns,
                ticket_id: None,
            }),
        );
        Ok(())
    }
}

pub struct EmailSentHandler;

#[async_trait]
impl EventHandler for EmailSentHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::EmailSent { to, subject, .. } = event else { return Ok(()) };
        // delivery already happened inside the engine's email service
        debug!(contact_uuid = %scene.contact.uuid, to = ?to, subject = %subject, "email sent");
        Ok(())
    }
}

/// Error and failure events carry no work; they are logged for operators.
pub struct LoggedEventHandler;

#[async_trait]
impl EventHandler for LoggedEventHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        match event {
            Event::Error { text } => {
                warn!(contact_uuid = %scene.contact.uuid, text = %text, "flow error")
            }
            Event::Failure { text } => {
                warn!(contact_uuid = %scene.contact.uuid, text = %text, "flow failure")
            }
            _ => {}
        }
        Ok(())
    }
}

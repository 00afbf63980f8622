//! Event handlers: the translation from interpreter events to staged
//! database work.
//!
//! Each engine event kind maps to at most one handler. Handlers do no
//! writes of their own; beyond the reads needed to turn UUIDs into row
//! ids they only stage items onto the scene's commit hooks, which the
//! pipeline applies in bulk.

mod contacts;
mod msgs;
mod sessions;
mod tickets;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::engine::Event;
use crate::error::{FlowhubError, Result, WrapErr};
use crate::hooks::{HookId, HookItem};
use crate::models::{Contact, MsgId, Session, SessionId};
use crate::runtime::Runtime;

pub use contacts::*;
pub use msgs::*;
pub use sessions::*;
pub use tickets::*;

/// Per-contact staging area binding one sprint's events to pending
/// database work. Lives for one sprint and is never persisted.
pub struct Scene {
    pub contact: Contact,
    pub session_id: Option<SessionId>,
    pub session_uuid: Option<Uuid>,
    /// id of the incoming message that started/resumed the sprint, if any
    pub incoming_msg_id: Option<MsgId>,
    /// the voice connection the session is attached to, if any
    connection_id: Option<crate::models::ConnectionId>,

    pre_commits: HashMap<HookId, Vec<HookItem>>,
    post_commits: HashMap<HookId, Vec<HookItem>>,
}

impl Scene {
    pub fn for_contact(contact: Contact) -> Scene {
        Scene {
            contact,
            session_id: None,
            session_uuid: None,
            incoming_msg_id: None,
            connection_id: None,
            pre_commits: HashMap::new(),
            post_commits: HashMap::new(),
        }
    }

    pub fn for_session(contact: Contact, session: &Session) -> Scene {
        Scene {
            contact,
            session_id: Some(session.id),
            session_uuid: Some(session.uuid),
            incoming_msg_id: session.incoming_msg_id,
            connection_id: session.connection_id,
            pre_commits: HashMap::new(),
            post_commits: HashMap::new(),
        }
    }

    pub fn connection_id(&self) -> Option<crate::models::ConnectionId> {
        self.connection_id
    }

    /// Stages an item for a pre-commit hook.
    pub fn stage_pre(&mut self, hook: HookId, item: HookItem) {
        self.pre_commits.entry(hook).or_default().push(item);
    }

    /// Stages an item for a post-commit hook.
    pub fn stage_post(&mut self, hook: HookId, item: HookItem) {
        self.post_commits.entry(hook).or_default().push(item);
    }

    pub fn pre_commits(&self) -> &HashMap<HookId, Vec<HookItem>> {
        &self.pre_commits
    }

    pub fn post_commits(&self) -> &HashMap<HookId, Vec<HookItem>> {
        &self.post_commits
    }

    pub(crate) fn take_pre_commits(&mut self) -> HashMap<HookId, Vec<HookItem>> {
        std::mem::take(&mut self.pre_commits)
    }

    pub(crate) fn take_post_commits(&mut self) -> HashMap<HookId, Vec<HookItem>> {
        std::mem::take(&mut self.post_commits)
    }
}

/// A handler for one engine event kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()>;
}

/// Maps event kinds to handlers. Populated once at the wiring point;
/// registering two handlers for a kind is a programming error.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
    pre_write: HashMap<&'static str, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: HashMap::new(),
            pre_write: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, handler: Arc<dyn EventHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            panic!("duplicate event handler registered for type: {kind}");
        }
    }

    /// Registers a handler invoked before the session is written, for
    /// events whose meaning depends on pre-write state.
    pub fn register_pre_write(&mut self, kind: &'static str, handler: Arc<dyn EventHandler>) {
        if self.pre_write.insert(kind, handler).is_some() {
            panic!("duplicate pre-write handler registered for type: {kind}");
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

/// Dispatches each event to its handler in emission order, staging the
/// resulting work on the scene.
pub async fn handle_events(
    rt: &Runtime,
    tx: &mut sqlx::PgConnection,
    assets: &OrgAssets,
    scene: &mut Scene,
    events: &[Event],
) -> Result<()> {
    for event in events {
        let handler = rt
            .handlers
            .handlers
            .get(event.kind())
            .ok_or_else(|| {
                FlowhubError::Validation(format!(
                    "unable to find handler for event type: {}",
                    event.kind()
                ))
            })?
            .clone();

        handler
            .handle(rt, tx, assets, scene, event)
            .await
            .wrap_err(format!("error handling event: {}", event.kind()))?;
    }
    Ok(())
}

/// Applies the pre-write handler for an event if one exists; unlike the
/// main registry, absence is not an error.
pub async fn apply_pre_write_event(
    rt: &Runtime,
    tx: &mut sqlx::PgConnection,
    assets: &OrgAssets,
    scene: &mut Scene,
    event: &Event,
) -> Result<()> {
    let Some(handler) = rt.handlers.pre_write.get(event.kind()).cloned() else {
        return Ok(());
    };
    handler.handle(rt, tx, assets, scene, event).await
}

/// Registers every handler. Called from the single wiring point.
pub fn wire(registry: &mut HandlerRegistry) {
    registry.register("msg_created", Arc::new(MsgCreatedHandler));
    registry.register("msg_received", Arc::new(MsgReceivedHandler));
    registry.register("ivr_created", Arc::new(IvrCreatedHandler));
    registry.register("contact_name_changed", Arc::new(ContactNameChangedHandler));
    registry.register("contact_language_changed", Arc::new(ContactLanguageChangedHandler));
    registry.register("contact_status_changed", Arc::new(ContactStatusChangedHandler));
    registry.register("contact_timezone_changed", Arc::new(ContactTimezoneChangedHandler));
    registry.register("contact_field_changed", Arc::new(ContactFieldChangedHandler));
    registry.register("contact_groups_changed", Arc::new(ContactGroupsChangedHandler));
    registry.register("contact_urns_changed", Arc::new(ContactUrnsChangedHandler));
    registry.register("input_labels_added", Arc::new(InputLabelsAddedHandler));
    registry.register("broadcast_created", Arc::new(BroadcastCreatedHandler));
    registry.register("session_triggered", Arc::new(SessionTriggeredHandler));
    registry.register("ticket_opened", Arc::new(TicketOpenedHandler));
    registry.register("airtime_transferred", Arc::new(AirtimeTransferredHandler));
    registry.register("email_sent", Arc::new(EmailSentHandler));
    registry.register("error", Arc::new(LoggedEventHandler));
    registry.register("failure", Arc::new(LoggedEventHandler));

    registry.register_pre_write("msg_received", Arc::new(MsgReceivedPreWriteHandler));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contacts::ContactStatus;
    use chrono::Utc;

    pub(crate) fn test_contact(id: i64) -> Contact {
        Contact {
            id,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: Some("Cathy".to_string()),
            language: None,
            status: ContactStatus::Active,
            timezone: None,
            created_on: Utc::now(),
            last_seen_on: None,
            urns: vec![],
            fields: HashMap::new(),
            group_ids: vec![],
        }
    }

    #[test]
    fn scene_staging_accumulates_in_order() {
        let mut scene = Scene::for_contact(test_contact(1));
        scene.stage_pre(HookId::CommitNameChanges, HookItem::NameChange("Kathy".to_string()));
        scene.stage_pre(HookId::CommitNameChanges, HookItem::NameChange("Cat".to_string()));
        scene.stage_post(HookId::CommitSessionTriggers, HookItem::Modified);

        assert_eq!(scene.pre_commits()[&HookId::CommitNameChanges].len(), 2);
        assert_eq!(scene.post_commits().len(), 1);

        // order within a hook is emission order
        match &scene.pre_commits()[&HookId::CommitNameChanges][1] {
            HookItem::NameChange(name) => assert_eq!(name, "Cat"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "duplicate event handler")]
    fn duplicate_handler_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register("msg_created", Arc::new(MsgCreatedHandler));
        registry.register("msg_created", Arc::new(MsgCreatedHandler));
    }
}

//! Commit hooks: batched database mutations applied once per sprint.
//!
//! Handlers stage work onto scenes keyed by `HookId`; after a batch of
//! sprints the pipeline groups staged items by hook across scenes and
//! applies every pre-commit hook inside one transaction, commits, then
//! runs post-commit hooks in a second transaction. A hook never loops
//! one row per contact: each `apply` is one bulk mutation.

mod contacts;
mod logs;
mod msgs;
mod sessions;
mod tickets;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::error::{Result, WrapErr};
use crate::handlers::Scene;
use crate::models::contacts::ContactStatus;
use crate::models::fields::FieldValue;
use crate::models::msgs::Broadcast;
use crate::models::tickets::TicketEventType;
use crate::models::urns::Urn;
use crate::models::{
    ContactId, FieldId, FlowStart, GroupId, HttpLog, LabelId, Msg, MsgId, SessionId, Ticket,
};
use crate::runtime::Runtime;

pub use contacts::*;
pub use logs::*;
pub use msgs::*;
pub use sessions::*;
pub use tickets::*;

/// Identity of a batched commit operation. First-class values, not
/// strings: handlers stage against these and the pipeline orders by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookId {
    CommitMessages,
    CommitNameChanges,
    CommitLanguageChanges,
    CommitStatusChanges,
    CommitTimezoneChanges,
    CommitFieldChanges,
    CommitGroupChanges,
    CommitUrnChanges,
    CommitAddedLabels,
    CommitTickets,
    CommitTicketEvents,
    CommitHttpLogs,
    CommitAirtimeTransfers,
    CommitBroadcasts,
    CommitSessionTriggers,
    UpdateCampaignFires,
    ContactModified,
    ContactLastSeen,
}

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookId::CommitMessages => "commit_messages",
            HookId::CommitNameChanges => "commit_name_changes",
            HookId::CommitLanguageChanges => "commit_language_changes",
            HookId::CommitStatusChanges => "commit_status_changes",
            HookId::CommitTimezoneChanges => "commit_timezone_changes",
            HookId::CommitFieldChanges => "commit_field_changes",
            HookId::CommitGroupChanges => "commit_group_changes",
            HookId::CommitUrnChanges => "commit_urn_changes",
            HookId::CommitAddedLabels => "commit_added_labels",
            HookId::CommitTickets => "commit_tickets",
            HookId::CommitTicketEvents => "commit_ticket_events",
            HookId::CommitHttpLogs => "commit_http_logs",
            HookId::CommitAirtimeTransfers => "commit_airtime_transfers",
            HookId::CommitBroadcasts => "commit_broadcasts",
            HookId::CommitSessionTriggers => "commit_session_triggers",
            HookId::UpdateCampaignFires => "update_campaign_fires",
            HookId::ContactModified => "contact_modified",
            HookId::ContactLastSeen => "contact_last_seen",
        };
        f.write_str(name)
    }
}

/// A staged airtime transfer row.
#[derive(Debug, Clone)]
pub struct AirtimeTransfer {
    pub sender: String,
    pub recipient: String,
    pub currency: String,
    pub desired_amount: f64,
    pub actual_amount: f64,
}

/// One staged unit of work. Each hook consumes the variants it expects.
#[derive(Debug, Clone)]
pub enum HookItem {
    Msg(Msg),
    NameChange(String),
    LanguageChange(String),
    StatusChange(ContactStatus),
    TimezoneChange(Option<String>),
    FieldChange { field_id: FieldId, field_uuid: Uuid, value: Option<FieldValue> },
    GroupAdd(GroupId),
    GroupRemove(GroupId),
    UrnsChange(Vec<Urn>),
    LabelAdd { msg_id: MsgId, label_id: LabelId },
    Ticket(SharedTicket),
    TicketEvent { ticket: SharedTicket, event_type: TicketEventType },
    HttpLog(HttpLog),
    AirtimeTransfer(AirtimeTransfer),
    Broadcast(Broadcast),
    SessionTrigger(FlowStart),
    LastSeen(DateTime<Utc>),
    Modified,
}

/// Tickets are staged by two hooks: the insert fills in the row id, the
/// events hook reads it back, so they share the row.
pub type SharedTicket = Arc<Mutex<Ticket>>;

/// A scene's identity plus the items it staged for one hook.
#[derive(Debug)]
pub struct SceneItems {
    pub contact_id: ContactId,
    pub contact_uuid: Uuid,
    pub session_id: Option<SessionId>,
    pub items: Vec<HookItem>,
}

/// A batched commit operation.
#[async_trait]
pub trait CommitHook: Send + Sync {
    fn id(&self) -> HookId;

    /// Hooks whose output this hook reads; the pipeline sorts so they
    /// apply first.
    fn depends_on(&self) -> &[HookId] {
        &[]
    }

    async fn apply(
        &self,
        rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()>;
}

/// Registration-ordered hook registry with dependency-aware ordering.
pub struct HookRegistry {
    hooks: Vec<Arc<dyn CommitHook>>,
}

impl HookRegistry {
    pub fn new() -> HookRegistry {
        HookRegistry { hooks: Vec::new() }
    }

    /// Registers a hook; registering the same id twice is a programming
    /// error.
    pub fn register(&mut self, hook: Arc<dyn CommitHook>) {
        if self.hooks.iter().any(|h| h.id() == hook.id()) {
            panic!("duplicate commit hook registered: {}", hook.id());
        }
        self.hooks.push(hook);
    }

    pub fn get(&self, id: HookId) -> Option<Arc<dyn CommitHook>> {
        self.hooks.iter().find(|h| h.id() == id).cloned()
    }

    /// The subset of registered hooks in `active`, in a stable order:
    /// declared dependencies first, registration order breaking ties.
    pub fn ordered(&self, active: &HashSet<HookId>) -> Vec<Arc<dyn CommitHook>> {
        let mut ordered = Vec::new();
        let mut placed: HashSet<HookId> = HashSet::new();

        // registration order is the scheduling order; a hook waits until
        // its active dependencies have been placed
        let pending: Vec<_> = self.hooks.iter().filter(|h| active.contains(&h.id())).collect();
        let mut remaining = pending.clone();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|hook| {
                let ready = hook
                    .depends_on()
                    .iter()
                    .all(|dep| !active.contains(dep) || placed.contains(dep));
                if ready {
                    placed.insert(hook.id());
                    ordered.push(Arc::clone(hook));
                }
                !ready
            });
            if remaining.len() == before {
                // dependency cycle would be a wiring bug
                panic!("commit hook dependency cycle involving: {}", remaining[0].id());
            }
        }

        ordered
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        HookRegistry::new()
    }
}

/// Registers every hook. Called from the single wiring point.
pub fn wire(registry: &mut HookRegistry) {
    registry.register(Arc::new(CommitMessagesHook));
    registry.register(Arc::new(CommitNameChangesHook));
    registry.register(Arc::new(CommitLanguageChangesHook));
    registry.register(Arc::new(CommitStatusChangesHook));
    registry.register(Arc::new(CommitTimezoneChangesHook));
    registry.register(Arc::new(CommitFieldChangesHook));
    registry.register(Arc::new(CommitGroupChangesHook));
    registry.register(Arc::new(CommitUrnChangesHook));
    registry.register(Arc::new(CommitAddedLabelsHook));
    registry.register(Arc::new(CommitTicketsHook));
    registry.register(Arc::new(CommitTicketEventsHook));
    registry.register(Arc::new(CommitHttpLogsHook));
    registry.register(Arc::new(CommitAirtimeTransfersHook));
    registry.register(Arc::new(CommitBroadcastsHook));
    registry.register(Arc::new(CommitSessionTriggersHook));
    registry.register(Arc::new(UpdateCampaignFiresHook));
    registry.register(Arc::new(ContactModifiedHook));
    registry.register(Arc::new(ContactLastSeenHook));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pre,
    Post,
}

/// Unions one phase's staged items across scenes, grouped by hook.
fn group_scenes(scenes: &mut [Scene], phase: Phase) -> HashMap<HookId, Vec<SceneItems>> {
    let mut grouped: HashMap<HookId, Vec<SceneItems>> = HashMap::new();
    for scene in scenes {
        let staged = match phase {
            Phase::Pre => scene.take_pre_commits(),
            Phase::Post => scene.take_post_commits(),
        };
        for (hook, items) in staged {
            grouped.entry(hook).or_default().push(SceneItems {
                contact_id: scene.contact.id,
                contact_uuid: scene.contact.uuid,
                session_id: scene.session_id,
                items,
            });
        }
    }
    grouped
}

/// Runs the full two-phase pipeline for a batch of scenes.
///
/// Pre-commit hooks share one transaction with whatever the caller staged
/// before (session rows); any failure rolls the sprint back whole. Post
/// commit hooks run in a second transaction; failures there are counted
/// and surfaced but the durable state stays.
pub async fn apply_scenes(rt: &Runtime, assets: &OrgAssets, scenes: &mut [Scene]) -> Result<()> {
    apply_pre_commit_in_tx(rt, assets, scenes, None).await?;
    apply_post_commit(rt, assets, scenes).await
}

/// Applies pre-commit hooks, reusing the caller's transaction when given
/// one (the session runner already has the session rows in it).
pub async fn apply_pre_commit_in_tx(
    rt: &Runtime,
    assets: &OrgAssets,
    scenes: &mut [Scene],
    tx: Option<&mut sqlx::PgConnection>,
) -> Result<()> {
    let grouped = group_scenes(scenes, Phase::Pre);
    if grouped.is_empty() {
        return Ok(());
    }

    match tx {
        Some(tx) => apply_phase(rt, assets, tx, grouped, Phase::Pre).await,
        None => {
            let mut tx = rt.db.begin().await?;
            apply_phase(rt, assets, &mut tx, grouped, Phase::Pre).await?;
            tx.commit().await.wrap_err("error committing pre commit hooks")?;
            Ok(())
        }
    }
}

/// Applies post-commit hooks in their own transaction.
pub async fn apply_post_commit(
    rt: &Runtime,
    assets: &OrgAssets,
    scenes: &mut [Scene],
) -> Result<()> {
    let grouped = group_scenes(scenes, Phase::Post);
    if grouped.is_empty() {
        return Ok(());
    }

    let result: Result<()> = async {
        let mut tx = rt.db.begin().await?;
        apply_phase(rt, assets, &mut tx, grouped, Phase::Post).await?;
        tx.commit().await.wrap_err("error committing post commit hooks")?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        // pre-commit work is durable; callers re-drive from it on the
        // next wake rather than rolling anything back
        rt.stats.record_post_commit_failure();
        error!(error = %err, "error applying post commit hooks");
        return Err(err);
    }
    Ok(())
}

async fn apply_phase(
    rt: &Runtime,
    assets: &OrgAssets,
    tx: &mut sqlx::PgConnection,
    mut grouped: HashMap<HookId, Vec<SceneItems>>,
    phase: Phase,
) -> Result<()> {
    let active: HashSet<HookId> = grouped.keys().copied().collect();

    for hook in rt.hooks.ordered(&active) {
        let scenes = grouped.remove(&hook.id()).unwrap_or_default();
        let label = match phase {
            Phase::Pre => "pre",
            Phase::Post => "post",
        };
        hook.apply(rt, tx, assets, scenes)
            .await
            .wrap_err(format!("error applying {label} commit hook: {}", hook.id()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHook(HookId, &'static [HookId]);

    #[async_trait]
    impl CommitHook for NoopHook {
        fn id(&self) -> HookId {
            self.0
        }

        fn depends_on(&self) -> &[HookId] {
            self.1
        }

        async fn apply(
            &self,
            _rt: &Runtime,
            _tx: &mut sqlx::PgConnection,
            _assets: &OrgAssets,
            _scenes: Vec<SceneItems>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ordering_respects_registration_and_dependencies() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(NoopHook(HookId::CommitTicketEvents, &[HookId::CommitTickets])));
        registry.register(Arc::new(NoopHook(HookId::CommitMessages, &[])));
        registry.register(Arc::new(NoopHook(HookId::CommitTickets, &[])));

        let active: HashSet<HookId> = [
            HookId::CommitTicketEvents,
            HookId::CommitMessages,
            HookId::CommitTickets,
        ]
        .into_iter()
        .collect();

        let ordered: Vec<HookId> = registry.ordered(&active).iter().map(|h| h.id()).collect();
        // ticket events waits for tickets; messages keeps registration order
        assert_eq!(
            ordered,
            vec![HookId::CommitMessages, HookId::CommitTickets, HookId::CommitTicketEvents]
        );
    }

    #[test]
    fn ordering_ignores_inactive_dependencies() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(NoopHook(HookId::CommitTicketEvents, &[HookId::CommitTickets])));

        let active: HashSet<HookId> = [HookId::CommitTicketEvents].into_iter().collect();
        let ordered = registry.ordered(&active);
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate commit hook")]
    fn duplicate_registration_panics() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(NoopHook(HookId::CommitMessages, &[])));
        registry.register(Arc::new(NoopHook(HookId::CommitMessages, &[])));
    }
}

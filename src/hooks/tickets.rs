//! Hooks committing tickets and their lifecycle events. The events hook
//! reads ids the insert hook produced, declared as a dependency so the
//! pipeline orders them.

use async_trait::async_trait;

use crate::assets::OrgAssets;
use crate::error::{FlowhubError, Result};
use crate::models::tickets::{self, TicketEvent};
use crate::runtime::Runtime;

use super::{CommitHook, HookId, HookItem, SceneItems};

pub struct CommitTicketsHook;

#[async_trait]
impl CommitHook for CommitTicketsHook {
    fn id(&self) -> HookId {
        HookId::CommitTickets
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let shared: Vec<_> = scenes
            .iter()
            .flat_map(|scene| scene.items.iter())
            .filter_map(|item| match item {
                HookItem::Ticket(ticket) => Some(ticket.clone()),
                _ => None,
            })
            .collect();
        if shared.is_empty() {
            return Ok(());
        }

        let mut rows: Vec<_> = shared.iter().map(|t| t.lock().unwrap().clone()).collect();
        tickets::insert_tickets(tx, &mut rows).await?;

        // write ids back into the shared rows for the events hook
        for (ticket, row) in shared.iter().zip(rows) {
            ticket.lock().unwrap().id = row.id;
        }
        Ok(())
    }
}

pub struct CommitTicketEventsHook;

#[async_trait]
impl CommitHook for CommitTicketEventsHook {
    fn id(&self) -> HookId {
        HookId::CommitTicketEvents
    }

    fn depends_on(&self) -> &[HookId] {
        &[HookId::CommitTickets]
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut events = Vec::new();
        for scene in &scenes {
            for item in &scene.items {
                if let HookItem::TicketEvent { ticket, event_type } = item {
                    let ticket = ticket.lock().unwrap();
                    let ticket_id = ticket.id.ok_or_else(|| {
                        FlowhubError::Validation("ticket missing id after insert".to_string())
                    })?;
                    events.push(TicketEvent {
                        org_id: ticket.org_id,
                        ticket_id,
                        contact_id: ticket.contact_id,
                        event_type: *event_type,
                    });
                }
            }
        }

        tickets::insert_ticket_events(tx, &events).await
    }
}

//! Handlers for ticket and airtime events. The ticket handler is the one
//! place a handler performs vendor I/O: the open call has to happen during
//! the sprint so its outcome (external id, HTTP logs) can be staged.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::assets::OrgAssets;
use crate::engine::Event;
use crate::engine::UuidGenerator;
use crate::error::{FlowhubError, Result, WrapErr};
use crate::hooks::{AirtimeTransfer, HookId, HookItem};
use crate::models::http_logs::{HttpLog, HttpLogType};
use crate::models::tickets::{Ticket, TicketEventType};
use crate::runtime::Runtime;
use crate::services::tickets::TicketService;

use super::{EventHandler, Scene};

pub struct TicketOpenedHandler;

#[async_trait]
impl EventHandler for TicketOpenedHandler {
    async fn handle(
        &self,
        rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::TicketOpened { ticketer, subject, body } = event else { return Ok(()) };

        let asset = assets.ticketer_by_uuid(&ticketer.uuid).ok_or_else(|| {
            FlowhubError::AssetMissing(format!(
                "unable to find ticketer with UUID: {}",
                ticketer.uuid
            ))
        })?;
        debug!(contact_uuid = %scene.contact.uuid, ticketer = %asset.name, "ticket opened");

        let service = rt.ticket_services.create(rt, &asset)?;

        let mut traces = Vec::new();
        let opened = service
            .open(&scene.contact, subject, body, &mut traces)
            .await
            .wrap_err(format!("error opening ticket on {}", asset.name));

        // the vendor exchange is staged win or lose
        for trace in traces {
            scene.stage_pre(
                HookId::CommitHttpLogs,
                HookItem::HttpLog(HttpLog {
                    org_id: assets.org_id(),
                    log_type: HttpLogType::Ticketer,
                    url: trace.url,
                    status_code: trace.status_code,
                    request: trace.request,
                    response: trace.response,
                    elapsed_ms: trace.elapsed_ms,
                    is_error: trace.status_code < 200 || trace.status_code >= 300,
                    created_on: Utc::now(),
                    ticketer_id: Some(asset.id),
                    channel_id: None,
                }),
            );
        }
        let opened = opened?;

        let mut ticket = Ticket::new(
            rt.uuids.next(),
            assets.org_id(),
            scene.contact.id,
            asset.id,
            subject,
            body,
        );
        ticket.external_id = opened.external_id;
        ticket.config = opened.config;

        let shared = Arc::new(Mutex::new(ticket));
        scene.stage_pre(HookId::CommitTickets, HookItem::Ticket(shared.clone()));
        scene.stage_pre(
            HookId::CommitTicketEvents,
            HookItem::TicketEvent { ticket: shared, event_type: TicketEventType::Opened },
        );
        Ok(())
    }
}

pub struct AirtimeTransferredHandler;

#[async_trait]
impl EventHandler for AirtimeTransferredHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::AirtimeTransferred {
            sender,
            recipient,
            currency,
            desired_amount,
            actual_amount,
            http_logs,
        } = event
        else {
            return Ok(());
        };

        scene.stage_pre(
            HookId::CommitAirtimeTransfers,
            HookItem::AirtimeTransfer(AirtimeTransfer {
                sender: sender.clone(),
                recipient: recipient.clone(),
                currency: currency.clone(),
                desired_amount: *desired_amount,
                actual_amount: *actual_amount,
            }),
        );

        // the engine already made the vendor calls; persist their traces
        for log in http_logs {
            scene.stage_pre(
                HookId::CommitHttpLogs,
                HookItem::HttpLog(HttpLog {
                    org_id: assets.org_id(),
                    log_type: HttpLogType::Airtime,
                    url: log.url.clone(),
                    status_code: log.status_code,
                    request: log.request.clone(),
                    response: log.response.clone(),
                    elapsed_ms: log.elapsed_ms,
                    is_error: log.status_code < 200 || log.status_code >= 300,
                    created_on: Utc::now(),
                    ticketer_id: None,
                    channel_id: None,
                }),
            );
        }
        Ok(())
    }
}

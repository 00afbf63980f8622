//! Inbound ticket webhooks: a reply typed in the vendor's UI comes back
//! here and is forwarded to the contact as a broadcast.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::models::msgs::{self, Broadcast};
use crate::models::tickets::{self, Ticket, TicketStatus};
use crate::models::OrgId;

use super::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ReceiveRequest {
    pub org_id: OrgId,
    pub ticket: Uuid,
    pub message: String,
    /// a CLOSE command from the agent closes instead of replying
    #[serde(default)]
    pub close: bool,
}

/// `POST /fh/ticket/{service}/receive`
pub async fn handle_receive(
    State(rt): State<AppState>,
    Path(service): Path<String>,
    Json(receive): Json<ReceiveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let assets = rt.cache.get(&rt.db, receive.org_id).await?;

    let ticket = Ticket::load_by_uuid(&rt.db, receive.org_id, receive.ticket)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no such ticket: {}", receive.ticket)))?;
    let ticket_id = ticket
        .id
        .ok_or_else(|| ApiError::not_found(format!("no such ticket: {}", receive.ticket)))?;

    // the webhook path names the service; reject mismatched deliveries
    let ticketer = assets
        .ticketer(ticket.ticketer_id)
        .ok_or_else(|| ApiError::not_found("ticketer is gone".to_string()))?;
    if ticketer.ticketer_type != service {
        return Err(ApiError::bad_request(format!(
            "ticket does not belong to service: {service}"
        )));
    }

    if receive.close {
        tickets::update_ticket_statuses(&rt.db, &[ticket_id], TicketStatus::Closed).await?;
        return Ok(Json(json!({"status": "closed"})));
    }

    // an agent replying to a closed ticket reopens it
    if ticket.status == TicketStatus::Closed {
        tickets::update_ticket_statuses(&rt.db, &[ticket_id], TicketStatus::Open).await?;
    }

    let mut conn = rt.db.acquire().await?;
    msgs::insert_broadcasts(
        &mut *conn,
        &[Broadcast {
            org_id: receive.org_id,
            translations: json!({assets.org().config.default_language.as_str(): receive.message}),
            base_language: assets.org().config.default_language.clone(),
            contact_ids: vec![ticket.contact_id],
            group_ids: vec![],
            urns: vec![],
            ticket_id: Some(ticket_id),
        }],
    )
    .await?;

    Ok(Json(json!({"status": "forwarded"})))
}

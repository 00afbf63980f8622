//! Ticketers and the support tickets they manage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::Result;

use super::{ContactId, OrgId, TicketId, TicketerId, UserId};

/// A configured external support system.
#[derive(Debug, Clone, FromRow)]
pub struct Ticketer {
    pub id: TicketerId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    /// service type key the dispatch registry resolves, e.g. "mailgun"
    pub ticketer_type: String,
    #[sqlx(json)]
    pub config: HashMap<String, String>,
}

impl Ticketer {
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub async fn load_for_org(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Vec<Ticketer>> {
        let ticketers = sqlx::query_as::<_, Ticketer>(
            "SELECT id, uuid, org_id, name, ticketer_type, config FROM ticketers WHERE org_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(db)
        .await?;
        Ok(ticketers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    pub fn code(&self) -> &'static str {
        match self {
            TicketStatus::Open => "O",
            TicketStatus::Closed => "C",
        }
    }
}

/// A support thread tied to a contact and a ticketer.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: Option<TicketId>,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub ticketer_id: TicketerId,
    pub external_id: Option<String>,
    pub status: TicketStatus,
    pub subject: String,
    pub body: String,
    pub assignee_id: Option<UserId>,
    pub config: HashMap<String, String>,
}

impl Ticket {
    pub fn new(
        uuid: Uuid,
        org_id: OrgId,
        contact_id: ContactId,
        ticketer_id: TicketerId,
        subject: &str,
        body: &str,
    ) -> Ticket {
        Ticket {
            id: None,
            uuid,
            org_id,
            contact_id,
            ticketer_id,
            external_id: None,
            status: TicketStatus::Open,
            subject: subject.to_string(),
            body: body.to_string(),
            assignee_id: None,
            config: HashMap::new(),
        }
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    pub async fn load_by_uuid(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        uuid: Uuid,
    ) -> Result<Option<Ticket>> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, org_id, contact_id, ticketer_id, external_id, status, subject, body, assignee_id, config
              FROM tickets WHERE org_id = $1 AND uuid = $2
            "#,
        )
        .bind(org_id)
        .bind(uuid)
        .fetch_optional(db)
        .await?;

        Ok(row.map(|row| {
            let status: String = row.get("status");
            let config: Option<serde_json::Value> = row.get("config");
            Ticket {
                id: Some(row.get("id")),
                uuid: row.get("uuid"),
                org_id: row.get("org_id"),
                contact_id: row.get("contact_id"),
                ticketer_id: row.get("ticketer_id"),
                external_id: row.get("external_id"),
                status: if status == "C" { TicketStatus::Closed } else { TicketStatus::Open },
                subject: row.get("subject"),
                body: row.get("body"),
                assignee_id: row.get("assignee_id"),
                config: config
                    .and_then(|c| serde_json::from_value(c).ok())
                    .unwrap_or_default(),
            }
        }))
    }
}

/// Bulk inserts tickets opened this sprint, filling in their ids.
pub async fn insert_tickets(db: &mut sqlx::PgConnection, tickets: &mut [Ticket]) -> Result<()> {
    if tickets.is_empty() {
        return Ok(());
    }

    let uuids: Vec<Uuid> = tickets.iter().map(|t| t.uuid).collect();
    let org_ids: Vec<OrgId> = tickets.iter().map(|t| t.org_id).collect();
    let contact_ids: Vec<ContactId> = tickets.iter().map(|t| t.contact_id).collect();
    let ticketer_ids: Vec<TicketerId> = tickets.iter().map(|t| t.ticketer_id).collect();
    let external_ids: Vec<Option<String>> = tickets.iter().map(|t| t.external_id.clone()).collect();
    let statuses: Vec<&str> = tickets.iter().map(|t| t.status.code()).collect();
    let subjects: Vec<String> = tickets.iter().map(|t| t.subject.clone()).collect();
    let bodies: Vec<String> = tickets.iter().map(|t| t.body.clone()).collect();
    let configs: Vec<serde_json::Value> = tickets
        .iter()
        .map(|t| serde_json::to_value(&t.config).unwrap_or_default())
        .collect();

    let rows = sqlx::query(
        r#"
        INSERT INTO tickets(uuid, org_id, contact_id, ticketer_id, external_id, status, subject, body, config, opened_on, modified_on)
        SELECT r.*, NOW(), NOW()
          FROM UNNEST($1::uuid[], $2::int[], $3::bigint[], $4::int[], $5::text[], $6::text[], $7::text[], $8::text[], $9::jsonb[])
               AS r(uuid, org_id, contact_id, ticketer_id, external_id, status, subject, body, config)
        RETURNING id, uuid
        "#,
    )
    .bind(&uuids)
    .bind(&org_ids)
    .bind(&contact_ids)
    .bind(&ticketer_ids)
    .bind(&external_ids)
    .bind(&statuses)
    .bind(&subjects)
    .bind(&bodies)
    .bind(&configs)
    .fetch_all(&mut *db)
    .await?;

    for row in rows {
        let id: TicketId = row.get("id");
        let uuid: Uuid = row.get("uuid");
        if let Some(ticket) = tickets.iter_mut().find(|t| t.uuid == uuid) {
            ticket.id = Some(id);
        }
    }

    Ok(())
}

/// Updates ticket statuses (close / reopen) in one statement.
pub async fn update_ticket_statuses(
    db: impl sqlx::PgExecutor<'_>,
    ticket_ids: &[TicketId],
    status: TicketStatus,
) -> Result<()> {
    if ticket_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "UPDATE tickets SET status = $2, modified_on = NOW(), closed_on = CASE WHEN $2 = 'C' THEN NOW() ELSE NULL END WHERE id = ANY($1)",
    )
    .bind(ticket_ids)
    .bind(status.code())
    .execute(db)
    .await?;
    Ok(())
}

/// Kind of ticket lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketEventType {
    Opened,
    Closed,
    Reopened,
}

impl TicketEventType {
    pub fn code(&self) -> &'static str {
        match self {
            TicketEventType::Opened => "O",
            TicketEventType::Closed => "C",
            TicketEventType::Reopened => "R",
        }
    }
}

/// A ticket lifecycle event row.
#[derive(Debug, Clone)]
pub struct TicketEvent {
    pub org_id: OrgId,
    pub ticket_id: TicketId,
    pub contact_id: ContactId,
    pub event_type: TicketEventType,
}

pub async fn insert_ticket_events(
    db: impl sqlx::PgExecutor<'_>,
    events: &[TicketEvent],
) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let org_ids: Vec<OrgId> = events.iter().map(|e| e.org_id).collect();
    let ticket_ids: Vec<TicketId> = events.iter().map(|e| e.ticket_id).collect();
    let contact_ids: Vec<ContactId> = events.iter().map(|e| e.contact_id).collect();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.code()).collect();

    sqlx::query(
        r#"
        INSERT INTO ticket_events(org_id, ticket_id, contact_id, event_type, created_on)
        SELECT r.*, NOW()
          FROM UNNEST($1::int[], $2::bigint[], $3::bigint[], $4::text[])
               AS r(org_id, ticket_id, contact_id, event_type)
        "#,
    )
    .bind(&org_ids)
    .bind(&ticket_ids)
    .bind(&contact_ids)
    .bind(&types)
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_defaults_open() {
        let ticket = Ticket::new(Uuid::new_v4(), 1, 10, 2, "Need help", "Where are my cookies?");
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.status.code(), "O");
        assert!(ticket.id.is_none());
        assert!(ticket.config_value("contact-uuid").is_none());
    }
}

//! Channels, voice call connections, channel events and channel logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

use super::{ChannelId, ConnectionId, ContactId, OrgId, StartId};

#[derive(Debug, Clone, FromRow)]
pub struct Channel {
    pub id: ChannelId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub channel_type: String,
    pub address: String,
    pub is_active: bool,
    #[sqlx(json)]
    pub config: serde_json::Value,
}

impl Channel {
    /// How many simultaneous calls this channel may have in flight, 0
    /// meaning unlimited.
    pub fn max_concurrent_calls(&self) -> i64 {
        self.config
            .get("max_concurrent_events")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    pub async fn load_for_org(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>(
            "SELECT id, uuid, org_id, name, channel_type, address, is_active, config FROM channels WHERE org_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(db)
        .await?;
        Ok(channels)
    }

    pub async fn load_by_uuid(db: impl sqlx::PgExecutor<'_>, uuid: Uuid) -> Result<Option<Channel>> {
        let channel = sqlx::query_as::<_, Channel>(
            "SELECT id, uuid, org_id, name, channel_type, address, is_active, config FROM channels WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(db)
        .await?;
        Ok(channel)
    }
}

/// Voice call status, stored as a single char column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Queued,
    Wired,
    InProgress,
    Completed,
    Errored,
    Failed,
    Busy,
    NoAnswer,
}

impl ConnectionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "P",
            ConnectionStatus::Queued => "Q",
            ConnectionStatus::Wired => "W",
            ConnectionStatus::InProgress => "I",
            ConnectionStatus::Completed => "D",
            ConnectionStatus::Errored => "E",
            ConnectionStatus::Failed => "F",
            ConnectionStatus::Busy => "B",
            ConnectionStatus::NoAnswer => "N",
        }
    }

    pub fn from_code(code: &str) -> Result<ConnectionStatus> {
        match code {
            "P" => Ok(ConnectionStatus::Pending),
            "Q" => Ok(ConnectionStatus::Queued),
            "W" => Ok(ConnectionStatus::Wired),
            "I" => Ok(ConnectionStatus::InProgress),
            "D" => Ok(ConnectionStatus::Completed),
            "E" => Ok(ConnectionStatus::Errored),
            "F" => Ok(ConnectionStatus::Failed),
            "B" => Ok(ConnectionStatus::Busy),
            "N" => Ok(ConnectionStatus::NoAnswer),
            other => Err(FlowhubError::Validation(format!(
                "unknown connection status: {other}"
            ))),
        }
    }
}

/// A voice call tracked from request through completion.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    pub id: ConnectionId,
    pub org_id: OrgId,
    pub channel_id: ChannelId,
    pub contact_id: ContactId,
    pub contact_urn: String,
    pub direction: String,
    pub status: ConnectionStatus,
    pub external_id: Option<String>,
    pub retry_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub start_id: Option<StartId>,
}

impl ChannelConnection {
    /// Creates a pending outgoing call connection.
    pub async fn create_outgoing(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        channel_id: ChannelId,
        contact_id: ContactId,
        contact_urn: &str,
        start_id: Option<StartId>,
    ) -> Result<ChannelConnection> {
        Self::create(db, org_id, channel_id, contact_id, contact_urn, "O", start_id).await
    }

    /// Creates a connection for a call the contact placed to us.
    pub async fn create_incoming(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        channel_id: ChannelId,
        contact_id: ContactId,
        contact_urn: &str,
    ) -> Result<ChannelConnection> {
        Self::create(db, org_id, channel_id, contact_id, contact_urn, "I", None).await
    }

    async fn create(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        channel_id: ChannelId,
        contact_id: ContactId,
        contact_urn: &str,
        direction: &str,
        start_id: Option<StartId>,
    ) -> Result<ChannelConnection> {
        let row = sqlx::query(
            r#"
            INSERT INTO channel_connections(org_id, channel_id, contact_id, contact_urn, direction, status, retry_count, start_id, created_on)
            VALUES($1, $2, $3, $4, $5, 'P', 0, $6, NOW())
            RETURNING id
            "#,
        )
        .bind(org_id)
        .bind(channel_id)
        .bind(contact_id)
        .bind(contact_urn)
        .bind(direction)
        .bind(start_id)
        .fetch_one(db)
        .await?;

        Ok(ChannelConnection {
            id: row.get("id"),
            org_id,
            channel_id,
            contact_id,
            contact_urn: contact_urn.to_string(),
            direction: direction.to_string(),
            status: ConnectionStatus::Pending,
            external_id: None,
            retry_count: 0,
            next_attempt: None,
            start_id,
        })
    }

    pub async fn load(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        id: ConnectionId,
    ) -> Result<Option<ChannelConnection>> {
        let row = sqlx::query(
            r#"
            SELECT id, org_id, channel_id, contact_id, contact_urn, direction, status, external_id, retry_count, next_attempt, start_id
              FROM channel_connections WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(id)
        .fetch_optional(db)
        .await?;

        row.map(Self::from_row).transpose()
    }

    fn from_row(row: sqlx::postgres::PgRow) -> Result<ChannelConnection> {
        let status: String = row.get("status");
        Ok(ChannelConnection {
            id: row.get("id"),
            org_id: row.get("org_id"),
            channel_id: row.get("channel_id"),
            contact_id: row.get("contact_id"),
            contact_urn: row.get("contact_urn"),
            direction: row.get("direction"),
            status: ConnectionStatus::from_code(&status)?,
            external_id: row.get("external_id"),
            retry_count: row.get("retry_count"),
            next_attempt: row.get("next_attempt"),
            start_id: row.get("start_id"),
        })
    }

    /// Marks this connection handed to the provider under the returned
    /// provider call id.
    pub async fn mark_wired(
        &mut self,
        db: impl sqlx::PgExecutor<'_>,
        external_id: &str,
    ) -> Result<()> {
        self.status = ConnectionStatus::Wired;
        self.external_id = Some(external_id.to_string());
        sqlx::query(
            "UPDATE channel_connections SET status = 'W', external_id = $2, next_attempt = NULL, modified_on = NOW() WHERE id = $1",
        )
        .bind(self.id)
        .bind(external_id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Marks this connection errored and schedules (or gives up on) its
    /// next attempt.
    pub async fn mark_errored(
        &mut self,
        db: impl sqlx::PgExecutor<'_>,
        retry_wait: Option<std::time::Duration>,
    ) -> Result<()> {
        match retry_wait {
            Some(wait) => {
                self.status = ConnectionStatus::Errored;
                self.next_attempt = Some(Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default());
            }
            None => {
                self.status = ConnectionStatus::Failed;
                self.next_attempt = None;
            }
        }
        sqlx::query(
            "UPDATE channel_connections SET status = $2, next_attempt = $3, retry_count = retry_count + 1, modified_on = NOW() WHERE id = $1",
        )
        .bind(self.id)
        .bind(self.status.code())
        .bind(self.next_attempt)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &mut self,
        db: impl sqlx::PgExecutor<'_>,
        status: ConnectionStatus,
    ) -> Result<()> {
        self.status = status;
        sqlx::query("UPDATE channel_connections SET status = $2, modified_on = NOW() WHERE id = $1")
            .bind(self.id)
            .bind(status.code())
            .execute(db)
            .await?;
        Ok(())
    }

    /// Marks this connection permanently failed.
    pub async fn mark_failed(&mut self, db: impl sqlx::PgExecutor<'_>) -> Result<()> {
        self.update_status(db, ConnectionStatus::Failed).await
    }
}

/// Loads connections due for a retry: errored with a next_attempt in the
/// past. Capped so one cron tick stays bounded.
pub async fn load_connections_to_retry(
    db: impl sqlx::PgExecutor<'_>,
    limit: i64,
) -> Result<Vec<ChannelConnection>> {
    let rows = sqlx::query(
        r#"
        SELECT id, org_id, channel_id, contact_id, contact_urn, direction, status, external_id, retry_count, next_attempt, start_id
          FROM channel_connections
         WHERE status = 'E' AND next_attempt <= NOW() AND direction = 'O'
         ORDER BY next_attempt
         LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(db)
    .await?;

    rows.into_iter().map(ChannelConnection::from_row).collect()
}

/// The number of a channel's calls currently wired or in progress, used to
/// enforce its concurrency limit.
pub async fn active_call_count(
    db: impl sqlx::PgExecutor<'_>,
    channel_id: ChannelId,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM channel_connections WHERE channel_id = $1 AND status IN ('W', 'I')",
    )
    .bind(channel_id)
    .fetch_one(db)
    .await?;
    Ok(row.0)
}

/// Kind of an inbound channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventType {
    MoCall,
    MoMiss,
    NewConversation,
    Referral,
}

impl ChannelEventType {
    pub fn code(&self) -> &'static str {
        match self {
            ChannelEventType::MoCall => "mo_call",
            ChannelEventType::MoMiss => "mo_miss",
            ChannelEventType::NewConversation => "new_conversation",
            ChannelEventType::Referral => "referral",
        }
    }
}

/// An inbound channel event: an incoming or missed call, a conversation
/// trigger or a referral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub id: i64,
    pub org_id: OrgId,
    pub channel_id: ChannelId,
    pub contact_id: ContactId,
    pub event_type: String,
    pub extra: serde_json::Value,
    pub occurred_on: DateTime<Utc>,
}

impl ChannelEvent {
    pub async fn create(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        channel_id: ChannelId,
        contact_id: ContactId,
        event_type: ChannelEventType,
        extra: serde_json::Value,
    ) -> Result<ChannelEvent> {
        let row = sqlx::query(
            r#"
            INSERT INTO channel_events(org_id, channel_id, contact_id, event_type, extra, occurred_on, created_on)
            VALUES($1, $2, $3, $4, $5, NOW(), NOW())
            RETURNING id, occurred_on
            "#,
        )
        .bind(org_id)
        .bind(channel_id)
        .bind(contact_id)
        .bind(event_type.code())
        .bind(&extra)
        .fetch_one(db)
        .await?;

        Ok(ChannelEvent {
            id: row.get("id"),
            org_id,
            channel_id,
            contact_id,
            event_type: event_type.code().to_string(),
            extra,
            occurred_on: row.get("occurred_on"),
        })
    }
}

/// A recorded provider exchange on a channel, written by the IVR surface.
#[derive(Debug, Clone)]
pub struct ChannelLog {
    pub channel_id: ChannelId,
    pub connection_id: Option<ConnectionId>,
    pub description: String,
    pub is_error: bool,
    pub url: String,
    pub request: String,
    pub response: String,
    pub response_status: i32,
    pub elapsed_ms: i32,
}

pub async fn insert_channel_logs(
    db: impl sqlx::PgExecutor<'_>,
    logs: &[ChannelLog],
) -> Result<()> {
    if logs.is_empty() {
        return Ok(());
    }
    let channel_ids: Vec<ChannelId> = logs.iter().map(|l| l.channel_id).collect();
    let connection_ids: Vec<Option<ConnectionId>> = logs.iter().map(|l| l.connection_id).collect();
    let descriptions: Vec<String> = logs.iter().map(|l| l.description.clone()).collect();
    let is_errors: Vec<bool> = logs.iter().map(|l| l.is_error).collect();
    let urls: Vec<String> = logs.iter().map(|l| l.url.clone()).collect();
    let requests: Vec<String> = logs.iter().map(|l| l.request.clone()).collect();
    let responses: Vec<String> = logs.iter().map(|l| l.response.clone()).collect();
    let statuses: Vec<i32> = logs.iter().map(|l| l.response_status).collect();
    let elapsed: Vec<i32> = logs.iter().map(|l| l.elapsed_ms).collect();

    sqlx::query(
        r#"
        INSERT INTO channel_logs(channel_id, connection_id, description, is_error, url, request, response, response_status, elapsed_ms, created_on)
        SELECT r.*, NOW()
          FROM UNNEST($1::int[], $2::bigint[], $3::text[], $4::bool[], $5::text[], $6::text[], $7::text[], $8::int[], $9::int[])
               AS r(channel_id, connection_id, description, is_error, url, request, response, response_status, elapsed_ms)
        "#,
    )
    .bind(&channel_ids)
    .bind(&connection_ids)
    .bind(&descriptions)
    .bind(&is_errors)
    .bind(&urls)
    .bind(&requests)
    .bind(&responses)
    .bind(&statuses)
    .bind(&elapsed)
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_codes_round_trip() {
        for status in [
            ConnectionStatus::Pending,
            ConnectionStatus::Queued,
            ConnectionStatus::Wired,
            ConnectionStatus::InProgress,
            ConnectionStatus::Completed,
            ConnectionStatus::Errored,
            ConnectionStatus::Failed,
            ConnectionStatus::Busy,
            ConnectionStatus::NoAnswer,
        ] {
            assert_eq!(ConnectionStatus::from_code(status.code()).unwrap(), status);
        }
    }

    #[test]
    fn channel_concurrency_config() {
        let channel = Channel {
            id: 1,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: "Vonage".to_string(),
            channel_type: "NX".to_string(),
            address: "+12065551212".to_string(),
            is_active: true,
            config: serde_json::json!({"max_concurrent_events": 25}),
        };
        assert_eq!(channel.max_concurrent_calls(), 25);

        let unlimited = Channel { config: serde_json::json!({}), ..channel };
        assert_eq!(unlimited.max_concurrent_calls(), 0);
    }
}

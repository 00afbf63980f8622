//! Messages, labels and broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::Result;

use super::{
    ChannelId, ConnectionId, ContactId, GroupId, LabelId, MsgId, OrgId, SessionId, TopupId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgDirection {
    In,
    Out,
}

impl MsgDirection {
    pub fn code(&self) -> &'static str {
        match self {
            MsgDirection::In => "I",
            MsgDirection::Out => "O",
        }
    }
}

/// A message row staged for insertion. Outgoing messages are created
/// queued and handed to the courier after commit; incoming messages are
/// recorded as handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MsgId>,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub channel_id: Option<ChannelId>,
    pub connection_id: Option<ConnectionId>,
    pub session_id: Option<SessionId>,
    /// URN identity the message is addressed to/from
    pub urn: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    pub direction: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topup_id: Option<TopupId>,
    pub created_on: DateTime<Utc>,
    /// labels the engine attached; resolved and written by the commit hook
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_uuids: Vec<Uuid>,
}

impl Msg {
    /// An outgoing flow message addressed to the passed in URN identity.
    pub fn out(
        org_id: OrgId,
        contact_id: ContactId,
        uuid: Uuid,
        text: &str,
        urn: Option<String>,
        channel_id: Option<ChannelId>,
    ) -> Msg {
        Msg {
            id: None,
            uuid,
            org_id,
            contact_id,
            channel_id,
            connection_id: None,
            session_id: None,
            urn,
            text: text.to_string(),
            attachments: Vec::new(),
            quick_replies: Vec::new(),
            direction: MsgDirection::Out.code().to_string(),
            status: "Q".to_string(),
            topup_id: None,
            created_on: Utc::now(),
            label_uuids: Vec::new(),
        }
    }
}

/// Inserts all the passed in messages in one statement, filling in their
/// ids (matched back by uuid).
pub async fn insert_msgs(db: &mut sqlx::PgConnection, msgs: &mut [Msg]) -> Result<()> {
    if msgs.is_empty() {
        return Ok(());
    }

    let uuids: Vec<Uuid> = msgs.iter().map(|m| m.uuid).collect();
    let org_ids: Vec<OrgId> = msgs.iter().map(|m| m.org_id).collect();
    let contact_ids: Vec<ContactId> = msgs.iter().map(|m| m.contact_id).collect();
    let channel_ids: Vec<Option<ChannelId>> = msgs.iter().map(|m| m.channel_id).collect();
    let connection_ids: Vec<Option<ConnectionId>> = msgs.iter().map(|m| m.connection_id).collect();
    let session_ids: Vec<Option<SessionId>> = msgs.iter().map(|m| m.session_id).collect();
    let urns: Vec<Option<String>> = msgs.iter().map(|m| m.urn.clone()).collect();
    let texts: Vec<String> = msgs.iter().map(|m| m.text.clone()).collect();
    let attachments: Vec<Vec<String>> = msgs.iter().map(|m| m.attachments.clone()).collect();
    let attachments: Vec<serde_json::Value> = attachments
        .iter()
        .map(|a| serde_json::to_value(a).unwrap_or_default())
        .collect();
    let directions: Vec<String> = msgs.iter().map(|m| m.direction.clone()).collect();
    let statuses: Vec<String> = msgs.iter().map(|m| m.status.clone()).collect();
    let topup_ids: Vec<Option<TopupId>> = msgs.iter().map(|m| m.topup_id).collect();
    let created: Vec<DateTime<Utc>> = msgs.iter().map(|m| m.created_on).collect();

    let rows = sqlx::query(
        r#"
        INSERT INTO msgs(uuid, org_id, contact_id, channel_id, connection_id, session_id, urn, text,
                         attachments, direction, status, topup_id, created_on, modified_on)
        SELECT r.uuid, r.org_id, r.contact_id, r.channel_id, r.connection_id, r.session_id, r.urn, r.text,
               r.attachments, r.direction, r.status, r.topup_id, r.created_on, NOW()
          FROM UNNEST($1::uuid[], $2::int[], $3::bigint[], $4::int[], $5::bigint[], $6::bigint[],
                      $7::text[], $8::text[], $9::jsonb[], $10::text[], $11::text[], $12::int[], $13::timestamptz[])
               AS r(uuid, org_id, contact_id, channel_id, connection_id, session_id, urn, text,
                    attachments, direction, status, topup_id, created_on)
        RETURNING id, uuid
        "#,
    )
    .bind(&uuids)
    .bind(&org_ids)
    .bind(&contact_ids)
    .bind(&channel_ids)
    .bind(&connection_ids)
    .bind(&session_ids)
    .bind(&urns)
    .bind(&texts)
    .bind(&attachments)
    .bind(&directions)
    .bind(&statuses)
    .bind(&topup_ids)
    .bind(&created)
    .fetch_all(&mut *db)
    .await?;

    for row in rows {
        let id: MsgId = row.get("id");
        let uuid: Uuid = row.get("uuid");
        if let Some(msg) = msgs.iter_mut().find(|m| m.uuid == uuid) {
            msg.id = Some(id);
        }
    }

    Ok(())
}

/// Translates an engine message UUID to its row id. Used when a label is
/// applied to input that wasn't this sprint's cached incoming message.
pub async fn id_for_uuid(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    uuid: Uuid,
) -> Result<Option<MsgId>> {
    let row: Option<(MsgId,)> =
        sqlx::query_as("SELECT id FROM msgs WHERE org_id = $1 AND uuid = $2")
            .bind(org_id)
            .bind(uuid)
            .fetch_optional(db)
            .await?;
    Ok(row.map(|r| r.0))
}

#[derive(Debug, Clone, FromRow)]
pub struct Label {
    pub id: LabelId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
}

impl Label {
    pub async fn load_for_org(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Vec<Label>> {
        let labels = sqlx::query_as::<_, Label>(
            "SELECT id, uuid, org_id, name FROM labels WHERE org_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(db)
        .await?;
        Ok(labels)
    }
}

/// One label application to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgLabelAdd {
    pub msg_id: MsgId,
    pub label_id: LabelId,
}

/// Applies all the passed in label adds in one statement.
pub async fn add_msg_labels(db: impl sqlx::PgExecutor<'_>, adds: &[MsgLabelAdd]) -> Result<()> {
    if adds.is_empty() {
        return Ok(());
    }
    let msg_ids: Vec<MsgId> = adds.iter().map(|a| a.msg_id).collect();
    let label_ids: Vec<LabelId> = adds.iter().map(|a| a.label_id).collect();

    sqlx::query(
        r#"
        INSERT INTO msg_labels(msg_id, label_id)
        SELECT * FROM UNNEST($1::bigint[], $2::int[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&msg_ids)
    .bind(&label_ids)
    .execute(db)
    .await?;

    Ok(())
}

/// A broadcast staged by the engine: translated text to a set of contacts,
/// groups and URNs, expanded to individual messages downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub org_id: OrgId,
    /// language -> text
    pub translations: serde_json::Value,
    pub base_language: String,
    pub contact_ids: Vec<ContactId>,
    pub group_ids: Vec<GroupId>,
    pub urns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<super::TicketId>,
}

/// Inserts broadcasts one row each with their recipient sets.
pub async fn insert_broadcasts(
    db: &mut sqlx::PgConnection,
    broadcasts: &[Broadcast],
) -> Result<()> {
    for b in broadcasts {
        let row = sqlx::query(
            r#"
            INSERT INTO broadcasts(org_id, translations, base_language, status, contact_ids, group_ids, urns, ticket_id, created_on, modified_on)
            VALUES($1, $2, $3, 'Q', $4, $5, $6, $7, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(b.org_id)
        .bind(&b.translations)
        .bind(&b.base_language)
        .bind(&b.contact_ids)
        .bind(&b.group_ids)
        .bind(&b.urns)
        .bind(b.ticket_id)
        .fetch_one(&mut *db)
        .await?;
        let _id: i64 = row.get("id");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_msg_defaults() {
        let msg = Msg::out(1, 10, Uuid::new_v4(), "hi there", Some("tel:+1234".into()), Some(3));
        assert_eq!(msg.direction, "O");
        assert_eq!(msg.status, "Q");
        assert!(msg.id.is_none());
        assert!(msg.topup_id.is_none());
    }

    #[test]
    fn msg_serialization_round_trips() {
        let msg = Msg::out(1, 10, Uuid::new_v4(), "hello", None, None);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Msg = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.text, "hello");
        assert_eq!(parsed.uuid, msg.uuid);
    }
}

//! Sessions and runs: the durable state of contacts traversing flows.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

use super::{ConnectionId, ContactId, FlowId, FlowType, MsgId, OrgId, SessionId, StartId};

/// Session status, stored as a single char column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
    Interrupted,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "W",
            SessionStatus::Active => "A",
            SessionStatus::Completed => "C",
            SessionStatus::Interrupted => "I",
            SessionStatus::Failed => "F",
            SessionStatus::Expired => "X",
        }
    }

    pub fn from_code(code: &str) -> Result<SessionStatus> {
        match code {
            "W" => Ok(SessionStatus::Waiting),
            "A" => Ok(SessionStatus::Active),
            "C" => Ok(SessionStatus::Completed),
            "I" => Ok(SessionStatus::Interrupted),
            "F" => Ok(SessionStatus::Failed),
            "X" => Ok(SessionStatus::Expired),
            other => Err(FlowhubError::Validation(format!(
                "unknown session status: {other}"
            ))),
        }
    }

    pub fn is_ended(&self) -> bool {
        !matches!(self, SessionStatus::Waiting | SessionStatus::Active)
    }
}

/// The durable state of one contact inside one flow.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub status: SessionStatus,
    pub session_type: FlowType,
    pub current_flow_id: Option<FlowId>,
    pub responded: bool,
    /// object storage key of the latest serialized interpreter state
    pub state_key: Option<String>,
    /// index of the next sprint, used to key the state blob
    pub sprint: i32,
    pub created_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
    pub timeout_on: Option<DateTime<Utc>>,
    pub connection_id: Option<ConnectionId>,
    /// id of the message that started/resumed this sprint, when there was
    /// one; kept in memory only, for input label resolution
    pub incoming_msg_id: Option<MsgId>,
}

impl Session {
    /// Inserts the passed in sessions in one statement, filling in their
    /// ids. Sessions are matched back to their rows by uuid.
    pub async fn insert_batch(db: &mut sqlx::PgConnection, sessions: &mut [Session]) -> Result<()> {
        if sessions.is_empty() {
            return Ok(());
        }

        let uuids: Vec<Uuid> = sessions.iter().map(|s| s.uuid).collect();
        let org_ids: Vec<OrgId> = sessions.iter().map(|s| s.org_id).collect();
        let contact_ids: Vec<ContactId> = sessions.iter().map(|s| s.contact_id).collect();
        let statuses: Vec<&str> = sessions.iter().map(|s| s.status.code()).collect();
        let types: Vec<&str> = sessions.iter().map(|s| s.session_type.code()).collect();
        let flow_ids: Vec<Option<FlowId>> = sessions.iter().map(|s| s.current_flow_id).collect();
        let responded: Vec<bool> = sessions.iter().map(|s| s.responded).collect();
        let state_keys: Vec<Option<String>> = sessions.iter().map(|s| s.state_key.clone()).collect();
        let ended: Vec<Option<DateTime<Utc>>> = sessions.iter().map(|s| s.ended_on).collect();
        let timeouts: Vec<Option<DateTime<Utc>>> = sessions.iter().map(|s| s.timeout_on).collect();
        let connections: Vec<Option<ConnectionId>> =
            sessions.iter().map(|s| s.connection_id).collect();

        let rows = sqlx::query(
            r#"
            INSERT INTO flow_sessions(uuid, org_id, contact_id, status, session_type, current_flow_id,
                                      responded, state_key, sprint, created_on, ended_on, timeout_on, connection_id)
            SELECT r.uuid, r.org_id, r.contact_id, r.status, r.session_type, r.current_flow_id,
                   r.responded, r.state_key, 1, NOW(), r.ended_on, r.timeout_on, r.connection_id
              FROM UNNEST($1::uuid[], $2::int[], $3::bigint[], $4::text[], $5::text[], $6::int[],
                          $7::bool[], $8::text[], $9::timestamptz[], $10::timestamptz[], $11::bigint[])
                   AS r(uuid, org_id, contact_id, status, session_type, current_flow_id,
                        responded, state_key, ended_on, timeout_on, connection_id)
            RETURNING id, uuid
            "#,
        )
        .bind(&uuids)
        .bind(&org_ids)
        .bind(&contact_ids)
        .bind(&statuses)
        .bind(&types)
        .bind(&flow_ids)
        .bind(&responded)
        .bind(&state_keys)
        .bind(&ended)
        .bind(&timeouts)
        .bind(&connections)
        .fetch_all(&mut *db)
        .await?;

        for row in rows {
            let id: SessionId = row.get("id");
            let uuid: Uuid = row.get("uuid");
            if let Some(session) = sessions.iter_mut().find(|s| s.uuid == uuid) {
                session.id = id;
            }
        }

        Ok(())
    }

    /// Updates a resumed session's row after a sprint.
    pub async fn update(&self, db: impl sqlx::PgExecutor<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE flow_sessions
               SET status = $2, current_flow_id = $3, responded = $4, state_key = $5, sprint = $6,
                   ended_on = $7, timeout_on = $8
             WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(self.status.code())
        .bind(self.current_flow_id)
        .bind(self.responded)
        .bind(&self.state_key)
        .bind(self.sprint)
        .bind(self.ended_on)
        .bind(self.timeout_on)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Loads a contact's waiting session of the passed in type, if any.
    pub async fn load_waiting_for_contact(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        contact_id: ContactId,
        session_type: FlowType,
    ) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, org_id, contact_id, status, session_type, current_flow_id, responded,
                   state_key, sprint, created_on, ended_on, timeout_on, connection_id
              FROM flow_sessions
             WHERE org_id = $1 AND contact_id = $2 AND status = 'W' AND session_type = $3
             ORDER BY created_on DESC
             LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(contact_id)
        .bind(session_type.code())
        .fetch_optional(db)
        .await?;

        row.map(Session::from_row).transpose()
    }

    /// Loads a session by id.
    pub async fn load(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        session_id: SessionId,
    ) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, org_id, contact_id, status, session_type, current_flow_id, responded,
                   state_key, sprint, created_on, ended_on, timeout_on, connection_id
              FROM flow_sessions
             WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(session_id)
        .fetch_optional(db)
        .await?;

        row.map(Session::from_row).transpose()
    }

    fn from_row(row: sqlx::postgres::PgRow) -> Result<Session> {
        let status: String = row.get("status");
        let session_type: String = row.get("session_type");
        Ok(Session {
            id: row.get("id"),
            uuid: row.get("uuid"),
            org_id: row.get("org_id"),
            contact_id: row.get("contact_id"),
            status: SessionStatus::from_code(&status)?,
            session_type: FlowType::from_code(&session_type),
            current_flow_id: row.get("current_flow_id"),
            responded: row.get("responded"),
            state_key: row.get("state_key"),
            sprint: row.get("sprint"),
            created_on: row.get("created_on"),
            ended_on: row.get("ended_on"),
            timeout_on: row.get("timeout_on"),
            connection_id: row.get("connection_id"),
            incoming_msg_id: None,
        })
    }
}

/// A single traversal of a single flow inside a session.
#[derive(Debug, Clone)]
pub struct FlowRun {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub contact_id: ContactId,
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub responded: bool,
    pub results: serde_json::Value,
    pub path: serde_json::Value,
    pub start_id: Option<StartId>,
    pub created_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
}

/// Bulk inserts the runs produced by a batch of sprints. The partial
/// unique key on `(start_id, contact_id)` makes re-processing a start
/// batch a no-op rather than a duplicate.
pub async fn insert_runs(db: impl sqlx::PgExecutor<'_>, runs: &[FlowRun]) -> Result<()> {
    if runs.is_empty() {
        return Ok(());
    }

    let uuids: Vec<Uuid> = runs.iter().map(|r| r.uuid).collect();
    let org_ids: Vec<OrgId> = runs.iter().map(|r| r.org_id).collect();
    let flow_ids: Vec<FlowId> = runs.iter().map(|r| r.flow_id).collect();
    let contact_ids: Vec<ContactId> = runs.iter().map(|r| r.contact_id).collect();
    let session_ids: Vec<SessionId> = runs.iter().map(|r| r.session_id).collect();
    let statuses: Vec<&str> = runs.iter().map(|r| r.status.code()).collect();
    let responded: Vec<bool> = runs.iter().map(|r| r.responded).collect();
    let results: Vec<serde_json::Value> = runs.iter().map(|r| r.results.clone()).collect();
    let paths: Vec<serde_json::Value> = runs.iter().map(|r| r.path.clone()).collect();
    let start_ids: Vec<Option<StartId>> = runs.iter().map(|r| r.start_id).collect();
    let exited: Vec<Option<DateTime<Utc>>> = runs.iter().map(|r| r.exited_on).collect();

    sqlx::query(
        r#"
        INSERT INTO flow_runs(uuid, org_id, flow_id, contact_id, session_id, status, responded,
                              results, path, start_id, created_on, modified_on, exited_on)
        SELECT r.uuid, r.org_id, r.flow_id, r.contact_id, r.session_id, r.status, r.responded,
               r.results, r.path, r.start_id, NOW(), NOW(), r.exited_on
          FROM UNNEST($1::uuid[], $2::int[], $3::int[], $4::bigint[], $5::bigint[], $6::text[],
                      $7::bool[], $8::jsonb[], $9::jsonb[], $10::bigint[], $11::timestamptz[])
               AS r(uuid, org_id, flow_id, contact_id, session_id, status, responded,
                    results, path, start_id, exited_on)
        ON CONFLICT (start_id, contact_id) WHERE start_id IS NOT NULL DO NOTHING
        "#,
    )
    .bind(&uuids)
    .bind(&org_ids)
    .bind(&flow_ids)
    .bind(&contact_ids)
    .bind(&session_ids)
    .bind(&statuses)
    .bind(&responded)
    .bind(&results)
    .bind(&paths)
    .bind(&start_ids)
    .bind(&exited)
    .execute(db)
    .await?;

    Ok(())
}

/// Marks the waiting sessions of the passed in contacts interrupted, along
/// with their active runs. Only sessions whose type interrupts are
/// touched; background and surveyor sessions ride out new starts.
pub async fn interrupt_waiting_sessions(
    db: &mut sqlx::PgConnection,
    org_id: OrgId,
    contact_ids: &[ContactId],
) -> Result<u64> {
    if contact_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r#"
        UPDATE flow_sessions
           SET status = 'I', ended_on = NOW(), timeout_on = NULL, current_flow_id = NULL
         WHERE org_id = $1 AND contact_id = ANY($2) AND status = 'W' AND session_type IN ('M', 'V')
        "#,
    )
    .bind(org_id)
    .bind(contact_ids)
    .execute(&mut *db)
    .await?;

    sqlx::query(
        r#"
        UPDATE flow_runs
           SET status = 'I', exited_on = NOW(), modified_on = NOW()
         WHERE org_id = $1 AND contact_id = ANY($2) AND status IN ('A', 'W')
           AND session_id IN (SELECT id FROM flow_sessions WHERE org_id = $1 AND contact_id = ANY($2) AND status = 'I')
        "#,
    )
    .bind(org_id)
    .bind(contact_ids)
    .execute(&mut *db)
    .await?;

    Ok(result.rows_affected())
}

/// The subset of the passed in contacts that currently have a waiting
/// session for an interrupting flow type. Used by the start batcher's
/// `exclude_in_a_flow`.
pub async fn contact_ids_in_a_flow(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    contact_ids: &[ContactId],
) -> Result<Vec<ContactId>> {
    let rows: Vec<(ContactId,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT contact_id FROM flow_sessions
         WHERE org_id = $1 AND contact_id = ANY($2) AND status = 'W' AND session_type IN ('M', 'V')
        "#,
    )
    .bind(org_id)
    .bind(contact_ids)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// The subset of the passed in contacts already started in the flow.
pub async fn contact_ids_started_in_flow(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    flow_id: FlowId,
    contact_ids: &[ContactId],
) -> Result<Vec<ContactId>> {
    let rows: Vec<(ContactId,)> = sqlx::query_as(
        "SELECT DISTINCT contact_id FROM flow_runs WHERE org_id = $1 AND flow_id = $2 AND contact_id = ANY($3)",
    )
    .bind(org_id)
    .bind(flow_id)
    .bind(contact_ids)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Expires waiting sessions of the passed in type whose timeout passed,
/// returning what expired.
pub async fn expire_timed_out_sessions(
    db: &mut sqlx::PgConnection,
    session_type: FlowType,
    now: DateTime<Utc>,
) -> Result<Vec<(OrgId, SessionId, ContactId)>> {
    let rows: Vec<(OrgId, SessionId, ContactId)> = sqlx::query_as(
        r#"
        UPDATE flow_sessions
           SET status = 'X', ended_on = NOW(), timeout_on = NULL, current_flow_id = NULL
         WHERE id IN (SELECT id FROM flow_sessions
                       WHERE status = 'W' AND session_type = $2 AND timeout_on <= $1 LIMIT 1000)
        RETURNING org_id, id, contact_id
        "#,
    )
    .bind(now)
    .bind(session_type.code())
    .fetch_all(&mut *db)
    .await?;

    if !rows.is_empty() {
        let session_ids: Vec<SessionId> = rows.iter().map(|r| r.1).collect();
        sqlx::query(
            "UPDATE flow_runs SET status = 'X', exited_on = NOW(), modified_on = NOW() WHERE session_id = ANY($1) AND status IN ('A', 'W')",
        )
        .bind(&session_ids)
        .execute(&mut *db)
        .await?;
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            SessionStatus::Waiting,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Interrupted,
            SessionStatus::Failed,
            SessionStatus::Expired,
        ] {
            assert_eq!(SessionStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(SessionStatus::from_code("Q").is_err());
    }

    #[test]
    fn ended_statuses() {
        assert!(!SessionStatus::Waiting.is_ended());
        assert!(!SessionStatus::Active.is_ended());
        assert!(SessionStatus::Completed.is_ended());
        assert!(SessionStatus::Interrupted.is_ended());
    }
}

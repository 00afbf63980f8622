//! Flow starts: a request to put a set of contacts into a flow, expanded
//! into fixed-size batches by the start batcher.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

use super::{ContactId, FlowId, GroupId, OrgId, StartId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Pending,
    Starting,
    Complete,
    Failed,
}

impl StartStatus {
    pub fn code(&self) -> &'static str {
        match self {
            StartStatus::Pending => "P",
            StartStatus::Starting => "S",
            StartStatus::Complete => "C",
            StartStatus::Failed => "F",
        }
    }
}

/// How a start came to be; manual starts from a user, trigger starts from
/// a channel trigger, flow starts from a parent flow's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartType {
    Manual,
    Trigger,
    FlowAction,
    Campaign,
}

/// A contact-selection spec plus flags controlling who actually enters the
/// flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<StartId>,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub start_type: StartType,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub exclude_group_ids: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub create_contact: bool,
    #[serde(default)]
    pub exclude_in_a_flow: bool,
    #[serde(default)]
    pub exclude_started_previously: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl FlowStart {
    pub fn new(org_id: OrgId, start_type: StartType, flow_id: FlowId) -> FlowStart {
        FlowStart {
            id: None,
            uuid: Uuid::new_v4(),
            org_id,
            flow_id,
            start_type,
            contact_ids: Vec::new(),
            group_ids: Vec::new(),
            exclude_group_ids: Vec::new(),
            query: None,
            create_contact: false,
            exclude_in_a_flow: false,
            exclude_started_previously: false,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_contact_ids(mut self, ids: Vec<ContactId>) -> Self {
        self.contact_ids = ids;
        self
    }

    pub fn with_group_ids(mut self, ids: Vec<GroupId>) -> Self {
        self.group_ids = ids;
        self
    }

    pub fn with_exclude_group_ids(mut self, ids: Vec<GroupId>) -> Self {
        self.exclude_group_ids = ids;
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        if !query.is_empty() {
            self.query = Some(query.to_string());
        }
        self
    }

    pub fn with_exclusions(mut self, in_a_flow: bool, started_previously: bool) -> Self {
        self.exclude_in_a_flow = in_a_flow;
        self.exclude_started_previously = started_previously;
        self
    }

    pub fn with_create_contact(mut self, create: bool) -> Self {
        self.create_contact = create;
        self
    }

    /// Inserts the start row in pending status, filling in its id.
    pub async fn insert(&mut self, db: impl sqlx::PgExecutor<'_>) -> Result<()> {
        let row = sqlx::query(
            r#"
            INSERT INTO flow_starts(uuid, org_id, flow_id, start_type, contact_ids, group_ids, query, status, contact_count, created_on, modified_on)
            VALUES($1, $2, $3, $4, $5, $6, $7, 'P', 0, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(self.uuid)
        .bind(self.org_id)
        .bind(self.flow_id)
        .bind(serde_json::to_value(self.start_type)?.as_str().unwrap_or("manual"))
        .bind(&self.contact_ids)
        .bind(&self.group_ids)
        .bind(&self.query)
        .fetch_one(db)
        .await?;

        self.id = Some(row.get("id"));
        Ok(())
    }

    /// Marks the start's final status and total contact count.
    pub async fn set_status(
        &self,
        db: impl sqlx::PgExecutor<'_>,
        status: StartStatus,
        contact_count: i64,
    ) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| FlowhubError::Validation("start has no id".to_string()))?;
        sqlx::query(
            "UPDATE flow_starts SET status = $2, contact_count = $3, modified_on = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.code())
        .bind(contact_count)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Splits a resolved contact set into start batches of the passed in
    /// size, flagging the last one so the batcher can finalize the start.
    pub fn create_batches(&self, contact_ids: &[ContactId], batch_size: usize) -> Vec<FlowStartBatch> {
        let chunks: Vec<&[ContactId]> = contact_ids.chunks(batch_size.max(1)).collect();
        let total = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| FlowStartBatch {
                start_id: self.id,
                org_id: self.org_id,
                flow_id: self.flow_id,
                contact_ids: chunk.to_vec(),
                restart_participants: !self.exclude_started_previously,
                include_active: !self.exclude_in_a_flow,
                params: self.params.clone(),
                is_last: i + 1 == total,
                total_contacts: contact_ids.len(),
            })
            .collect()
    }
}

/// One batch of contacts from a start, processed by a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStartBatch {
    pub start_id: Option<StartId>,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub contact_ids: Vec<ContactId>,
    pub restart_participants: bool,
    pub include_active: bool,
    #[serde(default)]
    pub params: serde_json::Value,
    pub is_last: bool,
    pub total_contacts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batching_chunks_and_flags_last() {
        let mut start = FlowStart::new(1, StartType::Manual, 5).with_exclusions(true, true);
        start.id = Some(12);

        let contact_ids: Vec<ContactId> = (1..=121).collect();
        let batches = start.create_batches(&contact_ids, 100);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].contact_ids.len(), 100);
        assert_eq!(batches[1].contact_ids.len(), 21);
        assert!(!batches[0].is_last);
        assert!(batches[1].is_last);
        assert_eq!(batches[1].total_contacts, 121);
        // exclusions invert into the batch flags
        assert!(!batches[0].restart_participants);
        assert!(!batches[0].include_active);
    }

    #[test]
    fn start_serialization_round_trips() {
        let start = FlowStart::new(1, StartType::Trigger, 2)
            .with_contact_ids(vec![10, 11])
            .with_query("name ~ \"bob\"");
        let json = serde_json::to_string(&start).unwrap();
        let parsed: FlowStart = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.contact_ids, vec![10, 11]);
        assert_eq!(parsed.query.as_deref(), Some("name ~ \"bob\""));
        assert_eq!(parsed.start_type, StartType::Trigger);
    }
}

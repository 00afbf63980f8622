//! Priority-fair work queues.
//!
//! Each queue is a pair of structures in the store: an active set of org
//! ids ordered by score, and per-org item lists at two priorities. Pop
//! always serves the lowest-scored org, so a noisy org's backlog can't
//! starve everyone else: completing work bumps the org's score by the
//! task's cost and idle time slowly pays it back down.
//!
//! The store is a pair of unlogged Postgres tables driven by single
//! atomic statements, and external producers push with the same
//! primitive and wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::models::OrgId;

/// The latency-sensitive lane: contact events, small explicit starts.
pub const HANDLER: Queue = Queue("handler");
/// The throughput-sensitive lane: group and query starts, imports.
pub const BATCH: Queue = Queue("batch");

/// A logical work lane in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue(pub &'static str);

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Priority of a single item within its org's lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Bulk,
}

impl Priority {
    fn rank(&self) -> i32 {
        match self {
            Priority::High => 0,
            Priority::Bulk => 1,
        }
    }
}

/// The JSON envelope tasks travel in, shared with external producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub org_id: OrgId,
    pub task: serde_json::Value,
    pub queued_on: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(kind: &str, org_id: OrgId, task: serde_json::Value) -> TaskEnvelope {
        TaskEnvelope {
            kind: kind.to_string(),
            org_id,
            task,
            queued_on: Utc::now(),
        }
    }
}

/// Score added per millisecond of task cost.
const COST_PER_MS: i64 = 1;
/// Ceiling on an org's score so one monster task doesn't bench it forever.
const SCORE_CAP: i64 = 600_000;
/// Fraction of idle time paid back against the score: an org idle for
/// sixteen seconds sheds a second of accumulated cost.
const DECAY_DIVISOR: i64 = 16;

/// The score an org lands on after completing a task: idle decay first,
/// then the task's cost, capped.
pub fn next_score(current: i64, idle_ms: i64, elapsed_ms: i64) -> i64 {
    let decayed = (current - idle_ms.max(0) / DECAY_DIVISOR).max(0);
    (decayed + elapsed_ms.max(0) * COST_PER_MS).min(SCORE_CAP)
}

/// Appends a task to the org's list at the given priority, adding the org
/// to the active set if it's new there.
pub async fn push(
    db: &PgPool,
    queue: Queue,
    org_id: OrgId,
    priority: Priority,
    envelope: &TaskEnvelope,
) -> Result<()> {
    let payload = serde_json::to_value(envelope)?;
    let mut tx = db.begin().await?;

    sqlx::query("INSERT INTO queue_items(queue, org_id, priority, payload, queued_on) VALUES($1, $2, $3, $4, NOW())")
        .bind(queue.0)
        .bind(org_id)
        .bind(priority.rank())
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO queue_orgs(queue, org_id, score, last_active) VALUES($1, $2, 0, NOW()) ON CONFLICT (queue, org_id) DO NOTHING",
    )
    .bind(queue.0)
    .bind(org_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Takes the next task from the queue: the lowest-scored org's first
/// high-priority item, falling back to its bulk item. Orgs found with
/// nothing pending are dropped from the active set and the pop retries.
/// Returns `None` when no org has work.
pub async fn pop(db: &PgPool, queue: Queue) -> Result<Option<TaskEnvelope>> {
    loop {
        let row = sqlx::query(
            r#"
            WITH next_org AS (
                SELECT org_id FROM queue_orgs
                 WHERE queue = $1
                 ORDER BY score, org_id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
            ),
            item AS (
                SELECT id FROM queue_items
                 WHERE queue = $1 AND org_id = (SELECT org_id FROM next_org)
                 ORDER BY priority, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
            )
            DELETE FROM queue_items WHERE id IN (SELECT id FROM item)
            RETURNING org_id, payload
            "#,
        )
        .bind(queue.0)
        .fetch_optional(db)
        .await?;

        if let Some(row) = row {
            let payload: serde_json::Value = row.get("payload");
            return Ok(Some(serde_json::from_value(payload)?));
        }

        // either the active set is empty or its head org has no items;
        // evict any drained orgs and try again
        let evicted = sqlx::query(
            r#"
            DELETE FROM queue_orgs qo
             WHERE qo.queue = $1
               AND NOT EXISTS (SELECT 1 FROM queue_items qi WHERE qi.queue = $1 AND qi.org_id = qo.org_id)
            "#,
        )
        .bind(queue.0)
        .execute(db)
        .await?;

        if evicted.rows_affected() == 0 {
            return Ok(None);
        }
    }
}

/// Records a completed task, charging its cost against the org's score.
pub async fn done(db: &PgPool, queue: Queue, org_id: OrgId, elapsed_ms: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE queue_orgs
           SET score = LEAST($4, GREATEST(0, score - (EXTRACT(EPOCH FROM (NOW() - last_active)) * 1000)::bigint / $5) + $3),
               last_active = NOW()
         WHERE queue = $1 AND org_id = $2
        "#,
    )
    .bind(queue.0)
    .bind(org_id)
    .bind(elapsed_ms.max(0) * COST_PER_MS)
    .bind(SCORE_CAP)
    .bind(DECAY_DIVISOR)
    .execute(db)
    .await?;
    Ok(())
}

/// Total tasks pending across all orgs of a queue.
pub async fn size(db: &PgPool, queue: Queue) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT count(*) FROM queue_items WHERE queue = $1")
        .bind(queue.0)
        .fetch_one(db)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_format() {
        let envelope = TaskEnvelope::new("start_flow", 7, serde_json::json!({"flow_id": 3}));
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "start_flow");
        assert_eq!(json["org_id"], 7);
        assert_eq!(json["task"]["flow_id"], 3);
        assert!(json["queued_on"].is_string());

        let parsed: TaskEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind, "start_flow");
    }

    #[test]
    fn scores_accumulate_and_cap() {
        // a fresh org charged a 250ms task
        assert_eq!(next_score(0, 0, 250), 250);
        // cost accumulates, pushing the org behind quieter ones
        assert_eq!(next_score(250, 0, 1000), 1250);
        // the cap bounds the penalty
        assert_eq!(next_score(SCORE_CAP, 0, 10_000), SCORE_CAP);
    }

    #[test]
    fn scores_decay_with_idle_time() {
        // sixteen seconds idle pays back one second of cost
        assert_eq!(next_score(5_000, 16_000, 0), 4_000);
        // and never goes negative
        assert_eq!(next_score(100, 1_000_000, 0), 0);
    }

    #[test]
    fn fairness_across_orgs() {
        // two orgs each complete tasks; the one doing cheap work keeps a
        // lower score, so pop (lowest score first) serves it first
        let mut noisy = 0;
        let mut quiet = 0;
        for _ in 0..10 {
            noisy = next_score(noisy, 0, 1_000);
            quiet = next_score(quiet, 0, 10);
        }
        assert!(quiet < noisy);
    }
}

//! Flows: the declarative definitions contacts traverse.

use std::time::Duration;

use serde::Deserialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;

use super::{FlowId, OrgId};

/// Flow type, stored as a single char column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Messaging,
    Background,
    Voice,
    Surveyor,
}

impl FlowType {
    pub fn code(&self) -> &'static str {
        match self {
            FlowType::Messaging => "M",
            FlowType::Background => "B",
            FlowType::Voice => "V",
            FlowType::Surveyor => "S",
        }
    }

    pub fn from_code(code: &str) -> FlowType {
        match code {
            "B" => FlowType::Background,
            "V" => FlowType::Voice,
            "S" => FlowType::Surveyor,
            _ => FlowType::Messaging,
        }
    }

    /// Whether starting a flow of this type interrupts a contact's waiting
    /// sessions. Background and surveyor flows never do.
    pub fn interrupts(&self) -> bool {
        !matches!(self, FlowType::Background | FlowType::Surveyor)
    }
}

/// Default wait before an errored IVR call is retried.
pub const DEFAULT_IVR_RETRY: Duration = Duration::from_secs(60 * 60);

const CONFIG_IVR_RETRY_MINUTES: &str = "ivr_retry";

#[derive(Debug, Clone, FromRow)]
pub struct Flow {
    pub id: FlowId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub flow_type: String,
    pub spec_version: String,
    pub definition: serde_json::Value,
    pub config: serde_json::Value,
    pub ignore_triggers: bool,
}

impl Flow {
    pub fn typ(&self) -> FlowType {
        FlowType::from_code(&self.flow_type)
    }

    /// The wait before retrying a failed IVR call for this flow, `None`
    /// meaning never retry (configured as -1).
    pub fn ivr_retry_wait(&self) -> Option<Duration> {
        match self.config.get(CONFIG_IVR_RETRY_MINUTES).and_then(|v| v.as_i64()) {
            Some(minutes) if minutes < 0 => None,
            Some(minutes) => Some(Duration::from_secs(minutes as u64 * 60)),
            None => Some(DEFAULT_IVR_RETRY),
        }
    }

    pub async fn load_by_id(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        flow_id: FlowId,
    ) -> Result<Option<Flow>> {
        load_flow(db, org_id, "f.id = $2", flow_id).await
    }

    pub async fn load_by_uuid(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
        uuid: Uuid,
    ) -> Result<Option<Flow>> {
        load_flow(db, org_id, "f.uuid = $2", uuid).await
    }

    pub async fn load_for_org(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Vec<Flow>> {
        let flows = sqlx::query_as::<_, Flow>(&select_flow_sql("TRUE"))
            .bind(org_id)
            .fetch_all(db)
            .await?;
        Ok(flows)
    }
}

/// Flows are read joined to their latest active revision, which carries the
/// definition and the spec version it was authored in.
fn select_flow_sql(clause: &str) -> String {
    format!(
        r#"
        SELECT f.id, f.uuid, f.org_id, f.name, f.flow_type, fr.spec_version,
               fr.definition, COALESCE(f.config, '{{}}'::jsonb) AS config, f.ignore_triggers
          FROM flows f
         INNER JOIN LATERAL (
               SELECT spec_version, definition
                 FROM flow_revisions
                WHERE flow_id = f.id AND is_active = TRUE
                ORDER BY revision DESC
                LIMIT 1
         ) fr ON TRUE
         WHERE f.org_id = $1 AND f.is_active = TRUE AND f.is_archived = FALSE AND {clause}
        "#
    )
}

async fn load_flow<'e, A>(
    db: impl sqlx::PgExecutor<'e>,
    org_id: OrgId,
    clause: &str,
    arg: A,
) -> Result<Option<Flow>>
where
    A: Send + sqlx::Type<sqlx::Postgres> + for<'q> sqlx::Encode<'q, sqlx::Postgres>,
{
    let sql = select_flow_sql(clause);
    let flow = sqlx::query_as::<_, Flow>(&sql)
        .bind(org_id)
        .bind(arg)
        .fetch_optional(db)
        .await?;
    Ok(flow)
}

/// Translates a flow UUID to its ID, falling back to the database for flows
/// no longer in the org's assets (archived mid-sprint).
pub async fn id_for_uuid(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    uuid: Uuid,
) -> Result<Option<FlowId>> {
    let row: Option<(FlowId,)> =
        sqlx::query_as("SELECT id FROM flows WHERE org_id = $1 AND uuid = $2")
            .bind(org_id)
            .bind(uuid)
            .fetch_optional(db)
            .await?;
    Ok(row.map(|r| r.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_with_config(config: serde_json::Value) -> Flow {
        Flow {
            id: 1,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: "IVR Flow".to_string(),
            flow_type: "V".to_string(),
            spec_version: "13.1.0".to_string(),
            definition: serde_json::json!({}),
            config,
            ignore_triggers: false,
        }
    }

    #[test]
    fn interrupts_by_type() {
        assert!(FlowType::Messaging.interrupts());
        assert!(FlowType::Voice.interrupts());
        assert!(!FlowType::Background.interrupts());
        assert!(!FlowType::Surveyor.interrupts());
    }

    #[test]
    fn ivr_retry_config() {
        let flow = flow_with_config(serde_json::json!({}));
        assert_eq!(flow.ivr_retry_wait(), Some(DEFAULT_IVR_RETRY));

        let flow = flow_with_config(serde_json::json!({"ivr_retry": 30}));
        assert_eq!(flow.ivr_retry_wait(), Some(Duration::from_secs(1800)));

        let flow = flow_with_config(serde_json::json!({"ivr_retry": -1}));
        assert_eq!(flow.ivr_retry_wait(), None);
    }
}

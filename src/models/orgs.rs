//! Orgs are the tenant boundary: every durable entity belongs to one and
//! every query filters by it.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{FlowhubError, Result};

use super::OrgId;

/// How sensitive values are masked in logs for this org.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionPolicy {
    #[default]
    None,
    Urns,
}

/// Per-org environment settings used for all date and language handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default)]
    pub allowed_languages: Vec<String>,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default)]
    pub redaction_policy: RedactionPolicy,
    /// whether outgoing messages consume topup credits
    #[serde(default)]
    pub uses_topups: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_language() -> String {
    "eng".to_string()
}
fn default_date_format() -> String {
    "DD-MM-YYYY".to_string()
}

impl Default for OrgConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Org {
    pub id: OrgId,
    pub name: String,
    pub is_active: bool,
    #[sqlx(json)]
    pub config: OrgConfig,
}

impl Org {
    /// The org's timezone; all campaign arithmetic happens in it.
    pub fn timezone(&self) -> Result<Tz> {
        self.config
            .timezone
            .parse()
            .map_err(|_| FlowhubError::Validation(format!("unknown timezone: {}", self.config.timezone)))
    }

    pub async fn load(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Org> {
        let org = sqlx::query_as::<_, Org>(
            "SELECT id, name, is_active, config FROM orgs WHERE id = $1 AND is_active = TRUE",
        )
        .bind(org_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| FlowhubError::AssetMissing(format!("no such org: {org_id}")))?;

        Ok(org)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: OrgConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.default_language, "eng");
        assert_eq!(config.redaction_policy, RedactionPolicy::None);
    }

    #[test]
    fn timezone_parsing() {
        let mut org = Org {
            id: 1,
            name: "Nyaruka".to_string(),
            is_active: true,
            config: OrgConfig::default(),
        };
        org.config.timezone = "America/Los_Angeles".to_string();
        assert_eq!(org.timezone().unwrap(), chrono_tz::America::Los_Angeles);

        org.config.timezone = "Mars/Olympus_Mons".to_string();
        assert!(org.timezone().is_err());
    }
}

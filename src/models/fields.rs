//! Contact fields: typed per-contact values keyed by field UUID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;

use super::{FieldId, OrgId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Datetime,
    State,
    District,
    Ward,
}

#[derive(Debug, Clone, FromRow)]
pub struct Field {
    pub id: FieldId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub key: String,
    pub name: String,
    pub field_type: String,
}

impl Field {
    pub async fn load_for_org(db: impl sqlx::PgExecutor<'_>, org_id: OrgId) -> Result<Vec<Field>> {
        let fields = sqlx::query_as::<_, Field>(
            "SELECT id, uuid, org_id, key, name, field_type FROM contact_fields WHERE org_id = $1 AND is_active = TRUE ORDER BY key",
        )
        .bind(org_id)
        .fetch_all(db)
        .await?;

        Ok(fields)
    }
}

/// A typed field value as stored in the contact's `fields` JSON column.
/// Values keep every representation the engine derived so queries can use
/// whichever fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ward: Option<String>,
}

impl FieldValue {
    pub fn text(value: &str) -> FieldValue {
        FieldValue {
            text: Some(value.to_string()),
            ..Default::default()
        }
    }

    pub fn datetime(value: DateTime<Utc>) -> FieldValue {
        FieldValue {
            datetime: Some(value),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.number.is_none()
            && self.datetime.is_none()
            && self.state.is_none()
            && self.district.is_none()
            && self.ward.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_serialization_omits_absent_parts() {
        let value = FieldValue::text("blue");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"text":"blue"}"#);

        let value: FieldValue = serde_json::from_str(r#"{"datetime": "2030-01-01T00:00:00Z"}"#).unwrap();
        assert!(value.datetime.is_some());
        assert!(value.text.is_none());
        assert!(!value.is_empty());
        assert!(FieldValue::default().is_empty());
    }
}

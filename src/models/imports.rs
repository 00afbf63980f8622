//! Contact imports: batches of contact specs produced by the UI's file
//! parser and applied here.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::Result;

use super::{ImportBatchId, ImportId, OrgId};

#[derive(Debug, Clone, FromRow)]
pub struct ContactImport {
    pub id: ImportId,
    pub org_id: OrgId,
    pub status: String,
    pub num_records: i32,
}

/// One contact to create or update, as parsed upstream from the import
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub urns: Vec<String>,
    #[serde(default)]
    pub fields: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub groups: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ContactImportBatch {
    pub id: ImportBatchId,
    pub import_id: ImportId,
    pub status: String,
    pub specs: Vec<ContactSpec>,
    pub record_start: i32,
    pub record_end: i32,
}

impl ContactImportBatch {
    pub async fn load(
        db: impl sqlx::PgExecutor<'_>,
        batch_id: ImportBatchId,
    ) -> Result<Option<ContactImportBatch>> {
        let row = sqlx::query(
            "SELECT id, contact_import_id, status, specs, record_start, record_end FROM contact_import_batches WHERE id = $1",
        )
        .bind(batch_id)
        .fetch_optional(db)
        .await?;

        row.map(|row| {
            let specs: serde_json::Value = row.get("specs");
            Ok(ContactImportBatch {
                id: row.get("id"),
                import_id: row.get("contact_import_id"),
                status: row.get("status"),
                specs: serde_json::from_value(specs)?,
                record_start: row.get("record_start"),
                record_end: row.get("record_end"),
            })
        })
        .transpose()
    }

    pub async fn mark_processing(&self, db: impl sqlx::PgExecutor<'_>) -> Result<()> {
        sqlx::query("UPDATE contact_import_batches SET status = 'O' WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn mark_complete(
        &self,
        db: impl sqlx::PgExecutor<'_>,
        num_created: usize,
        num_updated: usize,
        num_errored: usize,
        errors: &[String],
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contact_import_batches
               SET status = 'C', num_created = $2, num_updated = $3, num_errored = $4, errors = $5, finished_on = NOW()
             WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(num_created as i32)
        .bind(num_updated as i32)
        .bind(num_errored as i32)
        .bind(serde_json::to_value(errors)?)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, db: impl sqlx::PgExecutor<'_>) -> Result<()> {
        sqlx::query("UPDATE contact_import_batches SET status = 'F', finished_on = NOW() WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Marks the parent import complete once all of its batches have finished.
pub async fn maybe_complete_import(
    db: impl sqlx::PgExecutor<'_>,
    import_id: ImportId,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE contact_imports
           SET status = 'C', finished_on = NOW()
         WHERE id = $1
           AND NOT EXISTS (SELECT 1 FROM contact_import_batches WHERE contact_import_id = $1 AND status NOT IN ('C', 'F'))
        "#,
    )
    .bind(import_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: ContactSpec = serde_json::from_str(
            r#"{"name": "Joe", "urns": ["tel:+1234"], "fields": {"age": "39"}}"#,
        )
        .unwrap();
        assert_eq!(spec.name.as_deref(), Some("Joe"));
        assert_eq!(spec.urns, vec!["tel:+1234"]);
        assert!(spec.uuid.is_none());
        assert!(spec.groups.is_empty());
    }
}

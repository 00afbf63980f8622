//! Applying one parsed batch of a contact import.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::UuidGenerator;
use crate::error::{FlowhubError, Result};
use crate::models::imports::{self, ContactImportBatch, ContactSpec};
use crate::models::urns::Urn;
use crate::models::{groups, Contact, ImportBatchId, OrgId};
use crate::runtime::Runtime;
use crate::tasks::Task;

pub const IMPORT_CONTACT_BATCH: &str = "import_contact_batch";

pub fn decode(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let task: ImportContactBatchTask = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportContactBatchTask {
    pub contact_import_batch_id: ImportBatchId,
}

#[async_trait]
impl Task for ImportContactBatchTask {
    fn kind(&self) -> &'static str {
        IMPORT_CONTACT_BATCH
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        let Some(batch) = ContactImportBatch::load(&rt.db, self.contact_import_batch_id).await?
        else {
            return Err(FlowhubError::Validation(format!(
                "no such import batch: {}",
                self.contact_import_batch_id
            )));
        };
        batch.mark_processing(&rt.db).await?;

        let outcome = import_specs(&rt, org_id, &batch.specs).await;
        match &outcome {
            Ok((created, updated, errored, errors)) => {
                batch.mark_complete(&rt.db, *created, *updated, *errored, errors).await?;
                info!(
                    org_id,
                    batch_id = batch.id,
                    created,
                    updated,
                    errored,
                    "import batch complete"
                );
            }
            Err(_) => {
                batch.mark_failed(&rt.db).await?;
            }
        }
        imports::maybe_complete_import(&rt.db, batch.import_id).await?;

        outcome.map(|_| ())
    }
}

type ImportCounts = (usize, usize, usize, Vec<String>);

async fn import_specs(
    rt: &Arc<Runtime>,
    org_id: OrgId,
    specs: &[ContactSpec],
) -> Result<ImportCounts> {
    let assets = rt.cache.get(&rt.db, org_id).await?;
    let mut conn = rt.db.acquire().await?;

    let mut created = 0;
    let mut updated = 0;
    let mut errored = 0;
    let mut errors = Vec::new();

    for spec in specs {
        match import_one(rt, &mut *conn, org_id, spec).await {
            Ok(was_created) => {
                if was_created {
                    created += 1;
                } else {
                    updated += 1;
                }
                import_one_groups(&mut *conn, &assets, spec).await?;
            }
            Err(err) => {
                errored += 1;
                errors.push(err.outermost());
            }
        }
    }

    Ok((created, updated, errored, errors))
}

/// Creates or updates one contact from its spec, returning whether it was
/// created.
async fn import_one(
    rt: &Arc<Runtime>,
    conn: &mut sqlx::PgConnection,
    org_id: OrgId,
    spec: &ContactSpec,
) -> Result<bool> {
    let parsed_urns: Result<Vec<Urn>> = spec.urns.iter().map(|u| Urn::parse(u)).collect();
    let parsed_urns = parsed_urns?;

    // resolve by explicit uuid, then by any owned urn
    let mut existing: Option<i64> = match spec.uuid {
        Some(uuid) => {
            sqlx::query_as::<_, (i64,)>("SELECT id FROM contacts WHERE org_id = $1 AND uuid = $2")
                .bind(org_id)
                .bind(uuid)
                .fetch_optional(&mut *conn)
                .await?
                .map(|r| r.0)
        }
        None => None,
    };
    if existing.is_none() {
        for urn in &parsed_urns {
            if let Some(id) =
                crate::models::urns::contact_for_identity(&mut *conn, org_id, &urn.identity())
                    .await?
            {
                existing = Some(id);
                break;
            }
        }
    }

    match existing {
        Some(contact_id) => {
            sqlx::query(
                "UPDATE contacts SET name = COALESCE($2, name), language = COALESCE($3, language), modified_on = NOW() WHERE id = $1",
            )
            .bind(contact_id)
            .bind(&spec.name)
            .bind(&spec.language)
            .execute(&mut *conn)
            .await?;
            if !parsed_urns.is_empty() {
                crate::models::urns::set_contact_urns(conn, org_id, contact_id, &parsed_urns)
                    .await?;
            }
            Ok(false)
        }
        None => {
            Contact::create(
                conn,
                org_id,
                spec.uuid.unwrap_or_else(|| rt.uuids.next()),
                spec.name.as_deref(),
                spec.language.as_deref(),
                &parsed_urns,
            )
            .await?;
            Ok(true)
        }
    }
}

/// Applies the spec's group memberships.
async fn import_one_groups(
    conn: &mut sqlx::PgConnection,
    assets: &crate::assets::OrgAssets,
    spec: &ContactSpec,
) -> Result<bool> {
    if spec.groups.is_empty() {
        return Ok(false);
    }
    let Some(uuid) = spec.uuid else { return Ok(false) };
    let Some((contact_id,)) =
        sqlx::query_as::<_, (i64,)>("SELECT id FROM contacts WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&mut *conn)
            .await?
    else {
        return Ok(false);
    };

    let memberships: Vec<groups::GroupMembership> = spec
        .groups
        .iter()
        .filter_map(|group_uuid| assets.group_by_uuid(group_uuid))
        .map(|group| groups::GroupMembership { contact_id, group_id: group.id })
        .collect();
    groups::add_memberships(&mut *conn, &memberships).await?;
    Ok(true)
}

//! Hooks committing HTTP logs and airtime transfer rows.

use async_trait::async_trait;

use crate::assets::OrgAssets;
use crate::error::Result;
use crate::models::http_logs::{self, HttpLog};
use crate::runtime::Runtime;

use super::{CommitHook, HookId, HookItem, SceneItems};

pub struct CommitHttpLogsHook;

#[async_trait]
impl CommitHook for CommitHttpLogsHook {
    fn id(&self) -> HookId {
        HookId::CommitHttpLogs
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut logs: Vec<HttpLog> = Vec::new();
        for scene in scenes {
            for item in scene.items {
                if let HookItem::HttpLog(log) = item {
                    logs.push(log);
                }
            }
        }
        http_logs::insert_http_logs(tx, &logs).await
    }
}

pub struct CommitAirtimeTransfersHook;

#[async_trait]
impl CommitHook for CommitAirtimeTransfersHook {
    fn id(&self) -> HookId {
        HookId::CommitAirtimeTransfers
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut org_ids = Vec::new();
        let mut contact_ids = Vec::new();
        let mut senders = Vec::new();
        let mut recipients = Vec::new();
        let mut currencies = Vec::new();
        let mut desired = Vec::new();
        let mut actual = Vec::new();

        for scene in &scenes {
            for item in &scene.items {
                if let HookItem::AirtimeTransfer(transfer) = item {
                    org_ids.push(assets.org_id());
                    contact_ids.push(scene.contact_id);
                    senders.push(transfer.sender.clone());
                    recipients.push(transfer.recipient.clone());
                    currencies.push(transfer.currency.clone());
                    desired.push(transfer.desired_amount);
                    actual.push(transfer.actual_amount);
                }
            }
        }
        if org_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO airtime_transfers(org_id, contact_id, sender, recipient, currency, desired_amount, actual_amount, created_on)
            SELECT r.*, NOW()
              FROM UNNEST($1::int[], $2::bigint[], $3::text[], $4::text[], $5::text[], $6::float8[], $7::float8[])
                   AS r(org_id, contact_id, sender, recipient, currency, desired_amount, actual_amount)
            "#,
        )
        .bind(&org_ids)
        .bind(&contact_ids)
        .bind(&senders)
        .bind(&recipients)
        .bind(&currencies)
        .bind(&desired)
        .bind(&actual)
        .execute(tx)
        .await?;

        Ok(())
    }
}

//! Repopulating query-based groups after their query changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FlowhubError, Result, WrapErr};
use crate::locker;
use crate::models::{groups, GroupId, OrgId};
use crate::runtime::Runtime;
use crate::search::SearchClient;
use crate::search;
use crate::tasks::Task;

pub const POPULATE_QUERY_GROUP: &str = "populate_query_group";

pub fn decode(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let task: PopulateQueryGroupTask = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PopulateQueryGroupTask {
    pub group_id: GroupId,
    pub query: String,
}

#[async_trait]
impl Task for PopulateQueryGroupTask {
    fn kind(&self) -> &'static str {
        POPULATE_QUERY_GROUP
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1800)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        let lock_name = format!("populate_group_{}", self.group_id);
        let token = locker::acquire(
            &rt.db,
            &lock_name,
            Duration::from_secs(1800),
            Duration::from_secs(60),
        )
        .await?;

        let result = populate(&rt, org_id, self.group_id, &self.query).await;

        let _ = locker::release(&rt.db, &lock_name, &token).await;
        result.wrap_err(format!("error populating group {}", self.group_id))
    }
}

async fn populate(rt: &Arc<Runtime>, org_id: OrgId, group_id: GroupId, query: &str) -> Result<()> {
    let assets = rt
        .cache
        .get_with_refresh(&rt.db, org_id, crate::assets::Refresh::GROUPS)
        .await?;
    if assets.group(group_id).is_none() {
        return Err(FlowhubError::AssetMissing(format!("no such group: {group_id}")));
    }

    let parsed = search::parse_query(&assets, query)?;
    let contact_ids = rt.search.contact_ids(&assets, None, &parsed, 10_000_000).await?;

    let mut conn = rt.db.acquire().await?;
    let count = groups::set_members(&mut *conn, group_id, &contact_ids).await?;

    info!(org_id, group_id, members = count, "query group populated");
    Ok(())
}

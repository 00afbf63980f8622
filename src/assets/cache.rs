//! The process-wide org asset cache.
//!
//! Readers clone an `Arc` to the current snapshot and keep a consistent
//! view for their whole task even if a refresh swaps the entry mid-flight.
//! Concurrent refreshes of one org coalesce behind a per-org guard: the
//! second caller waits, sees the generation already advanced and takes the
//! fresh snapshot without reloading again.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::OrgId;

use super::{OrgAssets, Refresh};

#[derive(Default)]
pub struct AssetCache {
    entries: RwLock<HashMap<OrgId, Arc<OrgAssets>>>,
    guards: Mutex<HashMap<OrgId, Arc<Mutex<()>>>>,
}

impl AssetCache {
    pub fn new() -> AssetCache {
        AssetCache::default()
    }

    /// The current snapshot for the org, loading it on first use.
    pub async fn get(&self, db: &PgPool, org_id: OrgId) -> Result<Arc<OrgAssets>> {
        if let Some(assets) = self.entries.read().unwrap().get(&org_id) {
            return Ok(assets.clone());
        }
        self.get_with_refresh(db, org_id, Refresh::NONE).await
    }

    /// A snapshot with at least the classes in `mask` freshly loaded. A
    /// refresh error leaves the previous generation in place.
    pub async fn get_with_refresh(
        &self,
        db: &PgPool,
        org_id: OrgId,
        mask: Refresh,
    ) -> Result<Arc<OrgAssets>> {
        let observed = self
            .entries
            .read()
            .unwrap()
            .get(&org_id)
            .map(|a| a.generation());

        let guard = {
            let mut guards = self.guards.lock().await;
            guards.entry(org_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _held = guard.lock().await;

        // another caller may have finished the same refresh while we waited
        let current = self.entries.read().unwrap().get(&org_id).cloned();
        if let Some(current) = &current {
            let advanced = match observed {
                Some(observed) => current.generation() > observed,
                None => true,
            };
            if advanced || mask == Refresh::NONE {
                debug!(org_id, generation = current.generation(), "asset refresh coalesced");
                return Ok(current.clone());
            }
        }

        let next = match &current {
            Some(current) => current.refreshed(db, mask).await,
            None => OrgAssets::load(db, org_id).await,
        };

        match next {
            Ok(next) => {
                let next = Arc::new(next);
                self.entries.write().unwrap().insert(org_id, next.clone());
                debug!(org_id, generation = next.generation(), "org assets loaded");
                Ok(next)
            }
            Err(err) => {
                warn!(org_id, error = %err, "error refreshing org assets");
                Err(err)
            }
        }
    }

    /// Evicts every cached entry.
    pub fn flush_all(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Number of orgs currently cached.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn put_for_tests(&self, org_id: OrgId, assets: OrgAssets) {
        self.entries.write().unwrap().insert(org_id, Arc::new(assets));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::orgs::{Org, OrgConfig};

    fn test_org(id: OrgId) -> Org {
        Org {
            id,
            name: format!("Org {id}"),
            is_active: true,
            config: OrgConfig::default(),
        }
    }

    #[tokio::test]
    async fn cached_entries_are_shared_and_flushable() {
        let cache = AssetCache::new();
        cache.put_for_tests(1, OrgAssets::for_tests(test_org(1)));
        cache.put_for_tests(2, OrgAssets::for_tests(test_org(2)));
        assert_eq!(cache.len(), 2);

        // readers share the same snapshot
        let a = cache.entries.read().unwrap().get(&1).cloned().unwrap();
        let b = cache.entries.read().unwrap().get(&1).cloned().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        cache.flush_all();
        assert!(cache.is_empty());
        // held references stay valid after a flush
        assert_eq!(a.org_id(), 1);
    }
}

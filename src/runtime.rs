//! The runtime bundle: every shared handle a task or request handler
//! needs, passed explicitly so tests can swap any collaborator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::assets::AssetCache;
use crate::config::Config;
use crate::engine::{FlowEngine, RandomUuids, UuidGenerator};
use crate::error::Result;
use crate::handlers::HandlerRegistry;
use crate::hooks::HookRegistry;
use crate::search::{HttpSearchClient, SearchClient};
use crate::services::ivr::IvrProviderRegistry;
use crate::services::tickets::TicketServiceRegistry;
use crate::storage::{FsStorage, ObjectStorage};
use crate::tasks::TaskRegistry;

/// Process counters surfaced by the health endpoint.
#[derive(Default)]
pub struct Stats {
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub post_commit_failures: AtomicU64,
}

impl Stats {
    pub fn record_post_commit_failure(&self) {
        self.post_commit_failures.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Runtime {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub cache: AssetCache,
    pub storage: Arc<dyn ObjectStorage>,
    pub search: Arc<dyn SearchClient>,
    pub engine: Arc<dyn FlowEngine>,
    pub http: reqwest::Client,
    pub uuids: Arc<dyn UuidGenerator>,
    pub tasks: TaskRegistry,
    pub handlers: HandlerRegistry,
    pub hooks: HookRegistry,
    pub ticket_services: TicketServiceRegistry,
    pub ivr_providers: IvrProviderRegistry,
    pub stats: Stats,
}

impl Runtime {
    /// Builds the production runtime from configuration. The interpreter
    /// handle is supplied by the caller since it's an external library.
    pub async fn create(config: Config, engine: Arc<dyn FlowEngine>) -> Result<Runtime> {
        let db = PgPoolOptions::new()
            .max_connections(config.database_pool_size)
            .connect(&config.database_url)
            .await?;

        let http = reqwest::Client::new();
        let search = Arc::new(HttpSearchClient::new(http.clone(), &config.search_url));
        let storage = Arc::new(FsStorage::new(&config.storage_dir));

        Ok(Runtime {
            db,
            config: Arc::new(config),
            cache: AssetCache::new(),
            storage,
            search,
            engine,
            http,
            uuids: Arc::new(RandomUuids),
            tasks: TaskRegistry::new(),
            handlers: HandlerRegistry::new(),
            hooks: HookRegistry::new(),
            ticket_services: TicketServiceRegistry::new(),
            ivr_providers: IvrProviderRegistry::new(),
            stats: Stats::default(),
        })
    }

    #[cfg(test)]
    pub fn for_tests(engine: Arc<dyn FlowEngine>) -> Runtime {
        let config = Config::default();
        // a lazy pool never connects unless a test actually queries it
        let db = PgPoolOptions::new().connect_lazy(&config.database_url).expect("lazy pool");

        Runtime {
            db,
            config: Arc::new(config),
            cache: AssetCache::new(),
            storage: Arc::new(crate::storage::MemoryStorage::new()),
            search: Arc::new(crate::search::MockSearchClient::new()),
            engine,
            http: reqwest::Client::new(),
            uuids: Arc::new(crate::engine::SeededUuids::new(1234)),
            tasks: TaskRegistry::new(),
            handlers: HandlerRegistry::new(),
            hooks: HookRegistry::new(),
            ticket_services: TicketServiceRegistry::new(),
            ivr_providers: IvrProviderRegistry::new(),
            stats: Stats::default(),
        }
    }
}

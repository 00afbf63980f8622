pub mod assets;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod locker;
pub mod logging;
pub mod models;
pub mod queue;
pub mod runner;
pub mod runtime;
pub mod search;
pub mod services;
pub mod storage;
pub mod tasks;
pub mod web;

pub use config::Config;
pub use error::{FlowhubError, Result};
pub use runtime::Runtime;

/// Populates every registry on the passed in runtime: tasks, event
/// handlers, commit hooks, ticket services and IVR providers. Called once
/// at process start and from tests that need a fully wired runtime.
pub fn wire(rt: &mut runtime::Runtime) {
    tasks::wire(&mut rt.tasks);
    handlers::wire(&mut rt.handlers);
    hooks::wire(&mut rt.hooks);
    services::tickets::wire(&mut rt.ticket_services);
    services::ivr::wire(&mut rt.ivr_providers);
}

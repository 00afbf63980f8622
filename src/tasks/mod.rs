//! Typed tasks, the registry that decodes them off the queues, worker
//! pools and the cron loop.

pub mod campaigns;
pub mod cron;
pub mod expirations;
pub mod groups;
pub mod handler;
pub mod imports;
pub mod interrupts;
pub mod ivr;
pub mod starts;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FlowhubError, Result};
use crate::models::OrgId;
use crate::queue::TaskEnvelope;
use crate::runtime::Runtime;

pub use worker::WorkerPool;

/// A typed, JSON-decoded job.
#[async_trait]
pub trait Task: Send + Sync {
    fn kind(&self) -> &'static str;

    /// The maximum wall clock the task may run for.
    fn timeout(&self) -> Duration;

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()>;
}

/// Decodes a task's JSON payload into its typed form.
pub type TaskDecoder = fn(serde_json::Value) -> Result<Box<dyn Task>>;

/// Registered task kinds. Populated at the wiring point; registering a
/// kind twice is a programming error.
pub struct TaskRegistry {
    decoders: HashMap<&'static str, TaskDecoder>,
}

impl TaskRegistry {
    pub fn new() -> TaskRegistry {
        TaskRegistry { decoders: HashMap::new() }
    }

    pub fn register(&mut self, kind: &'static str, decoder: TaskDecoder) {
        if self.decoders.insert(kind, decoder).is_some() {
            panic!("duplicate task registered for type: {kind}");
        }
    }

    /// Decodes an envelope popped off a queue.
    pub fn decode(&self, envelope: &TaskEnvelope) -> Result<Box<dyn Task>> {
        let decoder = self.decoders.get(envelope.kind.as_str()).ok_or_else(|| {
            FlowhubError::Validation(format!("unknown task type: {}", envelope.kind))
        })?;
        decoder(envelope.task.clone())
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        TaskRegistry::new()
    }
}

/// Registers every task kind. Called from the single wiring point.
pub fn wire(registry: &mut TaskRegistry) {
    registry.register(starts::START_FLOW, starts::decode_start_flow);
    registry.register(starts::START_FLOW_BATCH, starts::decode_start_flow_batch);
    registry.register(handler::HANDLE_CONTACT_EVENT, handler::decode);
    registry.register(campaigns::SCHEDULE_CAMPAIGN_EVENT, campaigns::decode_schedule);
    registry.register(campaigns::FIRE_CAMPAIGN_EVENT, campaigns::decode_fire);
    registry.register(imports::IMPORT_CONTACT_BATCH, imports::decode);
    registry.register(interrupts::INTERRUPT_SESSIONS, interrupts::decode);
    registry.register(groups::POPULATE_QUERY_GROUP, groups::decode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;

    #[tokio::test]
    async fn wiring_registers_every_kind() {
        let mut rt = Runtime::for_tests(Arc::new(StubEngine::new()));
        crate::wire(&mut rt);

        assert_eq!(rt.tasks.len(), 8);
        assert!(!rt.handlers.is_empty());
        assert!(!rt.hooks.is_empty());
        assert!(!rt.ticket_services.is_empty());
        assert!(!rt.ivr_providers.is_empty());
    }

    #[test]
    fn decoding_unknown_kind_fails_fast() {
        let registry = TaskRegistry::new();
        let envelope = TaskEnvelope::new("no_such_task", 1, serde_json::json!({}));
        let err = match registry.decode(&envelope) {
            Ok(_) => panic!("expected decode failure for unknown task kind"),
            Err(e) => e,
        };
        assert!(err.is_permanent());
    }

    #[test]
    fn decoding_round_trips_a_start_task() {
        let mut registry = TaskRegistry::new();
        wire(&mut registry);

        let start = crate::models::FlowStart::new(1, crate::models::starts::StartType::Manual, 9);
        let envelope =
            TaskEnvelope::new(starts::START_FLOW, 1, serde_json::to_value(&start).unwrap());
        let task = registry.decode(&envelope).unwrap();
        assert_eq!(task.kind(), starts::START_FLOW);
    }
}

//! Ticketing dispatch: a polymorphic registry of ticket services keyed by
//! ticketer type. Every vendor call is traced into an HTTP log row with
//! credentials redacted.

mod mailgun;
mod zendesk;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{FlowhubError, Result};
use crate::models::{Contact, Ticket, Ticketer};
use crate::runtime::Runtime;

use super::HttpTrace;

pub use mailgun::MailgunService;
pub use zendesk::ZendeskService;

/// What a vendor returned for a newly opened ticket.
#[derive(Debug, Clone, Default)]
pub struct OpenedTicket {
    pub external_id: Option<String>,
    /// vendor-specific state carried on the ticket row
    pub config: HashMap<String, String>,
}

/// A concrete ticketing backend. Implementations push their traced HTTP
/// exchanges onto `traces` whether the call succeeds or not.
#[async_trait]
pub trait TicketService: Send + Sync {
    async fn open(
        &self,
        contact: &Contact,
        subject: &str,
        body: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<OpenedTicket>;

    async fn forward(
        &self,
        ticket: &Ticket,
        text: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<()>;

    async fn close(&self, tickets: &[Ticket], traces: &mut Vec<HttpTrace>) -> Result<()>;

    async fn reopen(&self, tickets: &[Ticket], traces: &mut Vec<HttpTrace>) -> Result<()>;
}

/// Builds a service instance for a ticketer from its config map.
pub type TicketServiceFactory = fn(&Runtime, &Ticketer) -> Result<Box<dyn TicketService>>;

pub struct TicketServiceRegistry {
    factories: HashMap<&'static str, TicketServiceFactory>,
}

impl TicketServiceRegistry {
    pub fn new() -> TicketServiceRegistry {
        TicketServiceRegistry { factories: HashMap::new() }
    }

    pub fn register(&mut self, service_type: &'static str, factory: TicketServiceFactory) {
        if self.factories.insert(service_type, factory).is_some() {
            panic!("duplicate ticket service registered for type: {service_type}");
        }
    }

    /// Instantiates the service for a ticketer.
    pub fn create(&self, rt: &Runtime, ticketer: &Ticketer) -> Result<Box<dyn TicketService>> {
        let factory = self.factories.get(ticketer.ticketer_type.as_str()).ok_or_else(|| {
            FlowhubError::Service(format!(
                "unknown ticket service type: {}",
                ticketer.ticketer_type
            ))
        })?;
        factory(rt, ticketer)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for TicketServiceRegistry {
    fn default() -> Self {
        TicketServiceRegistry::new()
    }
}

/// Registers the built-in services. Called from the single wiring point.
pub fn wire(registry: &mut TicketServiceRegistry) {
    registry.register("mailgun", mailgun::factory);
    registry.register("zendesk", zendesk::factory);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "duplicate ticket service")]
    fn duplicate_service_registration_panics() {
        let mut registry = TicketServiceRegistry::new();
        registry.register("mailgun", mailgun::factory);
        registry.register("mailgun", mailgun::factory);
    }
}

//! IVR dispatch: a registry of call providers keyed by channel type.
//!
//! Providers translate between provider-native callbacks and the engine's
//! triggers/resumes, request and hang up calls, and render the session's
//! pending prompt as the provider's response format.

mod psm;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::engine::{EngineOutput, Resume};
use crate::error::{FlowhubError, Result};
use crate::models::channels::ChannelEventType;
use crate::models::{Channel, ConnectionStatus};
use crate::runtime::Runtime;

use super::HttpTrace;

pub use psm::PsmProvider;

/// A provider-native callback, parsed once by the web surface.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    pub query: HashMap<String, String>,
    pub body: serde_json::Value,
}

impl CallbackRequest {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(|v| v.as_str())
    }
}

/// A concrete voice provider.
#[async_trait]
pub trait IvrProvider: Send + Sync {
    /// Requests a new outgoing call, returning the provider's call id.
    async fn request_call(
        &self,
        urn: &str,
        handle_url: &str,
        status_url: &str,
        traces: &mut Vec<HttpTrace>,
    ) -> Result<String>;

    /// Asks the provider to hang up a call.
    async fn hangup_call(&self, external_id: &str, traces: &mut Vec<HttpTrace>) -> Result<()>;

    /// Verifies the callback actually came from the provider.
    fn validate_signature(&self, request: &CallbackRequest) -> Result<()>;

    /// The contact URN a callback belongs to.
    fn urn_for_request(&self, request: &CallbackRequest) -> Result<String>;

    /// The provider call id in a callback.
    fn call_id_for_request(&self, request: &CallbackRequest) -> Result<String>;

    /// The connection status a status callback reports, with the call
    /// duration when the call ended.
    fn status_for_request(&self, request: &CallbackRequest) -> (ConnectionStatus, i32);

    /// Builds the engine resume for an input callback.
    fn resume_for_request(&self, request: &CallbackRequest) -> Result<Resume>;

    /// Classifies an inbound call-event payload.
    fn event_for_call_data(&self, request: &CallbackRequest) -> Result<(ChannelEventType, i32)>;

    /// Renders the sprint's prompt as the provider's native response.
    fn write_session_response(&self, output: &EngineOutput, resume_url: &str) -> Result<serde_json::Value>;

    /// A provider-native error response body.
    fn error_response(&self, message: &str) -> serde_json::Value;

    /// A provider-native empty acknowledgment body.
    fn empty_response(&self, message: &str) -> serde_json::Value;
}

pub type IvrProviderFactory = fn(&Runtime, &Channel) -> Result<Box<dyn IvrProvider>>;

/// Providers keyed by channel type.
pub struct IvrProviderRegistry {
    factories: HashMap<&'static str, IvrProviderFactory>,
}

impl IvrProviderRegistry {
    pub fn new() -> IvrProviderRegistry {
        IvrProviderRegistry { factories: HashMap::new() }
    }

    pub fn register(&mut self, channel_type: &'static str, factory: IvrProviderFactory) {
        if self.factories.insert(channel_type, factory).is_some() {
            panic!("duplicate IVR provider registered for channel type: {channel_type}");
        }
    }

    pub fn create(&self, rt: &Runtime, channel: &Channel) -> Result<Box<dyn IvrProvider>> {
        let factory = self.factories.get(channel.channel_type.as_str()).ok_or_else(|| {
            FlowhubError::Service(format!(
                "no IVR provider for channel type: {}",
                channel.channel_type
            ))
        })?;
        factory(rt, channel)
    }

    pub fn supports(&self, channel_type: &str) -> bool {
        self.factories.contains_key(channel_type)
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for IvrProviderRegistry {
    fn default() -> Self {
        IvrProviderRegistry::new()
    }
}

/// Registers the built-in providers. Called from the single wiring point.
pub fn wire(registry: &mut IvrProviderRegistry) {
    registry.register("PSM", psm::factory);
}

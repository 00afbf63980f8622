//! The interpreter boundary.
//!
//! The flow interpreter is an external library consumed as a black box:
//! it takes assets plus a trigger or resume and session state, and
//! produces new session state, an event list and sprint metadata. This
//! module owns that contract so the rest of the system can run against a
//! stub interpreter in tests.

pub mod definition;
pub mod events;
pub mod exec;

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::error::Result;

pub use events::{ChannelRef, Event, FieldRef, FlowRef, GroupRef, LabelRef, MsgOut, TicketerRef};

/// Where a new session came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerOrigin {
    /// a user or the API started the contact directly
    Manual,
    /// a campaign event fired
    Campaign { event_uuid: Uuid },
    /// a parent flow's action started this contact
    FlowAction { parent_summary: serde_json::Value },
    /// a channel event such as an incoming call
    Channel { event_type: String, extra: serde_json::Value },
    /// an incoming message matched a trigger
    Msg { msg_uuid: Uuid, text: String },
}

/// The input that begins a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub flow: FlowRef,
    pub contact_uuid: Uuid,
    pub origin: TriggerOrigin,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The input that resumes a waiting session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resume {
    /// an incoming message from the contact
    Msg { msg_uuid: Uuid, text: String, urn: Option<String> },
    /// the wait timed out
    WaitTimeout,
    /// the whole session passed its expiry
    Expiration,
    /// a voice call reached a terminal or answered state
    Dial { status: String, duration_seconds: i32 },
}

/// Session status as the interpreter reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Waiting,
    Completed,
    Failed,
}

/// One run in the interpreter's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRun {
    pub uuid: Uuid,
    pub flow: FlowRef,
    pub status: EngineStatus,
    #[serde(default)]
    pub results: serde_json::Value,
    #[serde(default)]
    pub path: serde_json::Value,
    pub exited: bool,
}

/// The wait the interpreter parked on, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineWait {
    /// seconds until the wait times out on its own
    pub timeout_seconds: Option<u64>,
}

/// Everything one sprint produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutput {
    pub session_uuid: Uuid,
    pub status: EngineStatus,
    pub current_flow: Option<FlowRef>,
    pub runs: Vec<EngineRun>,
    pub wait: Option<EngineWait>,
    /// opaque serialized interpreter state, persisted to object storage
    pub state: serde_json::Value,
    pub events: Vec<Event>,
}

/// The interpreter contract. Implementations are pure CPU; all I/O stays
/// on this side of the boundary.
pub trait FlowEngine: Send + Sync {
    fn new_session(&self, assets: &OrgAssets, trigger: &Trigger) -> Result<EngineOutput>;

    fn resume_session(
        &self,
        assets: &OrgAssets,
        state: &serde_json::Value,
        resume: &Resume,
    ) -> Result<EngineOutput>;
}

/// UUID source, swappable so tests and definition cloning are
/// deterministic.
pub trait UuidGenerator: Send + Sync {
    fn next(&self) -> Uuid;
}

/// The production generator: random v4.
pub struct RandomUuids;

impl UuidGenerator for RandomUuids {
    fn next(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic generator seeded for tests and clone operations.
pub struct SeededUuids {
    state: Mutex<u64>,
}

impl SeededUuids {
    pub fn new(seed: u64) -> SeededUuids {
        SeededUuids { state: Mutex::new(seed) }
    }

    fn next_u64(state: &mut u64) -> u64 {
        // splitmix64 step
        *state = state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = *state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }
}

impl UuidGenerator for SeededUuids {
    fn next(&self) -> Uuid {
        let mut state = self.state.lock().unwrap();
        let hi = Self::next_u64(&mut state);
        let lo = Self::next_u64(&mut state);

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        // stamp version 4 and RFC 4122 variant bits
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Uuid::from_bytes(bytes)
    }
}

#[cfg(test)]
pub mod stub {
    //! A scriptable interpreter for tests: hand it the outputs to produce
    //! per contact and it replays them.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::FlowhubError;

    #[derive(Default)]
    pub struct StubEngine {
        outputs: Mutex<HashMap<Uuid, Vec<EngineOutput>>>,
    }

    impl StubEngine {
        pub fn new() -> StubEngine {
            StubEngine::default()
        }

        /// Queues the next output for a contact.
        pub fn script(&self, contact_uuid: Uuid, output: EngineOutput) {
            self.outputs
                .lock()
                .unwrap()
                .entry(contact_uuid)
                .or_default()
                .push(output);
        }

        fn take(&self, contact_uuid: &Uuid) -> Result<EngineOutput> {
            let mut outputs = self.outputs.lock().unwrap();
            let queue = outputs
                .get_mut(contact_uuid)
                .filter(|q| !q.is_empty())
                .ok_or_else(|| {
                    FlowhubError::Engine(format!("no scripted output for contact {contact_uuid}"))
                })?;
            Ok(queue.remove(0))
        }
    }

    impl FlowEngine for StubEngine {
        fn new_session(&self, _assets: &OrgAssets, trigger: &Trigger) -> Result<EngineOutput> {
            self.take(&trigger.contact_uuid)
        }

        fn resume_session(
            &self,
            _assets: &OrgAssets,
            state: &serde_json::Value,
            _resume: &Resume,
        ) -> Result<EngineOutput> {
            let contact_uuid = state
                .get("contact_uuid")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| FlowhubError::Engine("state has no contact_uuid".to_string()))?;
            self.take(&contact_uuid)
        }
    }

    /// A minimal completed-session output for one contact.
    pub fn completed_output(contact_uuid: Uuid, flow: FlowRef, events: Vec<Event>) -> EngineOutput {
        EngineOutput {
            session_uuid: Uuid::new_v4(),
            status: EngineStatus::Completed,
            current_flow: None,
            runs: vec![EngineRun {
                uuid: Uuid::new_v4(),
                flow: flow.clone(),
                status: EngineStatus::Completed,
                results: serde_json::json!({}),
                path: serde_json::json!([]),
                exited: true,
            }],
            wait: None,
            state: serde_json::json!({"contact_uuid": contact_uuid}),
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_uuids_are_deterministic() {
        let a = SeededUuids::new(1234);
        let b = SeededUuids::new(1234);
        let first_a: Vec<Uuid> = (0..4).map(|_| a.next()).collect();
        let first_b: Vec<Uuid> = (0..4).map(|_| b.next()).collect();
        assert_eq!(first_a, first_b);

        // different seeds diverge
        let c = SeededUuids::new(99);
        assert_ne!(first_a[0], c.next());

        // generated uuids are valid v4
        assert_eq!(first_a[0].get_version_num(), 4);
    }

    #[test]
    fn resume_serialization() {
        let resume = Resume::Dial { status: "answered".to_string(), duration_seconds: 12 };
        let json = serde_json::to_value(&resume).unwrap();
        assert_eq!(json["type"], "dial");
        assert_eq!(json["duration_seconds"], 12);
    }
}

//! The events the interpreter emits during a sprint. Each kind maps to at
//! most one handler in the handler registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::contacts::ContactStatus;
use crate::models::fields::FieldValue;

/// Reference to an asset by UUID plus its name at emission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRef {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRef {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketerRef {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub key: String,
    pub name: String,
}

/// An outgoing message as the interpreter renders it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgOut {
    pub uuid: Uuid,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
}

/// One vendor exchange reported inside an event (e.g. airtime transfers
/// carry the calls the interpreter already made).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLogData {
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: String,
    pub elapsed_ms: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MsgCreated {
        msg: MsgOut,
    },
    MsgReceived {
        msg_uuid: Uuid,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        urn: Option<String>,
    },
    IvrCreated {
        msg: MsgOut,
    },
    ContactNameChanged {
        name: String,
    },
    ContactLanguageChanged {
        language: String,
    },
    ContactStatusChanged {
        status: ContactStatus,
    },
    ContactTimezoneChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    ContactFieldChanged {
        field: FieldRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<FieldValue>,
    },
    ContactGroupsChanged {
        #[serde(default)]
        groups_added: Vec<GroupRef>,
        #[serde(default)]
        groups_removed: Vec<GroupRef>,
    },
    ContactUrnsChanged {
        urns: Vec<String>,
    },
    InputLabelsAdded {
        input_uuid: Uuid,
        labels: Vec<LabelRef>,
    },
    BroadcastCreated {
        translations: HashMap<String, String>,
        base_language: String,
        #[serde(default)]
        contact_uuids: Vec<Uuid>,
        #[serde(default)]
        groups: Vec<GroupRef>,
        #[serde(default)]
        urns: Vec<String>,
    },
    SessionTriggered {
        flow: FlowRef,
        #[serde(default)]
        contact_uuids: Vec<Uuid>,
        #[serde(default)]
        groups: Vec<GroupRef>,
        #[serde(default)]
        run_summary: serde_json::Value,
    },
    TicketOpened {
        ticketer: TicketerRef,
        subject: String,
        body: String,
    },
    AirtimeTransferred {
        sender: String,
        recipient: String,
        currency: String,
        desired_amount: f64,
        actual_amount: f64,
        #[serde(default)]
        http_logs: Vec<HttpLogData>,
    },
    EmailSent {
        to: Vec<String>,
        subject: String,
        body: String,
    },
    Error {
        text: String,
    },
    Failure {
        text: String,
    },
}

impl Event {
    /// The registry key for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::MsgCreated { .. } => "msg_created",
            Event::MsgReceived { .. } => "msg_received",
            Event::IvrCreated { .. } => "ivr_created",
            Event::ContactNameChanged { .. } => "contact_name_changed",
            Event::ContactLanguageChanged { .. } => "contact_language_changed",
            Event::ContactStatusChanged { .. } => "contact_status_changed",
            Event::ContactTimezoneChanged { .. } => "contact_timezone_changed",
            Event::ContactFieldChanged { .. } => "contact_field_changed",
            Event::ContactGroupsChanged { .. } => "contact_groups_changed",
            Event::ContactUrnsChanged { .. } => "contact_urns_changed",
            Event::InputLabelsAdded { .. } => "input_labels_added",
            Event::BroadcastCreated { .. } => "broadcast_created",
            Event::SessionTriggered { .. } => "session_triggered",
            Event::TicketOpened { .. } => "ticket_opened",
            Event::AirtimeTransferred { .. } => "airtime_transferred",
            Event::EmailSent { .. } => "email_sent",
            Event::Error { .. } => "error",
            Event::Failure { .. } => "failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_by_kind() {
        let event = Event::ContactNameChanged { name: "Cathy".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "contact_name_changed");
        assert_eq!(json["type"], event.kind());

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), "contact_name_changed");
    }

    #[test]
    fn status_event_uses_snake_case_statuses() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "type": "contact_status_changed",
            "status": "blocked",
        }))
        .unwrap();
        match event {
            Event::ContactStatusChanged { status } => assert_eq!(status, ContactStatus::Blocked),
            other => panic!("unexpected event: {}", other.kind()),
        }
    }
}

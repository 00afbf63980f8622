//! A reference interpreter for linear flow definitions.
//!
//! The production deployment links the full flow interpreter behind the
//! `FlowEngine` trait; this implementation covers the linear subset —
//! nodes run in order, each node is a list of actions plus an optional
//! wait — which is enough to run the binary end to end and to exercise
//! every event the handler registry dispatches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::error::{FlowhubError, Result};
use crate::models::contacts::ContactStatus;
use crate::models::fields::FieldValue;

use super::events::{Event, FieldRef, GroupRef, LabelRef, MsgOut, TicketerRef};
use super::{
    EngineOutput, EngineRun, EngineStatus, EngineWait, FlowEngine, FlowRef, Resume, Trigger,
};

/// Serialized session state between sprints.
#[derive(Debug, Serialize, Deserialize)]
struct ExecState {
    session_uuid: Uuid,
    run_uuid: Uuid,
    contact_uuid: Uuid,
    flow_uuid: Uuid,
    /// index of the node to run next
    node: usize,
}

#[derive(Debug, Deserialize)]
struct NodeDef {
    #[serde(default)]
    actions: Vec<ActionDef>,
    #[serde(default)]
    wait: Option<WaitDef>,
}

#[derive(Debug, Deserialize)]
struct WaitDef {
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ActionDef {
    SendMsg { text: String },
    SayMsg { text: String },
    SetContactName { name: String },
    SetContactLanguage { language: String },
    SetContactStatus { status: ContactStatus },
    SetContactField { field: FieldRef, value: Option<String> },
    AddContactGroups { groups: Vec<GroupRef> },
    RemoveContactGroups { groups: Vec<GroupRef> },
    AddInputLabels { labels: Vec<LabelRef> },
    OpenTicket { ticketer: TicketerRef, subject: String, body: String },
}

pub struct LinearEngine;

impl LinearEngine {
    pub fn new() -> LinearEngine {
        LinearEngine
    }

    fn nodes_for(&self, assets: &OrgAssets, flow_uuid: &Uuid) -> Result<Vec<NodeDef>> {
        let flow = assets
            .flow_by_uuid(flow_uuid)
            .ok_or_else(|| FlowhubError::Engine(format!("no such flow: {flow_uuid}")))?;
        let nodes = flow.definition.get("nodes").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(nodes)
            .map_err(|e| FlowhubError::Engine(format!("invalid flow definition: {e}")))
    }

    /// Runs nodes from `state.node` until a wait or the end, emitting
    /// events as it goes.
    fn run_sprint(
        &self,
        nodes: &[NodeDef],
        mut state: ExecState,
        mut events: Vec<Event>,
        flow: FlowRef,
    ) -> EngineOutput {
        let mut wait = None;

        while state.node < nodes.len() {
            let node = &nodes[state.node];
            for action in &node.actions {
                events.push(event_for_action(action));
            }
            state.node += 1;

            if let Some(node_wait) = &node.wait {
                wait = Some(EngineWait { timeout_seconds: node_wait.timeout_seconds });
                break;
            }
        }

        let status = if wait.is_some() { EngineStatus::Waiting } else { EngineStatus::Completed };

        EngineOutput {
            session_uuid: state.session_uuid,
            status,
            current_flow: if wait.is_some() { Some(flow.clone()) } else { None },
            runs: vec![EngineRun {
                uuid: state.run_uuid,
                flow,
                status,
                results: Value::Object(Default::default()),
                path: Value::Array(vec![]),
                exited: wait.is_none(),
            }],
            wait,
            state: serde_json::to_value(&state).unwrap_or(Value::Null),
            events,
        }
    }
}

impl Default for LinearEngine {
    fn default() -> Self {
        LinearEngine::new()
    }
}

fn event_for_action(action: &ActionDef) -> Event {
    match action {
        ActionDef::SendMsg { text } => Event::MsgCreated {
            msg: MsgOut {
                uuid: Uuid::new_v4(),
                text: text.clone(),
                urn: None,
                channel: None,
                attachments: vec![],
                quick_replies: vec![],
            },
        },
        ActionDef::SayMsg { text } => Event::IvrCreated {
            msg: MsgOut {
                uuid: Uuid::new_v4(),
                text: text.clone(),
                urn: None,
                channel: None,
                attachments: vec![],
                quick_replies: vec![],
            },
        },
        ActionDef::SetContactName { name } => Event::ContactNameChanged { name: name.clone() },
        ActionDef::SetContactLanguage { language } => {
            Event::ContactLanguageChanged { language: language.clone() }
        }
        ActionDef::SetContactStatus { status } => Event::ContactStatusChanged { status: *status },
        ActionDef::SetContactField { field, value } => Event::ContactFieldChanged {
            field: field.clone(),
            value: value.as_ref().map(|v| FieldValue::text(v)),
        },
        ActionDef::AddContactGroups { groups } => Event::ContactGroupsChanged {
            groups_added: groups.clone(),
            groups_removed: vec![],
        },
        ActionDef::RemoveContactGroups { groups } => Event::ContactGroupsChanged {
            groups_added: vec![],
            groups_removed: groups.clone(),
        },
        ActionDef::AddInputLabels { labels } => Event::InputLabelsAdded {
            input_uuid: Uuid::new_v4(),
            labels: labels.clone(),
        },
        ActionDef::OpenTicket { ticketer, subject, body } => Event::TicketOpened {
            ticketer: ticketer.clone(),
            subject: subject.clone(),
            body: body.clone(),
        },
    }
}

impl FlowEngine for LinearEngine {
    fn new_session(&self, assets: &OrgAssets, trigger: &Trigger) -> Result<EngineOutput> {
        let nodes = self.nodes_for(assets, &trigger.flow.uuid)?;
        let state = ExecState {
            session_uuid: Uuid::new_v4(),
            run_uuid: Uuid::new_v4(),
            contact_uuid: trigger.contact_uuid,
            flow_uuid: trigger.flow.uuid,
            node: 0,
        };
        Ok(self.run_sprint(&nodes, state, Vec::new(), trigger.flow.clone()))
    }

    fn resume_session(
        &self,
        assets: &OrgAssets,
        state: &Value,
        resume: &Resume,
    ) -> Result<EngineOutput> {
        let state: ExecState = serde_json::from_value(state.clone())
            .map_err(|e| FlowhubError::Engine(format!("invalid session state: {e}")))?;
        let nodes = self.nodes_for(assets, &state.flow_uuid)?;
        let flow = assets
            .flow_by_uuid(&state.flow_uuid)
            .map(|f| FlowRef { uuid: f.uuid, name: f.name.clone() })
            .ok_or_else(|| FlowhubError::Engine(format!("no such flow: {}", state.flow_uuid)))?;

        // an incoming message becomes part of this sprint's history
        let mut events = Vec::new();
        if let Resume::Msg { msg_uuid, text, urn } = resume {
            events.push(Event::MsgReceived {
                msg_uuid: *msg_uuid,
                text: text.clone(),
                urn: urn.clone(),
            });
        }

        Ok(self.run_sprint(&nodes, state, events, flow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::orgs::{Org, OrgConfig};
    use crate::models::Flow;

    fn assets_with_flow(definition: Value) -> (OrgAssets, Uuid) {
        let flow_uuid = Uuid::new_v4();
        let mut assets = OrgAssets::for_tests(Org {
            id: 1,
            name: "Org".to_string(),
            is_active: true,
            config: OrgConfig::default(),
        });
        assets.add_flow_for_tests(Flow {
            id: 1,
            uuid: flow_uuid,
            org_id: 1,
            name: "Favorites".to_string(),
            flow_type: "M".to_string(),
            spec_version: "13.1.0".to_string(),
            definition,
            config: serde_json::json!({}),
            ignore_triggers: false,
        });
        (assets, flow_uuid)
    }

    fn trigger_for(flow_uuid: Uuid) -> Trigger {
        Trigger {
            flow: FlowRef { uuid: flow_uuid, name: "Favorites".to_string() },
            contact_uuid: Uuid::new_v4(),
            origin: super::super::TriggerOrigin::Manual,
            params: Value::Null,
        }
    }

    #[test]
    fn runs_to_completion_without_waits() {
        let (assets, flow_uuid) = assets_with_flow(serde_json::json!({
            "nodes": [
                {"actions": [
                    {"type": "send_msg", "text": "What's your favorite color?"},
                    {"type": "set_contact_name", "name": "Cathy"},
                ]},
            ],
        }));

        let output = LinearEngine::new().new_session(&assets, &trigger_for(flow_uuid)).unwrap();
        assert_eq!(output.status, EngineStatus::Completed);
        assert_eq!(output.events.len(), 2);
        assert_eq!(output.events[0].kind(), "msg_created");
        assert_eq!(output.events[1].kind(), "contact_name_changed");
        assert!(output.wait.is_none());
        assert!(output.runs[0].exited);
    }

    #[test]
    fn pauses_on_wait_and_resumes_past_it() {
        let (assets, flow_uuid) = assets_with_flow(serde_json::json!({
            "nodes": [
                {"actions": [{"type": "send_msg", "text": "Pick a number"}],
                 "wait": {"timeout_seconds": 300}},
                {"actions": [{"type": "send_msg", "text": "Thanks!"}]},
            ],
        }));
        let engine = LinearEngine::new();

        let output = engine.new_session(&assets, &trigger_for(flow_uuid)).unwrap();
        assert_eq!(output.status, EngineStatus::Waiting);
        assert_eq!(output.wait.as_ref().unwrap().timeout_seconds, Some(300));
        assert!(output.current_flow.is_some());

        let resumed = engine
            .resume_session(
                &assets,
                &output.state,
                &Resume::Msg { msg_uuid: Uuid::new_v4(), text: "7".to_string(), urn: None },
            )
            .unwrap();
        assert_eq!(resumed.status, EngineStatus::Completed);
        // the incoming message leads the sprint's events
        assert_eq!(resumed.events[0].kind(), "msg_received");
        assert_eq!(resumed.events[1].kind(), "msg_created");
        // same session continues
        assert_eq!(resumed.session_uuid, output.session_uuid);
    }
}

//! The handle-contact-event task: the gateway (or a cron) queues one of
//! these per contact event, and it resumes or starts the contact's
//! session accordingly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Resume;
use crate::error::Result;
use crate::models::sessions::Session;
use crate::models::{Contact, ContactId, FlowType, MsgId, OrgId, SessionId};
use crate::runner;
use crate::runtime::Runtime;
use crate::tasks::Task;

pub const HANDLE_CONTACT_EVENT: &str = "handle_contact_event";

/// The channel-side event being handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContactEvent {
    /// an incoming message already written by the gateway
    MsgReceived {
        contact_id: ContactId,
        msg_id: MsgId,
        msg_uuid: Uuid,
        urn: Option<String>,
        text: String,
    },
    /// a waiting session's wait timed out
    WaitTimeout {
        contact_id: ContactId,
        session_id: SessionId,
    },
    /// a waiting session passed its expiry
    Expiration {
        contact_id: ContactId,
        session_id: SessionId,
    },
}

pub fn decode(payload: serde_json::Value) -> Result<Box<dyn Task>> {
    let event: ContactEvent = serde_json::from_value(payload)?;
    Ok(Box::new(HandleContactEventTask { event }))
}

pub struct HandleContactEventTask {
    pub event: ContactEvent,
}

#[async_trait]
impl Task for HandleContactEventTask {
    fn kind(&self) -> &'static str {
        HANDLE_CONTACT_EVENT
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn perform(&self, rt: Arc<Runtime>, org_id: OrgId) -> Result<()> {
        let assets = rt.cache.get(&rt.db, org_id).await?;

        match &self.event {
            ContactEvent::MsgReceived { contact_id, msg_id, msg_uuid, urn, text } => {
                let Some(mut session) = Session::load_waiting_for_contact(
                    &rt.db,
                    org_id,
                    *contact_id,
                    FlowType::Messaging,
                )
                .await?
                else {
                    // nothing waiting on this contact; the message stays
                    // recorded and trigger matching happens upstream
                    info!(contact_id, "incoming message with no waiting session");
                    return Ok(());
                };
                session.incoming_msg_id = Some(*msg_id);

                let contact = load_contact(&rt, org_id, *contact_id).await?;
                let resume = Resume::Msg {
                    msg_uuid: *msg_uuid,
                    text: text.clone(),
                    urn: urn.clone(),
                };
                runner::resume_flow(&rt, &assets, &mut session, contact, resume).await?;
            }
            ContactEvent::WaitTimeout { contact_id, session_id } => {
                let Some(mut session) = Session::load(&rt.db, org_id, *session_id).await? else {
                    warn!(session_id, "timeout for missing session");
                    return Ok(());
                };
                if session.status != crate::models::SessionStatus::Waiting {
                    return Ok(());
                }
                let contact = load_contact(&rt, org_id, *contact_id).await?;
                runner::resume_flow(&rt, &assets, &mut session, contact, Resume::WaitTimeout)
                    .await?;
            }
            ContactEvent::Expiration { contact_id, session_id } => {
                let Some(mut session) = Session::load(&rt.db, org_id, *session_id).await? else {
                    return Ok(());
                };
                if session.status != crate::models::SessionStatus::Waiting {
                    return Ok(());
                }
                let contact = load_contact(&rt, org_id, *contact_id).await?;
                runner::resume_flow(&rt, &assets, &mut session, contact, Resume::Expiration)
                    .await?;
            }
        }

        Ok(())
    }
}

async fn load_contact(rt: &Runtime, org_id: OrgId, contact_id: ContactId) -> Result<Contact> {
    let mut conn = rt.db.acquire().await?;
    let mut contacts = Contact::load(&mut *conn, org_id, &[contact_id]).await?;
    contacts.pop().ok_or_else(|| {
        crate::error::FlowhubError::AssetMissing(format!("no such contact: {contact_id}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_events_round_trip() {
        let event = ContactEvent::MsgReceived {
            contact_id: 10,
            msg_id: 99,
            msg_uuid: Uuid::new_v4(),
            urn: Some("tel:+12065551212".to_string()),
            text: "hello".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "msg_received");

        let parsed: ContactEvent = serde_json::from_value(json).unwrap();
        match parsed {
            ContactEvent::MsgReceived { text, .. } => assert_eq!(text, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

//! Surveyor submissions: a client ran the whole session offline and
//! posts the result — the session, its events and any contact modifier
//! events — in one request.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Event;
use crate::engine::UuidGenerator;
use crate::handlers::{self, Scene};
use crate::hooks;
use crate::models::sessions::{FlowRun, Session, SessionStatus};
use crate::models::urns::Urn;
use crate::models::{sessions, Contact, FlowType, OrgId};

use super::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub org_id: OrgId,
    pub contact: SubmitContact,
    pub session: SubmitSession,
    #[serde(default)]
    pub events: Vec<Event>,
    /// modifier events produced outside the session (contact edits)
    #[serde(default)]
    pub modifiers: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitContact {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub urns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitSession {
    pub uuid: Uuid,
    pub flow_uuid: Uuid,
    pub status: String,
    #[serde(default)]
    pub results: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub session_id: i64,
    pub contact_id: i64,
    pub contact_created: bool,
}

/// `POST /fh/surveyor/submit`
pub async fn handle_submit(
    State(rt): State<AppState>,
    Json(submit): Json<SubmitRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    let assets = rt.cache.get(&rt.db, submit.org_id).await?;

    let flow = assets
        .flow_by_uuid(&submit.session.flow_uuid)
        .ok_or_else(|| ApiError::not_found(format!("no such flow: {}", submit.session.flow_uuid)))?;

    // the contact resolves by its highest priority URN, creating a brand
    // new contact when nothing matches
    let parsed: crate::error::Result<Vec<Urn>> =
        submit.contact.urns.iter().map(|u| Urn::parse(u)).collect();
    let parsed = parsed?;

    let mut conn = rt.db.acquire().await?;
    let (contact_id, created) = match parsed.first() {
        Some(urn) => {
            Contact::resolve_by_urn(&mut *conn, submit.org_id, urn, rt.uuids.next()).await?
        }
        None => {
            let contact = Contact::create(
                &mut *conn,
                submit.org_id,
                submit.contact.uuid.unwrap_or_else(|| rt.uuids.next()),
                submit.contact.name.as_deref(),
                submit.contact.language.as_deref(),
                &[],
            )
            .await?;
            (contact.id, true)
        }
    };
    let mut contacts = Contact::load(&mut *conn, submit.org_id, &[contact_id]).await?;
    drop(conn);
    let contact = contacts
        .pop()
        .ok_or_else(|| ApiError::not_found(format!("no such contact: {contact_id}")))?;

    // surveyor sessions arrive finished; they are written as history
    let status = match submit.session.status.as_str() {
        "completed" | "C" => SessionStatus::Completed,
        "failed" | "F" => SessionStatus::Failed,
        other => return Err(ApiError::bad_request(format!("invalid session status: {other}"))),
    };

    let mut session = Session {
        id: 0,
        uuid: submit.session.uuid,
        org_id: submit.org_id,
        contact_id: contact.id,
        status,
        session_type: FlowType::Surveyor,
        current_flow_id: None,
        responded: true,
        state_key: None,
        sprint: 1,
        created_on: Utc::now(),
        ended_on: Some(Utc::now()),
        timeout_on: None,
        connection_id: None,
        incoming_msg_id: None,
    };

    let mut tx = rt.db.begin().await.map_err(crate::error::FlowhubError::from)?;
    let mut batch = vec![session.clone()];
    Session::insert_batch(&mut *tx, &mut batch).await?;
    session = batch.pop().expect("inserted session");

    sessions::insert_runs(
        &mut *tx,
        &[FlowRun {
            uuid: rt.uuids.next(),
            org_id: submit.org_id,
            flow_id: flow.id,
            contact_id: contact.id,
            session_id: session.id,
            status,
            responded: true,
            results: submit.session.results.clone(),
            path: serde_json::json!([]),
            start_id: None,
            created_on: Utc::now(),
            exited_on: Some(Utc::now()),
        }],
    )
    .await?;

    // session events and modifier events run through the same handler +
    // hook pipeline as a live sprint
    let mut scene = Scene::for_session(contact, &session);
    let mut all_events = submit.events.clone();
    all_events.extend(submit.modifiers.iter().cloned());
    for event in &all_events {
        handlers::apply_pre_write_event(&rt, &mut *tx, &assets, &mut scene, event).await?;
    }
    handlers::handle_events(&rt, &mut *tx, &assets, &mut scene, &all_events).await?;

    let mut scenes = vec![scene];
    hooks::apply_pre_commit_in_tx(&rt, &assets, &mut scenes, Some(&mut *tx)).await?;
    tx.commit().await.map_err(crate::error::FlowhubError::from)?;

    hooks::apply_post_commit(&rt, &assets, &mut scenes).await?;

    Ok(Json(SubmitResponse {
        session_id: session.id,
        contact_id: session.contact_id,
        contact_created: created,
    }))
}

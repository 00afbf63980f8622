//! The session runner: starts and resumes sessions, persists what the
//! interpreter produced and drives the handler + commit-hook pipeline.
//!
//! A batch of contacts runs together so handler dispatch and commit hooks
//! touch the database once per hook for the whole batch. Sprints for the
//! same contact never interleave: a per-contact advisory lock is held for
//! the duration of the runner call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{info, warn};

use crate::assets::OrgAssets;
use crate::engine::FlowEngine;
use crate::engine::{EngineOutput, EngineStatus, Resume, Trigger, TriggerOrigin};
use crate::error::{FlowhubError, Result, WrapErr};
use crate::handlers::{self, Scene};
use crate::hooks::{self, HookId, HookItem};
use crate::locker;
use crate::models::sessions::{self, FlowRun, Session, SessionStatus};
use crate::models::starts::FlowStartBatch;
use crate::models::{Contact, ContactId, Flow, StartId};
use crate::runtime::Runtime;
use crate::storage::{session_state_key, ObjectStorage};

/// How long a sprint waits on another sprint's contact lock before
/// skipping the contact.
const CONTACT_LOCK_WAIT: Duration = Duration::from_secs(5);
/// TTL guarding against a crashed sprint wedging its contact.
const CONTACT_LOCK_TTL: Duration = Duration::from_secs(60);

/// How a start batch wants pre-existing state treated.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// interrupt the contacts' waiting sessions (flow type permitting)
    pub interrupt: bool,
    pub start_id: Option<StartId>,
    /// voice connection the new session is attached to
    pub connection_id: Option<crate::models::ConnectionId>,
}

/// Runs one start-flow batch through the interpreter, returning the
/// number of sessions created.
pub async fn start_flow_batch(rt: &Arc<Runtime>, batch: &FlowStartBatch) -> Result<usize> {
    let assets = rt.cache.get(&rt.db, batch.org_id).await?;

    // the flow may have been archived since the start was created; for a
    // background task that means there is simply nothing to do
    let Ok(flow) = assets.flow(batch.flow_id) else {
        warn!(org_id = batch.org_id, flow_id = batch.flow_id, "start references missing flow");
        return Ok(0);
    };

    let mut contact_ids = batch.contact_ids.clone();

    // exclusion flags arrive inverted on the batch
    if !batch.restart_participants {
        let started =
            sessions::contact_ids_started_in_flow(&rt.db, batch.org_id, flow.id, &contact_ids)
                .await?;
        contact_ids.retain(|id| !started.contains(id));
    }
    if !batch.include_active && flow.typ().interrupts() {
        let active = sessions::contact_ids_in_a_flow(&rt.db, batch.org_id, &contact_ids).await?;
        contact_ids.retain(|id| !active.contains(id));
    }

    let started = if flow.typ() == crate::models::FlowType::Voice {
        crate::tasks::ivr::request_starts(rt, &assets, &flow, &contact_ids, batch.start_id).await?
    } else {
        let sessions = start_flow_for_contacts(
            rt,
            &assets,
            &flow,
            &contact_ids,
            TriggerOrigin::Manual,
            batch.params.clone(),
            StartOptions {
                interrupt: batch.include_active,
                start_id: batch.start_id,
                connection_id: None,
            },
        )
        .await?;
        sessions.len()
    };

    Ok(started)
}

/// Starts the flow for the passed in contacts: interrupts what the flow
/// type interrupts, drives the interpreter and writes everything.
pub async fn start_flow_for_contacts(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    flow: &Flow,
    contact_ids: &[ContactId],
    origin: TriggerOrigin,
    params: serde_json::Value,
    options: StartOptions,
) -> Result<Vec<Session>> {
    if contact_ids.is_empty() {
        return Ok(Vec::new());
    }

    // serialize against concurrent sprints contact by contact; contacts
    // we can't lock are skipped and picked up by a later retry
    let mut locked = Vec::new();
    let mut tokens = Vec::new();
    for &contact_id in contact_ids {
        let name = locker::contact_lock_name(assets.org_id(), contact_id);
        match locker::acquire(&rt.db, &name, CONTACT_LOCK_TTL, CONTACT_LOCK_WAIT).await {
            Ok(token) => {
                locked.push(contact_id);
                tokens.push((name, token));
            }
            Err(FlowhubError::LockNotAcquired(_)) => {
                warn!(contact_id, "skipping contact with contended sprint lock");
            }
            Err(err) => return Err(err),
        }
    }

    let result = start_locked_contacts(rt, assets, flow, &locked, origin, params, options).await;

    for (name, token) in tokens {
        let _ = locker::release(&rt.db, &name, &token).await;
    }

    result
}

async fn start_locked_contacts(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    flow: &Flow,
    contact_ids: &[ContactId],
    origin: TriggerOrigin,
    params: serde_json::Value,
    options: StartOptions,
) -> Result<Vec<Session>> {
    let mut conn = rt.db.acquire().await?;
    let contacts = Contact::load(&mut *conn, assets.org_id(), contact_ids).await?;
    drop(conn);

    if options.interrupt && flow.typ().interrupts() {
        let mut conn = rt.db.acquire().await?;
        sessions::interrupt_waiting_sessions(&mut *conn, assets.org_id(), contact_ids)
            .await
            .wrap_err("error interrupting sessions")?;
    }

    // one sprint per contact; a contact the engine fails on fails the
    // whole batch so nothing half-commits
    let mut outputs = Vec::with_capacity(contacts.len());
    for contact in contacts {
        let trigger = Trigger {
            flow: crate::engine::FlowRef { uuid: flow.uuid, name: flow.name.clone() },
            contact_uuid: contact.uuid,
            origin: origin.clone(),
            params: params.clone(),
        };
        let output = rt
            .engine
            .new_session(assets, &trigger)
            .wrap_err(format!("error starting flow: {}", flow.uuid))?;
        outputs.push((contact, output));
    }

    write_sessions(rt, assets, flow, outputs, options).await
}

/// Starts a voice flow for one contact attached to its call connection,
/// returning the session plus the sprint output so the IVR surface can
/// render the provider response.
pub async fn start_voice_session(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    flow: &Flow,
    contact: Contact,
    connection_id: crate::models::ConnectionId,
) -> Result<(Session, EngineOutput)> {
    let name = locker::contact_lock_name(assets.org_id(), contact.id);
    let token = locker::acquire(&rt.db, &name, CONTACT_LOCK_TTL, CONTACT_LOCK_WAIT).await?;

    let result = async {
        let trigger = Trigger {
            flow: crate::engine::FlowRef { uuid: flow.uuid, name: flow.name.clone() },
            contact_uuid: contact.uuid,
            origin: TriggerOrigin::Channel {
                event_type: "incoming_call".to_string(),
                extra: serde_json::Value::Null,
            },
            params: serde_json::Value::Null,
        };
        let output = rt
            .engine
            .new_session(assets, &trigger)
            .wrap_err(format!("error starting flow: {}", flow.uuid))?;

        let options = StartOptions {
            interrupt: true,
            start_id: None,
            connection_id: Some(connection_id),
        };
        let mut sessions =
            write_sessions(rt, assets, flow, vec![(contact, output.clone())], options).await?;
        let session = sessions.pop().ok_or_else(|| {
            FlowhubError::Engine("voice start produced no session".to_string())
        })?;
        Ok((session, output))
    }
    .await;

    let _ = locker::release(&rt.db, &name, &token).await;
    result
}

/// Resumes a waiting session with the passed in resume, returning the
/// sprint output (the IVR surface renders it as the provider response).
pub async fn resume_flow(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    session: &mut Session,
    contact: Contact,
    resume: Resume,
) -> Result<EngineOutput> {
    let lock_name = locker::contact_lock_name(assets.org_id(), contact.id);
    let token = locker::acquire(&rt.db, &lock_name, CONTACT_LOCK_TTL, CONTACT_LOCK_WAIT).await?;

    let result = resume_locked(rt, assets, session, contact, resume).await;

    let _ = locker::release(&rt.db, &lock_name, &token).await;
    result
}

async fn resume_locked(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    session: &mut Session,
    contact: Contact,
    resume: Resume,
) -> Result<EngineOutput> {
    let state_key = session
        .state_key
        .clone()
        .ok_or_else(|| FlowhubError::Validation("session has no stored state".to_string()))?;
    let state_blob = rt.storage.get(&state_key).await.wrap_err("error reading session state")?;
    let state: serde_json::Value = serde_json::from_slice(&state_blob)?;

    let output = rt
        .engine
        .resume_session(assets, &state, &resume)
        .wrap_err("error resuming session")?;

    // a resume means the contact responded
    session.responded = session.responded || matches!(resume, Resume::Msg { .. });

    apply_output_to_session(rt, assets, session, &output).await?;

    let flow = output
        .current_flow
        .as_ref()
        .and_then(|f| assets.flow_by_uuid(&f.uuid));

    let mut scenes = vec![scene_for_output(&contact, session, &output)];
    let mut tx = rt.db.begin().await?;

    // pre-write handlers see the session before its row is updated
    for event in &output.events {
        handlers::apply_pre_write_event(rt, &mut *tx, assets, &mut scenes[0], event).await?;
    }

    session.update(&mut *tx).await.wrap_err("error updating session")?;
    upsert_runs_for_output(&mut *tx, assets, session, &output, None).await?;

    for scene in &mut scenes {
        handlers::handle_events(rt, &mut *tx, assets, scene, &output.events)
            .await
            .wrap_err("error applying events")?;
        stage_sprint_end(scene, flow.as_deref());
    }

    hooks::apply_pre_commit_in_tx(rt, assets, &mut scenes, Some(&mut *tx)).await?;
    tx.commit().await.wrap_err("error committing pre commit hooks")?;

    hooks::apply_post_commit(rt, assets, &mut scenes).await?;

    info!(
        session_id = session.id,
        contact_id = session.contact_id,
        status = session.status.code(),
        "session resumed"
    );
    Ok(output)
}

/// Persists a batch of new sessions plus their sprints and runs the full
/// handler + hook pipeline across them.
async fn write_sessions(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    flow: &Flow,
    outputs: Vec<(Contact, EngineOutput)>,
    options: StartOptions,
) -> Result<Vec<Session>> {
    if outputs.is_empty() {
        return Ok(Vec::new());
    }

    // state blobs go to object storage first; rows keep only the keys
    let mut new_sessions = Vec::with_capacity(outputs.len());
    for (contact, output) in &outputs {
        let mut session = session_for_output(assets, contact, output, flow, options.connection_id);
        let key = session_state_key(&session.uuid, 0);
        rt.storage
            .put(&key, Bytes::from(serde_json::to_vec(&output.state)?))
            .await
            .wrap_err("error writing session state")?;
        session.state_key = Some(key);
        new_sessions.push(session);
    }

    let mut tx = rt.db.begin().await?;

    // pre-write handlers run against scenes before rows exist
    let mut pre_scenes: Vec<Scene> = outputs
        .iter()
        .map(|(contact, _)| Scene::for_contact(contact.clone()))
        .collect();
    for (scene, (_, output)) in pre_scenes.iter_mut().zip(&outputs) {
        for event in &output.events {
            handlers::apply_pre_write_event(rt, &mut *tx, assets, scene, event).await?;
        }
    }

    Session::insert_batch(&mut *tx, &mut new_sessions)
        .await
        .wrap_err("error writing sessions")?;

    let mut runs = Vec::new();
    for (session, (_, output)) in new_sessions.iter().zip(&outputs) {
        for run in &output.runs {
            let Some(run_flow) = assets.flow_by_uuid(&run.flow.uuid) else {
                warn!(flow_uuid = %run.flow.uuid, "run references missing flow");
                continue;
            };
            runs.push(FlowRun {
                uuid: run.uuid,
                org_id: assets.org_id(),
                flow_id: run_flow.id,
                contact_id: session.contact_id,
                session_id: session.id,
                status: engine_status_to_session(run.status),
                responded: session.responded,
                results: run.results.clone(),
                path: run.path.clone(),
                start_id: options.start_id,
                created_on: Utc::now(),
                exited_on: if run.exited { Some(Utc::now()) } else { None },
            });
        }
    }
    sessions::insert_runs(&mut *tx, &runs).await.wrap_err("error writing runs")?;

    // carry over the pre-write staging into the real scenes
    let mut scenes = Vec::with_capacity(outputs.len());
    for ((pre_scene, session), (contact, output)) in
        pre_scenes.into_iter().zip(&new_sessions).zip(&outputs)
    {
        let mut scene = Scene::for_session(contact.clone(), session);
        for (hook, items) in pre_scene.pre_commits().iter() {
            for item in items {
                scene.stage_pre(*hook, item.clone());
            }
        }
        handlers::handle_events(rt, &mut *tx, assets, &mut scene, &output.events)
            .await
            .wrap_err("error applying events")?;
        stage_sprint_end(&mut scene, Some(flow));
        scenes.push(scene);
    }

    hooks::apply_pre_commit_in_tx(rt, assets, &mut scenes, Some(&mut *tx)).await?;
    tx.commit().await.wrap_err("error committing pre commit hooks")?;

    hooks::apply_post_commit(rt, assets, &mut scenes).await?;

    info!(
        org_id = assets.org_id(),
        flow = %flow.name,
        count = new_sessions.len(),
        "flow started"
    );
    Ok(new_sessions)
}

/// The pseudo-event every sprint ends with: the contact was touched.
fn stage_sprint_end(scene: &mut Scene, _flow: Option<&Flow>) {
    scene.stage_pre(HookId::ContactModified, HookItem::Modified);
}

fn scene_for_output(contact: &Contact, session: &Session, _output: &EngineOutput) -> Scene {
    Scene::for_session(contact.clone(), session)
}

fn engine_status_to_session(status: EngineStatus) -> SessionStatus {
    match status {
        EngineStatus::Waiting => SessionStatus::Waiting,
        EngineStatus::Completed => SessionStatus::Completed,
        EngineStatus::Failed => SessionStatus::Failed,
    }
}

fn session_for_output(
    assets: &OrgAssets,
    contact: &Contact,
    output: &EngineOutput,
    flow: &Flow,
    connection_id: Option<crate::models::ConnectionId>,
) -> Session {
    let status = engine_status_to_session(output.status);
    let current_flow_id = output
        .current_flow
        .as_ref()
        .and_then(|f| assets.flow_by_uuid(&f.uuid))
        .map(|f| f.id);

    Session {
        id: 0,
        uuid: output.session_uuid,
        org_id: assets.org_id(),
        contact_id: contact.id,
        status,
        session_type: flow.typ(),
        current_flow_id: if status.is_ended() { None } else { current_flow_id },
        responded: false,
        state_key: None,
        sprint: 1,
        created_on: Utc::now(),
        ended_on: if status.is_ended() { Some(Utc::now()) } else { None },
        timeout_on: output
            .wait
            .as_ref()
            .and_then(|w| w.timeout_seconds)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64)),
        connection_id,
        incoming_msg_id: None,
    }
}

/// Applies a resume's output back onto an existing session row (in
/// memory; the caller writes it).
async fn apply_output_to_session(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    session: &mut Session,
    output: &EngineOutput,
) -> Result<()> {
    let status = engine_status_to_session(output.status);
    session.status = status;
    session.current_flow_id = if status.is_ended() {
        None
    } else {
        output
            .current_flow
            .as_ref()
            .and_then(|f| assets.flow_by_uuid(&f.uuid))
            .map(|f| f.id)
    };
    session.ended_on = if status.is_ended() { Some(Utc::now()) } else { None };
    session.timeout_on = output
        .wait
        .as_ref()
        .and_then(|w| w.timeout_seconds)
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

    // each sprint writes a fresh state blob under the next index
    let key = session_state_key(&session.uuid, session.sprint);
    rt.storage
        .put(&key, Bytes::from(serde_json::to_vec(&output.state)?))
        .await
        .wrap_err("error writing session state")?;
    session.state_key = Some(key);
    session.sprint += 1;

    Ok(())
}

/// Upserts the runs a resume touched, keyed by run uuid.
async fn upsert_runs_for_output(
    tx: &mut sqlx::PgConnection,
    assets: &OrgAssets,
    session: &Session,
    output: &EngineOutput,
    start_id: Option<StartId>,
) -> Result<()> {
    for run in &output.runs {
        let Some(run_flow) = assets.flow_by_uuid(&run.flow.uuid) else { continue };
        let status = engine_status_to_session(run.status);
        sqlx::query(
            r#"
            INSERT INTO flow_runs(uuid, org_id, flow_id, contact_id, session_id, status, responded,
                                  results, path, start_id, created_on, modified_on, exited_on)
            VALUES($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW(), $11)
            ON CONFLICT (uuid) DO UPDATE
               SET status = EXCLUDED.status, responded = EXCLUDED.responded,
                   results = EXCLUDED.results, path = EXCLUDED.path,
                   modified_on = NOW(), exited_on = EXCLUDED.exited_on
            "#,
        )
        .bind(run.uuid)
        .bind(assets.org_id())
        .bind(run_flow.id)
        .bind(session.contact_id)
        .bind(session.id)
        .bind(status.code())
        .bind(session.responded)
        .bind(&run.results)
        .bind(&run.path)
        .bind(start_id)
        .bind(if run.exited { Some(Utc::now()) } else { None })
        .execute(&mut *tx)
        .await?;
    }
    Ok(())
}

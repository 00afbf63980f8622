//! IVR callbacks: incoming calls, session handling, status updates and
//! call events. Every exchange is recorded as a channel log row.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::engine::UuidGenerator;
use crate::models::channels::{self, Channel, ChannelConnection, ChannelEvent, ChannelEventType, ChannelLog};
use crate::models::sessions::Session;
use crate::models::urns::Urn;
use crate::models::{Contact, ConnectionStatus};
use crate::runner;
use crate::services::ivr::{CallbackRequest, IvrProvider};

use super::{ApiError, ApiResult, AppState};

/// The flow an inbound call starts is configured on the channel.
const CONFIG_INCOMING_FLOW: &str = "incoming_flow_uuid";

#[derive(Debug, Deserialize)]
pub struct HandleParams {
    pub action: String,
    pub connection: i64,
}

async fn channel_for_uuid(rt: &AppState, channel_uuid: Uuid) -> ApiResult<Channel> {
    let channel = Channel::load_by_uuid(&rt.db, channel_uuid)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no such channel: {channel_uuid}")))?;
    if !channel.is_active {
        return Err(ApiError::not_found(format!("channel is not active: {channel_uuid}")));
    }
    Ok(channel)
}

async fn write_channel_log(
    rt: &AppState,
    channel: &Channel,
    connection_id: Option<i64>,
    description: &str,
    is_error: bool,
    request: &serde_json::Value,
    response: &serde_json::Value,
    started: Instant,
) {
    let log = ChannelLog {
        channel_id: channel.id,
        connection_id,
        description: description.to_string(),
        is_error,
        url: format!("/fh/ivr/c/{}", channel.uuid),
        request: request.to_string(),
        response: response.to_string(),
        response_status: if is_error { 400 } else { 200 },
        elapsed_ms: started.elapsed().as_millis() as i32,
    };
    if let Err(err) = channels::insert_channel_logs(&rt.db, &[log]).await {
        warn!(error = %err, "error writing channel log");
    }
}

/// `POST /fh/ivr/c/{channel_uuid}/incoming` — a provider-native inbound
/// call: create the channel event and start a voice session when the
/// channel has an incoming flow configured.
pub async fn handle_incoming(
    State(rt): State<AppState>,
    Path(channel_uuid): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let channel = channel_for_uuid(&rt, channel_uuid).await?;
    let assets = rt.cache.get(&rt.db, channel.org_id).await?;
    let provider = rt.ivr_providers.create(&rt, &channel)?;

    let request = CallbackRequest { query: HashMap::new(), body: body.clone() };
    provider.validate_signature(&request)?;

    let urn = Urn::parse(&provider.urn_for_request(&request)?)?;
    let mut conn = rt.db.acquire().await?;
    let (contact_id, _created) =
        Contact::resolve_by_urn(&mut *conn, channel.org_id, &urn, rt.uuids.next()).await?;
    let mut contacts = Contact::load(&mut *conn, channel.org_id, &[contact_id]).await?;
    drop(conn);
    let contact = contacts
        .pop()
        .ok_or_else(|| ApiError::not_found(format!("no such contact: {contact_id}")))?;

    ChannelEvent::create(
        &rt.db,
        channel.org_id,
        channel.id,
        contact_id,
        ChannelEventType::MoCall,
        body.clone(),
    )
    .await?;

    // without an incoming flow the event is recorded and the call
    // acknowledged
    let flow = channel
        .config
        .get(CONFIG_INCOMING_FLOW)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .and_then(|uuid| assets.flow_by_uuid(&uuid));
    let Some(flow) = flow else {
        let response = provider.empty_response("no incoming flow configured");
        write_channel_log(&rt, &channel, None, "incoming call", false, &body, &response, started)
            .await;
        return Ok(Json(response));
    };

    let external_id = provider.call_id_for_request(&request)?;
    let mut connection = ChannelConnection::create_incoming(
        &rt.db,
        channel.org_id,
        channel.id,
        contact_id,
        &urn.identity(),
    )
    .await?;
    connection.mark_wired(&rt.db, &external_id).await?;

    let (_session, output) =
        runner::start_voice_session(&rt, &assets, &flow, contact, connection.id).await?;

    let resume_url = format!(
        "/fh/ivr/c/{}/handle?action=resume&connection={}",
        channel.uuid, connection.id
    );
    let response = provider.write_session_response(&output, &resume_url)?;
    write_channel_log(&rt, &channel, Some(connection.id), "incoming call", false, &body, &response, started)
        .await;
    Ok(Json(response))
}

/// `POST /fh/ivr/c/{channel_uuid}/handle?action=start|resume|status` —
/// drive an existing voice session.
pub async fn handle_callback(
    State(rt): State<AppState>,
    Path(channel_uuid): Path<Uuid>,
    Query(params): Query<HandleParams>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let channel = channel_for_uuid(&rt, channel_uuid).await?;
    let assets = rt.cache.get(&rt.db, channel.org_id).await?;
    let provider = rt.ivr_providers.create(&rt, &channel)?;

    let request = CallbackRequest { query: HashMap::new(), body: body.clone() };
    provider.validate_signature(&request)?;

    let connection = ChannelConnection::load(&rt.db, channel.org_id, params.connection)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no such connection: {}", params.connection)))?;

    let mut conn = rt.db.acquire().await?;
    let mut contacts = Contact::load(&mut *conn, channel.org_id, &[connection.contact_id]).await?;
    drop(conn);
    let contact = contacts
        .pop()
        .ok_or_else(|| ApiError::not_found(format!("no such contact: {}", connection.contact_id)))?;

    let response = match params.action.as_str() {
        "start" => {
            let flow = connection_flow(&rt, &assets, &connection).await?;
            let mut connection = connection;
            connection.update_status(&rt.db, ConnectionStatus::InProgress).await?;
            let (_session, output) =
                runner::start_voice_session(&rt, &assets, &flow, contact, connection.id).await?;
            let resume_url = resume_url(&channel, connection.id);
            provider.write_session_response(&output, &resume_url)?
        }
        "resume" => {
            let Some(mut session) = Session::load_waiting_for_contact(
                &rt.db,
                channel.org_id,
                contact.id,
                crate::models::FlowType::Voice,
            )
            .await?
            else {
                return Err(ApiError::not_found("no waiting voice session".to_string()));
            };
            let resume = provider.resume_for_request(&request)?;
            let output = runner::resume_flow(&rt, &assets, &mut session, contact, resume).await?;
            let resume_url = resume_url(&channel, connection.id);
            provider.write_session_response(&output, &resume_url)?
        }
        "status" => {
            let (status, _duration) = provider.status_for_request(&request);
            let mut connection = connection;
            connection.update_status(&rt.db, status).await?;
            provider.empty_response("status updated")
        }
        other => return Err(ApiError::bad_request(format!("unknown action: {other}"))),
    };

    write_channel_log(
        &rt,
        &channel,
        Some(params.connection),
        &format!("call {}", params.action),
        false,
        &body,
        &response,
        started,
    )
    .await;
    Ok(Json(response))
}

fn resume_url(channel: &Channel, connection_id: i64) -> String {
    format!("/fh/ivr/c/{}/handle?action=resume&connection={}", channel.uuid, connection_id)
}

/// The flow a connection should run is the one its start requested.
async fn connection_flow(
    rt: &AppState,
    assets: &std::sync::Arc<crate::assets::OrgAssets>,
    connection: &ChannelConnection,
) -> ApiResult<std::sync::Arc<crate::models::Flow>> {
    let Some(start_id) = connection.start_id else {
        return Err(ApiError::bad_request("connection has no flow start".to_string()));
    };
    let flow_id: Option<(i32,)> = sqlx::query_as("SELECT flow_id FROM flow_starts WHERE id = $1")
        .bind(start_id)
        .fetch_optional(&rt.db)
        .await
        .map_err(crate::error::FlowhubError::from)?;
    let flow_id =
        flow_id.map(|r| r.0).ok_or_else(|| ApiError::not_found("start is gone".to_string()))?;
    Ok(assets.flow(flow_id)?)
}

/// `POST /fh/ivr/c/{channel_uuid}/status` — provider status callbacks
/// outside the session lifecycle.
pub async fn handle_status(
    State(rt): State<AppState>,
    Path(channel_uuid): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let started = Instant::now();
    let channel = channel_for_uuid(&rt, channel_uuid).await?;
    let provider = rt.ivr_providers.create(&rt, &channel)?;

    let request = CallbackRequest { query: HashMap::new(), body: body.clone() };
    provider.validate_signature(&request)?;

    let external_id = provider.call_id_for_request(&request)?;
    let (status, _duration) = provider.status_for_request(&request);

    let result = sqlx::query(
        "UPDATE channel_connections SET status = $3, modified_on = NOW() WHERE channel_id = $1 AND external_id = $2",
    )
    .bind(channel.id)
    .bind(&external_id)
    .bind(status.code())
    .execute(&rt.db)
    .await
    .map_err(crate::error::FlowhubError::from)?;

    if result.rows_affected() == 0 {
        warn!(external_id, "status update for unknown call");
    }

    let response = provider.empty_response("status updated");
    write_channel_log(&rt, &channel, None, "status update", false, &body, &response, started).await;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct CallEventBody {
    pub urn: String,
    pub status: String,
    #[serde(default)]
    pub duration: i64,
}

/// `POST /fh/ivr/c/{channel_uuid}/call` — record a missed/inbound call
/// event without driving a session.
pub async fn handle_call_event(
    State(rt): State<AppState>,
    Path(channel_uuid): Path<Uuid>,
    Json(body): Json<CallEventBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let channel = channel_for_uuid(&rt, channel_uuid).await?;

    let urn = Urn::parse(&body.urn).map_err(|_| ApiError::bad_request("invalid urn"))?;
    let mut conn = rt.db.acquire().await?;
    let (contact_id, _) =
        Contact::resolve_by_urn(&mut *conn, channel.org_id, &urn, rt.uuids.next()).await?;
    drop(conn);

    let event_type = match body.status.as_str() {
        "miss" | "missed" => ChannelEventType::MoMiss,
        _ => ChannelEventType::MoCall,
    };
    let event = ChannelEvent::create(
        &rt.db,
        channel.org_id,
        channel.id,
        contact_id,
        event_type,
        serde_json::json!({"duration": body.duration}),
    )
    .await?;

    Ok(Json(serde_json::json!({"id": event.id})))
}

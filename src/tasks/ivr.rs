//! IVR call requests and the retry cron.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::assets::OrgAssets;
use crate::error::{Result, WrapErr};
use crate::models::channels::{self, ChannelConnection};
use crate::models::flows::DEFAULT_IVR_RETRY;
use crate::models::http_logs::{self, HttpLog, HttpLogType};
use crate::models::urns::SCHEME_TEL;
use crate::models::{ContactId, Flow, StartId};
use crate::runtime::Runtime;
use crate::services::ivr::IvrProvider;

/// Connections retried per cron tick.
const RETRY_BATCH: i64 = 100;

/// Creates a connection and requests a call for each contact of a voice
/// start batch, returning how many calls were requested. The session
/// itself starts when the provider calls back.
pub async fn request_starts(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    flow: &Flow,
    contact_ids: &[ContactId],
    start_id: Option<StartId>,
) -> Result<usize> {
    let mut conn = rt.db.acquire().await?;
    let contacts = crate::models::Contact::load(&mut *conn, assets.org_id(), contact_ids).await?;
    drop(conn);

    let mut requested = 0;
    for contact in contacts {
        // calls go to the contact's highest priority tel URN, over its
        // affinity channel when it has one
        let Some(urn) = contact.urns.iter().find(|u| u.scheme == SCHEME_TEL) else {
            warn!(contact_id = contact.id, "voice start for contact without tel URN");
            continue;
        };
        let channel = urn
            .channel_id
            .and_then(|id| assets.channel(id))
            .or_else(|| {
                assets
                    .channels()
                    .into_iter()
                    .find(|c| rt.ivr_providers.supports(&c.channel_type))
            });
        let Some(channel) = channel else {
            warn!(contact_id = contact.id, "no call-capable channel for contact");
            continue;
        };

        let mut connection = ChannelConnection::create_outgoing(
            &rt.db,
            assets.org_id(),
            channel.id,
            contact.id,
            &urn.identity(),
            start_id,
        )
        .await?;

        request_call_for_connection(rt, assets, flow.ivr_retry_wait(), &mut connection).await?;
        requested += 1;
    }

    Ok(requested)
}

/// Requests the provider call for a connection, marking it wired on
/// success and errored (scheduled for retry) on failure.
async fn request_call_for_connection(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    retry_wait: Option<Duration>,
    connection: &mut ChannelConnection,
) -> Result<()> {
    let Some(channel) = assets.channel(connection.channel_id) else {
        connection.mark_failed(&rt.db).await?;
        return Ok(());
    };
    let provider = match rt.ivr_providers.create(rt, &channel) {
        Ok(provider) => provider,
        Err(err) => {
            warn!(channel_id = channel.id, error = %err, "no provider for channel");
            connection.mark_failed(&rt.db).await?;
            return Ok(());
        }
    };

    let base = format!("https://{}:{}", rt.config.address, rt.config.port);
    let handle_url = format!(
        "{base}/fh/ivr/c/{}/handle?action=start&connection={}",
        channel.uuid, connection.id
    );
    let status_url = format!("{base}/fh/ivr/c/{}/status", channel.uuid);

    let mut traces = Vec::new();
    let outcome = provider
        .request_call(&connection.contact_urn, &handle_url, &status_url, &mut traces)
        .await;

    let logs: Vec<HttpLog> = traces
        .into_iter()
        .map(|t| HttpLog {
            org_id: assets.org_id(),
            log_type: HttpLogType::IvrRequest,
            url: t.url,
            status_code: t.status_code,
            request: t.request,
            response: t.response,
            elapsed_ms: t.elapsed_ms,
            is_error: t.status_code < 200 || t.status_code >= 300,
            created_on: chrono::Utc::now(),
            ticketer_id: None,
            channel_id: Some(channel.id),
        })
        .collect();
    http_logs::insert_http_logs(&rt.db, &logs).await?;

    match outcome {
        Ok(call_id) => {
            connection.mark_wired(&rt.db, &call_id).await?;
            info!(connection_id = connection.id, call_id, "call requested");
        }
        Err(err) => {
            warn!(connection_id = connection.id, error = %err, "call request failed");
            connection.mark_errored(&rt.db, retry_wait).await?;
        }
    }
    Ok(())
}

/// Cron: picks errored connections whose next attempt is due and
/// re-requests them. A channel gone inactive fails the connection; a
/// channel at its concurrency limit leaves it for a later tick.
pub async fn retry_calls(rt: &Arc<Runtime>) -> Result<()> {
    let connections = channels::load_connections_to_retry(&rt.db, RETRY_BATCH).await?;
    if connections.is_empty() {
        return Ok(());
    }
    info!(count = connections.len(), "retrying errored calls");

    for mut connection in connections {
        let assets = rt
            .cache
            .get_with_refresh(&rt.db, connection.org_id, crate::assets::Refresh::CHANNELS)
            .await
            .wrap_err("error refreshing org channels")?;

        let channel = assets.channel(connection.channel_id);
        if !channel.as_ref().map(|c| c.is_active).unwrap_or(false) {
            connection.mark_failed(&rt.db).await?;
            continue;
        }
        let channel = channel.unwrap();

        let limit = channel.max_concurrent_calls();
        if limit > 0 {
            let active = channels::active_call_count(&rt.db, channel.id).await?;
            if active >= limit {
                continue;
            }
        }

        let retry_wait = retry_wait_for_connection(rt, &assets, &connection).await?;
        request_call_for_connection(rt, &assets, retry_wait, &mut connection).await?;
    }

    Ok(())
}

/// The retry wait for a connection comes from the flow it was started
/// for, falling back to the default when the start is gone.
async fn retry_wait_for_connection(
    rt: &Arc<Runtime>,
    assets: &Arc<OrgAssets>,
    connection: &ChannelConnection,
) -> Result<Option<Duration>> {
    let Some(start_id) = connection.start_id else {
        return Ok(Some(DEFAULT_IVR_RETRY));
    };
    let flow_id: Option<(i32,)> = sqlx::query_as("SELECT flow_id FROM flow_starts WHERE id = $1")
        .bind(start_id)
        .fetch_optional(&rt.db)
        .await?;

    Ok(match flow_id.and_then(|(id,)| assets.flow(id).ok()) {
        Some(flow) => flow.ivr_retry_wait(),
        None => Some(DEFAULT_IVR_RETRY),
    })
}

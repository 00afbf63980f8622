//! Recorded outbound HTTP exchanges with vendors. Bodies are stored only
//! after passing through the redactor.

use chrono::{DateTime, Utc};

use crate::error::Result;

use super::{ChannelId, OrgId, TicketerId};

/// What kind of vendor a log belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpLogType {
    Ticketer,
    Airtime,
    IvrRequest,
}

impl HttpLogType {
    pub fn code(&self) -> &'static str {
        match self {
            HttpLogType::Ticketer => "ticketer_called",
            HttpLogType::Airtime => "airtime_transferred",
            HttpLogType::IvrRequest => "ivr_called",
        }
    }
}

/// One redacted request/response pair.
#[derive(Debug, Clone)]
pub struct HttpLog {
    pub org_id: OrgId,
    pub log_type: HttpLogType,
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: String,
    pub elapsed_ms: i32,
    pub is_error: bool,
    pub created_on: DateTime<Utc>,
    pub ticketer_id: Option<TicketerId>,
    pub channel_id: Option<ChannelId>,
}

pub async fn insert_http_logs(db: impl sqlx::PgExecutor<'_>, logs: &[HttpLog]) -> Result<()> {
    if logs.is_empty() {
        return Ok(());
    }
    let org_ids: Vec<OrgId> = logs.iter().map(|l| l.org_id).collect();
    let types: Vec<&str> = logs.iter().map(|l| l.log_type.code()).collect();
    let urls: Vec<String> = logs.iter().map(|l| l.url.clone()).collect();
    let statuses: Vec<i32> = logs.iter().map(|l| l.status_code).collect();
    let requests: Vec<String> = logs.iter().map(|l| l.request.clone()).collect();
    let responses: Vec<String> = logs.iter().map(|l| l.response.clone()).collect();
    let elapsed: Vec<i32> = logs.iter().map(|l| l.elapsed_ms).collect();
    let is_errors: Vec<bool> = logs.iter().map(|l| l.is_error).collect();
    let created: Vec<DateTime<Utc>> = logs.iter().map(|l| l.created_on).collect();
    let ticketer_ids: Vec<Option<TicketerId>> = logs.iter().map(|l| l.ticketer_id).collect();
    let channel_ids: Vec<Option<ChannelId>> = logs.iter().map(|l| l.channel_id).collect();

    sqlx::query(
        r#"
        INSERT INTO http_logs(org_id, log_type, url, status_code, request, response, elapsed_ms, is_error, created_on, ticketer_id, channel_id)
        SELECT * FROM UNNEST($1::int[], $2::text[], $3::text[], $4::int[], $5::text[], $6::text[],
                             $7::int[], $8::bool[], $9::timestamptz[], $10::int[], $11::int[])
        "#,
    )
    .bind(&org_ids)
    .bind(&types)
    .bind(&urls)
    .bind(&statuses)
    .bind(&requests)
    .bind(&responses)
    .bind(&elapsed)
    .bind(&is_errors)
    .bind(&created)
    .bind(&ticketer_ids)
    .bind(&channel_ids)
    .execute(db)
    .await?;

    Ok(())
}

//! Contact query utilities consumed by the UI.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::models::{GroupId, OrgId};
use crate::search::SearchClient;
use crate::search;

use super::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub org_id: OrgId,
    pub query: String,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `POST /fh/contact/search` — run a query against the contact index.
pub async fn handle_search(
    State(rt): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let assets = rt.cache.get(&rt.db, request.org_id).await?;

    let parsed = search::parse_query(&assets, &request.query)?;
    let contact_ids = rt
        .search
        .contact_ids(&assets, request.group_id, &parsed, request.limit)
        .await?;

    Ok(Json(json!({
        "query": request.query,
        "contact_ids": contact_ids,
        "total": contact_ids.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    pub org_id: OrgId,
    pub query: String,
}

/// `POST /fh/contact/parse_query` — validate a query and return the
/// index DSL it compiles to.
pub async fn handle_parse_query(
    State(rt): State<AppState>,
    Json(request): Json<ParseRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let assets = rt.cache.get(&rt.db, request.org_id).await?;
    let parsed = search::parse_query(&assets, &request.query)?;

    Ok(Json(json!({
        "query": request.query,
        "elastic_query": search::to_index_query(&parsed),
    })))
}

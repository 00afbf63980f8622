//! Flow definition utilities consumed by the UI: inspect, clone and
//! migrate.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::engine::definition::{self, CURRENT_SPEC_VERSION};

use super::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct DefinitionRequest {
    pub flow: serde_json::Value,
}

/// `POST /fh/flow/inspect` — read a definition (migrating legacy ones)
/// and report its header.
pub async fn handle_inspect(
    State(_rt): State<AppState>,
    Json(request): Json<DefinitionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let info = definition::read_flow(&request.flow)?;

    Ok(Json(json!({
        "uuid": info.uuid,
        "name": info.name,
        "spec_version": info.spec_version,
        "type": info.flow_type.as_str(),
        "language": info.language,
    })))
}

/// `POST /fh/flow/clone` — clone a definition with every UUID replaced
/// consistently.
pub async fn handle_clone(
    State(rt): State<AppState>,
    Json(request): Json<DefinitionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    // validate before cloning so a bad definition errors rather than
    // round-tripping garbage
    definition::read_flow(&request.flow)?;
    let cloned = definition::clone_definition(&request.flow, rt.uuids.as_ref())?;
    Ok(Json(cloned))
}

/// `POST /fh/flow/migrate` — migrate a definition to the current spec
/// version.
pub async fn handle_migrate(
    State(_rt): State<AppState>,
    Json(request): Json<DefinitionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let info = definition::read_flow(&request.flow)?;
    let mut migrated = info.definition;
    if let Some(object) = migrated.as_object_mut() {
        object.insert("spec_version".to_string(), json!(CURRENT_SPEC_VERSION));
    }
    Ok(Json(migrated))
}

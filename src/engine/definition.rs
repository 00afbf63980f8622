//! Reading, migrating and cloning flow definitions.
//!
//! Stored definitions may be older than the current spec: legacy
//! definitions (no `spec_version`) are migrated on read. Cloning rewrites
//! every UUID in a definition consistently, which under a seeded generator
//! is fully deterministic.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

use super::UuidGenerator;

/// The engine spec version definitions are migrated up to.
pub const CURRENT_SPEC_VERSION: &str = "13.1.0";

/// Flow type in definition form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionType {
    Messaging,
    Background,
    Voice,
    Surveyor,
}

impl DefinitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionType::Messaging => "messaging",
            DefinitionType::Background => "messaging_background",
            DefinitionType::Voice => "voice",
            DefinitionType::Surveyor => "messaging_offline",
        }
    }

    fn from_str(s: &str) -> Option<DefinitionType> {
        match s {
            "messaging" => Some(DefinitionType::Messaging),
            "messaging_background" => Some(DefinitionType::Background),
            "voice" => Some(DefinitionType::Voice),
            "messaging_offline" => Some(DefinitionType::Surveyor),
            _ => None,
        }
    }

    /// Maps a legacy single-char flow type.
    fn from_legacy(code: &str) -> DefinitionType {
        match code {
            "V" => DefinitionType::Voice,
            "S" => DefinitionType::Surveyor,
            "B" => DefinitionType::Background,
            _ => DefinitionType::Messaging,
        }
    }
}

/// The header of a read definition.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub uuid: Uuid,
    pub name: String,
    pub spec_version: String,
    pub flow_type: DefinitionType,
    pub language: Option<String>,
    /// the (possibly migrated) definition
    pub definition: Value,
}

/// Reads a definition, migrating legacy ones. Current-spec definitions
/// must carry `uuid` and `spec_version`; all missing required fields are
/// reported together.
pub fn read_flow(definition: &Value) -> Result<FlowInfo> {
    let object = definition
        .as_object()
        .ok_or_else(|| FlowhubError::Validation("flow definition must be an object".to_string()))?;

    if !object.contains_key("spec_version") && is_legacy(object) {
        return read_legacy_flow(object);
    }

    let mut missing = Vec::new();
    if !object.contains_key("uuid") {
        missing.push("field 'uuid' is required");
    }
    if !object.contains_key("spec_version") {
        missing.push("field 'spec_version' is required");
    }
    if !missing.is_empty() {
        return Err(FlowhubError::Validation(missing.join(", ")));
    }

    let uuid = parse_uuid(object.get("uuid").unwrap())?;
    let spec_version = object
        .get("spec_version")
        .and_then(Value::as_str)
        .ok_or_else(|| FlowhubError::Validation("field 'spec_version' must be a string".to_string()))?
        .to_string();
    let name = object.get("name").and_then(Value::as_str).unwrap_or("").to_string();
    let flow_type = object
        .get("type")
        .and_then(Value::as_str)
        .and_then(DefinitionType::from_str)
        .unwrap_or(DefinitionType::Messaging);
    let language = object.get("language").and_then(Value::as_str).map(String::from);

    Ok(FlowInfo {
        uuid,
        name,
        spec_version,
        flow_type,
        language,
        definition: definition.clone(),
    })
}

/// Whether an object looks like a legacy definition worth migrating.
fn is_legacy(object: &serde_json::Map<String, Value>) -> bool {
    object.contains_key("base_language")
        || object.contains_key("flow_type")
        || object.contains_key("metadata")
        || object.contains_key("action_sets")
        || object.contains_key("rule_sets")
}

/// Migrates a legacy definition: identity lives under `metadata`, the type
/// is a single char, and the language is `base_language`.
fn read_legacy_flow(object: &serde_json::Map<String, Value>) -> Result<FlowInfo> {
    let metadata = object.get("metadata").and_then(Value::as_object);

    let uuid = metadata
        .and_then(|m| m.get("uuid"))
        .map(parse_uuid)
        .transpose()?
        .ok_or_else(|| FlowhubError::Validation("field 'metadata.uuid' is required".to_string()))?;
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let flow_type = object
        .get("flow_type")
        .and_then(Value::as_str)
        .map(DefinitionType::from_legacy)
        .unwrap_or(DefinitionType::Messaging);
    let language = object.get("base_language").and_then(Value::as_str).map(String::from);

    let mut migrated = serde_json::Map::new();
    migrated.insert("uuid".to_string(), Value::String(uuid.to_string()));
    migrated.insert("name".to_string(), Value::String(name.clone()));
    migrated.insert("spec_version".to_string(), Value::String(CURRENT_SPEC_VERSION.to_string()));
    migrated.insert("type".to_string(), Value::String(flow_type.as_str().to_string()));
    if let Some(language) = &language {
        migrated.insert("language".to_string(), Value::String(language.clone()));
    }
    migrated.insert(
        "nodes".to_string(),
        object.get("nodes").cloned().unwrap_or_else(|| Value::Array(vec![])),
    );

    Ok(FlowInfo {
        uuid,
        name,
        spec_version: CURRENT_SPEC_VERSION.to_string(),
        flow_type,
        language,
        definition: Value::Object(migrated),
    })
}

fn parse_uuid(value: &Value) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FlowhubError::Validation("field 'uuid' must be a valid UUID".to_string()))
}

/// Clones a definition, replacing every UUID with a fresh one from the
/// generator. Each distinct UUID maps to exactly one replacement, so
/// internal references stay consistent.
pub fn clone_definition(definition: &Value, uuids: &dyn UuidGenerator) -> Result<Value> {
    let pattern = Regex::new(
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
    )
    .expect("uuid pattern is valid");

    let serialized = serde_json::to_string(definition)?;
    let mut mapping: HashMap<String, String> = HashMap::new();

    let replaced = pattern.replace_all(&serialized, |caps: &regex::Captures<'_>| {
        let old = caps[0].to_lowercase();
        mapping
            .entry(old)
            .or_insert_with(|| uuids.next().to_string())
            .clone()
    });

    Ok(serde_json::from_str(&replaced)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SeededUuids;

    #[test]
    fn empty_definition_reports_all_required_fields() {
        let err = read_flow(&serde_json::json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: field 'uuid' is required, field 'spec_version' is required"
        );
    }

    #[test]
    fn reads_current_definition() {
        let info = read_flow(&serde_json::json!({
            "uuid": "502c3ee4-3249-4dee-8e71-c62070667d52",
            "name": "Registration",
            "spec_version": "13.1.0",
            "type": "voice",
            "language": "eng",
            "nodes": [],
        }))
        .unwrap();

        assert_eq!(info.name, "Registration");
        assert_eq!(info.flow_type, DefinitionType::Voice);
        assert_eq!(info.language.as_deref(), Some("eng"));
    }

    #[test]
    fn migrates_legacy_definition() {
        let info = read_flow(&serde_json::json!({
            "flow_type": "M",
            "base_language": "eng",
            "metadata": {
                "uuid": "502c3ee4-3249-4dee-8e71-c62070667d52",
                "name": "Legacy",
            },
            "action_sets": [],
        }))
        .unwrap();

        assert_eq!(info.uuid.to_string(), "502c3ee4-3249-4dee-8e71-c62070667d52");
        assert_eq!(info.name, "Legacy");
        assert_eq!(info.flow_type, DefinitionType::Messaging);
        assert_eq!(info.language.as_deref(), Some("eng"));
        assert_eq!(info.spec_version, CURRENT_SPEC_VERSION);
        // migrated definition is in current form
        assert_eq!(info.definition["type"], "messaging");
        assert_eq!(info.definition["spec_version"], CURRENT_SPEC_VERSION);
    }

    #[test]
    fn clone_rewrites_uuids_deterministically() {
        let definition = serde_json::json!({
            "uuid": "502c3ee4-3249-4dee-8e71-c62070667d52",
            "spec_version": "13.1.0",
            "nodes": [
                {"uuid": "9a8870f1-ba9c-4a4a-b08a-3929a7ff273b",
                 "destination": "502c3ee4-3249-4dee-8e71-c62070667d52"},
            ],
        });

        let cloned = clone_definition(&definition, &SeededUuids::new(42)).unwrap();
        let again = clone_definition(&definition, &SeededUuids::new(42)).unwrap();
        assert_eq!(cloned, again);

        // all uuids replaced
        assert_ne!(cloned["uuid"], definition["uuid"]);
        assert_ne!(cloned["nodes"][0]["uuid"], definition["nodes"][0]["uuid"]);
        // internal references move together
        assert_eq!(cloned["uuid"], cloned["nodes"][0]["destination"]);
    }
}

//! Exercises the interpreter boundary and wire contracts through the
//! crate's public API, without a database.

use flowhub::engine::{EngineStatus, FlowRef, Resume, Trigger, TriggerOrigin};

#[test]
fn definitions_validate_and_clone_through_public_api() {
    use flowhub::engine::definition;
    use flowhub::engine::SeededUuids;

    let err = definition::read_flow(&serde_json::json!({})).unwrap_err();
    assert_eq!(
        err.to_string(),
        "validation error: field 'uuid' is required, field 'spec_version' is required"
    );

    let legacy = serde_json::json!({
        "flow_type": "M",
        "base_language": "eng",
        "metadata": {"uuid": "502c3ee4-3249-4dee-8e71-c62070667d52", "name": "Registration"},
    });
    let info = definition::read_flow(&legacy).unwrap();
    assert_eq!(info.name, "Registration");
    assert_eq!(info.language.as_deref(), Some("eng"));

    let cloned =
        definition::clone_definition(&info.definition, &SeededUuids::new(7)).unwrap();
    let again = definition::clone_definition(&info.definition, &SeededUuids::new(7)).unwrap();
    assert_eq!(cloned, again);
    assert_ne!(cloned["uuid"], info.definition["uuid"]);
}

#[test]
fn urn_semantics_through_public_api() {
    use flowhub::models::urns::Urn;

    let urn = Urn::parse("tel:+12024561111?channel=4").unwrap();
    assert!(urn.matches("tel:+120-2456-1111"));
    assert_eq!(urn.identity(), "tel:+12024561111");
}

#[test]
fn task_envelopes_are_wire_compatible() {
    use flowhub::queue::TaskEnvelope;

    let envelope: TaskEnvelope = serde_json::from_value(serde_json::json!({
        "type": "start_flow",
        "org_id": 12,
        "task": {"flow_id": 3},
        "queued_on": "2026-08-01T12:00:00Z",
    }))
    .unwrap();
    assert_eq!(envelope.kind, "start_flow");
    assert_eq!(envelope.org_id, 12);
}

#[test]
fn fire_times_follow_org_timezone() {
    use chrono::{DateTime, Utc};
    use flowhub::models::campaigns::CampaignEvent;
    use uuid::Uuid;

    let event = CampaignEvent {
        id: 1,
        uuid: Uuid::new_v4(),
        campaign_id: 1,
        flow_id: 1,
        relative_to_id: Some(1),
        relative_to_key: None,
        offset_amount: 5,
        offset_unit: "D".to_string(),
        delivery_hour: 12,
        is_active: true,
    };

    let joined: DateTime<Utc> = "2030-08-18T11:31:30Z".parse().unwrap();
    let fire = event.fire_time(chrono_tz::America::Los_Angeles, joined).unwrap();
    assert_eq!(fire, "2030-08-23T19:00:00Z".parse::<DateTime<Utc>>().unwrap());
}

#[test]
fn engine_boundary_types_round_trip() {
    let trigger = Trigger {
        flow: FlowRef { uuid: uuid::Uuid::new_v4(), name: "Favorites".to_string() },
        contact_uuid: uuid::Uuid::new_v4(),
        origin: TriggerOrigin::Manual,
        params: serde_json::Value::Null,
    };
    let json = serde_json::to_value(&trigger).unwrap();
    let parsed: Trigger = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.flow.name, "Favorites");

    let resume = Resume::WaitTimeout;
    let json = serde_json::to_value(&resume).unwrap();
    assert_eq!(json["type"], "wait_timeout");

    let statuses = [EngineStatus::Waiting, EngineStatus::Completed, EngineStatus::Failed];
    for status in statuses {
        let json = serde_json::to_value(status).unwrap();
        let parsed: EngineStatus = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, status);
    }
}

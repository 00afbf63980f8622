//! Hooks committing contact mutations, one bulk statement each.

use async_trait::async_trait;

use crate::assets::OrgAssets;
use crate::error::Result;
use crate::models::contacts::{
    self, FieldUpdate, LanguageUpdate, NameUpdate, StatusUpdate, TimezoneUpdate,
};
use crate::models::{campaigns, groups, urns, ContactId};
use crate::runtime::Runtime;

use super::{CommitHook, HookId, HookItem, SceneItems};

pub struct CommitNameChangesHook;

#[async_trait]
impl CommitHook for CommitNameChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitNameChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        // only the last name change per contact matters
        let updates: Vec<NameUpdate> = scenes
            .iter()
            .filter_map(|scene| {
                scene.items.iter().rev().find_map(|item| match item {
                    HookItem::NameChange(name) => Some(NameUpdate {
                        contact_id: scene.contact_id,
                        name: name.clone(),
                    }),
                    _ => None,
                })
            })
            .collect();

        contacts::update_names(tx, &updates).await
    }
}

pub struct CommitLanguageChangesHook;

#[async_trait]
impl CommitHook for CommitLanguageChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitLanguageChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let updates: Vec<LanguageUpdate> = scenes
            .iter()
            .filter_map(|scene| {
                scene.items.iter().rev().find_map(|item| match item {
                    HookItem::LanguageChange(language) => Some(LanguageUpdate {
                        contact_id: scene.contact_id,
                        language: language.clone(),
                    }),
                    _ => None,
                })
            })
            .collect();

        contacts::update_languages(tx, &updates).await
    }
}

pub struct CommitStatusChangesHook;

#[async_trait]
impl CommitHook for CommitStatusChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitStatusChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let updates: Vec<StatusUpdate> = scenes
            .iter()
            .filter_map(|scene| {
                scene.items.iter().rev().find_map(|item| match item {
                    HookItem::StatusChange(status) => Some(StatusUpdate {
                        contact_id: scene.contact_id,
                        status: *status,
                    }),
                    _ => None,
                })
            })
            .collect();

        contacts::update_statuses(tx, &updates).await
    }
}

pub struct CommitTimezoneChangesHook;

#[async_trait]
impl CommitHook for CommitTimezoneChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitTimezoneChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let updates: Vec<TimezoneUpdate> = scenes
            .iter()
            .filter_map(|scene| {
                scene.items.iter().rev().find_map(|item| match item {
                    HookItem::TimezoneChange(timezone) => Some(TimezoneUpdate {
                        contact_id: scene.contact_id,
                        timezone: timezone.clone(),
                    }),
                    _ => None,
                })
            })
            .collect();

        contacts::update_timezones(tx, &updates).await
    }
}

pub struct CommitFieldChangesHook;

#[async_trait]
impl CommitHook for CommitFieldChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitFieldChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut updates = Vec::new();
        for scene in &scenes {
            for item in &scene.items {
                if let HookItem::FieldChange { field_uuid, value, .. } = item {
                    updates.push(FieldUpdate {
                        contact_id: scene.contact_id,
                        field_uuid: *field_uuid,
                        value: value.clone(),
                    });
                }
            }
        }

        contacts::update_fields(tx, &updates).await
    }
}

pub struct CommitGroupChangesHook;

#[async_trait]
impl CommitHook for CommitGroupChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitGroupChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        for scene in &scenes {
            for item in &scene.items {
                match item {
                    HookItem::GroupAdd(group_id) => adds.push(groups::GroupMembership {
                        contact_id: scene.contact_id,
                        group_id: *group_id,
                    }),
                    HookItem::GroupRemove(group_id) => removes.push(groups::GroupMembership {
                        contact_id: scene.contact_id,
                        group_id: *group_id,
                    }),
                    _ => {}
                }
            }
        }

        groups::add_memberships(&mut *tx, &adds).await?;
        groups::remove_memberships(&mut *tx, &removes).await?;
        Ok(())
    }
}

pub struct CommitUrnChangesHook;

#[async_trait]
impl CommitHook for CommitUrnChangesHook {
    fn id(&self) -> HookId {
        HookId::CommitUrnChanges
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        for scene in &scenes {
            // the last staged set wins; it is the contact's full URN list
            // in priority order
            if let Some(HookItem::UrnsChange(set)) = scene
                .items
                .iter()
                .rev()
                .find(|item| matches!(item, HookItem::UrnsChange(_)))
            {
                urns::set_contact_urns(&mut *tx, assets.org_id(), scene.contact_id, set).await?;
            }
        }
        Ok(())
    }
}

pub struct ContactModifiedHook;

#[async_trait]
impl CommitHook for ContactModifiedHook {
    fn id(&self) -> HookId {
        HookId::ContactModified
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut contact_ids: Vec<ContactId> = scenes.iter().map(|s| s.contact_id).collect();
        contact_ids.sort_unstable();
        contact_ids.dedup();
        contacts::mark_modified(tx, &contact_ids).await
    }
}

pub struct ContactLastSeenHook;

#[async_trait]
impl CommitHook for ContactLastSeenHook {
    fn id(&self) -> HookId {
        HookId::ContactLastSeen
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let mut latest = None;
        let mut contact_ids = Vec::new();
        for scene in &scenes {
            for item in &scene.items {
                if let HookItem::LastSeen(seen_on) = item {
                    contact_ids.push(scene.contact_id);
                    latest = Some(latest.map_or(*seen_on, |l: chrono::DateTime<chrono::Utc>| {
                        l.max(*seen_on)
                    }));
                }
            }
        }

        if let Some(seen_on) = latest {
            contact_ids.sort_unstable();
            contact_ids.dedup();
            contacts::update_last_seen(tx, &contact_ids, seen_on).await?;
        }
        Ok(())
    }
}

/// Recomputes scheduled campaign fires for contacts whose group
/// memberships or relative fields changed this sprint.
pub struct UpdateCampaignFiresHook;

#[async_trait]
impl CommitHook for UpdateCampaignFiresHook {
    fn id(&self) -> HookId {
        HookId::UpdateCampaignFires
    }

    fn depends_on(&self) -> &[HookId] {
        // membership rows must exist before fires are recomputed from them
        &[HookId::CommitGroupChanges, HookId::CommitFieldChanges]
    }

    async fn apply(
        &self,
        _rt: &Runtime,
        tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scenes: Vec<SceneItems>,
    ) -> Result<()> {
        let tz = assets.timezone()?;
        let now = chrono::Utc::now();

        let mut deletes: Vec<(Vec<i32>, ContactId)> = Vec::new();
        let mut inserts = Vec::new();

        for scene in &scenes {
            for item in &scene.items {
                match item {
                    HookItem::GroupAdd(group_id) => {
                        for event in assets.campaign_events_for_group(*group_id) {
                            // a newly added member gets fires from the
                            // contact's current relative value
                            let relative_to = relative_value_for(tx, scene.contact_id, event).await?;
                            if let Some(relative_to) = relative_to {
                                let fire_time = event.fire_time(tz, relative_to)?;
                                if fire_time > now {
                                    inserts.push((scene.contact_id, event.id, fire_time));
                                }
                            }
                        }
                    }
                    HookItem::GroupRemove(group_id) => {
                        let event_ids: Vec<i32> = assets
                            .campaign_events_for_group(*group_id)
                            .iter()
                            .map(|e| e.id)
                            .collect();
                        if !event_ids.is_empty() {
                            deletes.push((event_ids, scene.contact_id));
                        }
                    }
                    HookItem::FieldChange { field_id, value, .. } => {
                        let events = assets.campaign_events_for_field(*field_id);
                        let event_ids: Vec<i32> = events.iter().map(|e| e.id).collect();
                        if event_ids.is_empty() {
                            continue;
                        }
                        deletes.push((event_ids, scene.contact_id));

                        if let Some(datetime) =
                            value.as_ref().and_then(|v| v.datetime)
                        {
                            for event in events {
                                // only contacts in the campaign's group
                                // get new fires
                                let Some(group_id) = assets.group_for_campaign_event(event) else {
                                    continue;
                                };
                                if !in_group(tx, scene.contact_id, group_id).await? {
                                    continue;
                                }
                                let fire_time = event.fire_time(tz, datetime)?;
                                if fire_time > now {
                                    inserts.push((scene.contact_id, event.id, fire_time));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        for (event_ids, contact_id) in deletes {
            campaigns::delete_unfired_fires_for_contacts(&mut *tx, &event_ids, &[contact_id])
                .await?;
        }
        campaigns::insert_fires(&mut *tx, &inserts).await?;
        Ok(())
    }
}

async fn relative_value_for(
    tx: &mut sqlx::PgConnection,
    contact_id: ContactId,
    event: &crate::models::CampaignEvent,
) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    let row: Option<(Option<chrono::DateTime<chrono::Utc>>,)> =
        match (&event.relative_to_id, &event.relative_to_key) {
            (Some(field_id), _) => {
                sqlx::query_as(
                    r#"
                    SELECT (c.fields -> f.uuid::text ->> 'datetime')::timestamptz
                      FROM contacts c, contact_fields f
                     WHERE c.id = $1 AND f.id = $2
                    "#,
                )
                .bind(contact_id)
                .bind(field_id)
                .fetch_optional(&mut *tx)
                .await?
            }
            (None, Some(key)) if key == "created_on" => {
                sqlx::query_as("SELECT created_on FROM contacts WHERE id = $1")
                    .bind(contact_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            (None, Some(key)) if key == "last_seen_on" => {
                sqlx::query_as("SELECT last_seen_on FROM contacts WHERE id = $1")
                    .bind(contact_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            _ => None,
        };

    Ok(row.and_then(|r| r.0))
}

async fn in_group(
    tx: &mut sqlx::PgConnection,
    contact_id: ContactId,
    group_id: crate::models::GroupId,
) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM contact_group_members WHERE contact_id = $1 AND group_id = $2)",
    )
    .bind(contact_id)
    .bind(group_id)
    .fetch_one(&mut *tx)
    .await?;
    Ok(row.0)
}

//! Handlers for contact mutation events.

use async_trait::async_trait;
use tracing::debug;

use crate::assets::OrgAssets;
use crate::engine::Event;
use crate::error::{FlowhubError, Result};
use crate::hooks::{HookId, HookItem};
use crate::models::urns::Urn;
use crate::runtime::Runtime;

use super::{EventHandler, Scene};

pub struct ContactNameChangedHandler;

#[async_trait]
impl EventHandler for ContactNameChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactNameChanged { name } = event else { return Ok(()) };
        debug!(contact_uuid = %scene.contact.uuid, name = %name, "contact name changed");

        scene.stage_pre(HookId::CommitNameChanges, HookItem::NameChange(name.clone()));
        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

pub struct ContactLanguageChangedHandler;

#[async_trait]
impl EventHandler for ContactLanguageChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactLanguageChanged { language } = event else { return Ok(()) };
        debug!(contact_uuid = %scene.contact.uuid, language = %language, "contact language changed");

        scene.stage_pre(HookId::CommitLanguageChanges, HookItem::LanguageChange(language.clone()));
        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

pub struct ContactStatusChangedHandler;

#[async_trait]
impl EventHandler for ContactStatusChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactStatusChanged { status } = event else { return Ok(()) };
        debug!(contact_uuid = %scene.contact.uuid, status = ?status, "contact status changed");

        scene.stage_pre(HookId::CommitStatusChanges, HookItem::StatusChange(*status));
        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

pub struct ContactTimezoneChangedHandler;

#[async_trait]
impl EventHandler for ContactTimezoneChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactTimezoneChanged { timezone } = event else { return Ok(()) };

        scene.stage_pre(HookId::CommitTimezoneChanges, HookItem::TimezoneChange(timezone.clone()));
        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

pub struct ContactFieldChangedHandler;

#[async_trait]
impl EventHandler for ContactFieldChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactFieldChanged { field, value } = event else { return Ok(()) };

        let asset = assets.field_by_key(&field.key).ok_or_else(|| {
            FlowhubError::AssetMissing(format!("unable to find field with key: {}", field.key))
        })?;
        debug!(contact_uuid = %scene.contact.uuid, field = %field.key, "contact field changed");

        scene.stage_pre(
            HookId::CommitFieldChanges,
            HookItem::FieldChange {
                field_id: asset.id,
                field_uuid: asset.uuid,
                value: value.clone(),
            },
        );
        // a changed relative field invalidates scheduled campaign fires
        if !assets.campaign_events_for_field(asset.id).is_empty() {
            scene.stage_pre(
                HookId::UpdateCampaignFires,
                HookItem::FieldChange {
                    field_id: asset.id,
                    field_uuid: asset.uuid,
                    value: value.clone(),
                },
            );
        }
        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

pub struct ContactGroupsChangedHandler;

#[async_trait]
impl EventHandler for ContactGroupsChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactGroupsChanged { groups_added, groups_removed } = event else {
            return Ok(());
        };

        for group in groups_added {
            let asset = assets.group_by_uuid(&group.uuid).ok_or_else(|| {
                FlowhubError::AssetMissing(format!("unable to find group with UUID: {}", group.uuid))
            })?;
            debug!(contact_uuid = %scene.contact.uuid, group = %asset.name, "added to group");
            scene.stage_pre(HookId::CommitGroupChanges, HookItem::GroupAdd(asset.id));
            if !assets.campaign_events_for_group(asset.id).is_empty() {
                scene.stage_pre(HookId::UpdateCampaignFires, HookItem::GroupAdd(asset.id));
            }
        }

        for group in groups_removed {
            let asset = assets.group_by_uuid(&group.uuid).ok_or_else(|| {
                FlowhubError::AssetMissing(format!("unable to find group with UUID: {}", group.uuid))
            })?;
            debug!(contact_uuid = %scene.contact.uuid, group = %asset.name, "removed from group");
            scene.stage_pre(HookId::CommitGroupChanges, HookItem::GroupRemove(asset.id));
            if !assets.campaign_events_for_group(asset.id).is_empty() {
                scene.stage_pre(HookId::UpdateCampaignFires, HookItem::GroupRemove(asset.id));
            }
        }

        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

pub struct ContactUrnsChangedHandler;

#[async_trait]
impl EventHandler for ContactUrnsChangedHandler {
    async fn handle(
        &self,
        _rt: &Runtime,
        _tx: &mut sqlx::PgConnection,
        _assets: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<()> {
        let Event::ContactUrnsChanged { urns } = event else { return Ok(()) };

        let parsed: Result<Vec<Urn>> = urns.iter().map(|u| Urn::parse(u)).collect();
        scene.stage_pre(HookId::CommitUrnChanges, HookItem::UrnsChange(parsed?));
        scene.stage_pre(HookId::ContactModified, HookItem::Modified);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Field;
    use crate::models::orgs::{Org, OrgConfig};

    #[test]
    fn unknown_field_key_is_missing_asset() {
        let assets = OrgAssets::for_tests(Org {
            id: 1,
            name: "Org".to_string(),
            is_active: true,
            config: OrgConfig::default(),
        });
        assert!(assets.field_by_key("xyz").is_none());

        let mut with_field = OrgAssets::for_tests(Org {
            id: 1,
            name: "Org".to_string(),
            is_active: true,
            config: OrgConfig::default(),
        });
        with_field.add_field_for_tests(Field {
            id: 7,
            uuid: uuid::Uuid::new_v4(),
            org_id: 1,
            key: "joined".to_string(),
            name: "Joined".to_string(),
            field_type: "D".to_string(),
        });
        assert!(with_field.field_by_key("joined").is_some());
        // no campaign events configured, so a change to it stages no recalc
        assert!(with_field.campaign_events_for_field(7).is_empty());
    }
}

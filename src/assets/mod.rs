//! Per-org configuration snapshots.
//!
//! An `OrgAssets` is an immutable view of everything read-mostly an org
//! owns: flows, channels, groups, fields, labels, ticketers and campaigns.
//! Tasks hold one snapshot for their whole run; refreshes build a new
//! generation and swap it in behind them. Cross-references (flows to
//! groups, groups to campaigns) resolve through the id maps on the
//! snapshot, never through pointer cycles.

mod cache;

use std::collections::HashMap;
use std::sync::Arc;

use chrono_tz::Tz;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};
use crate::models::{
    Campaign, CampaignEvent, Channel, ChannelId, Field, FieldId, Flow, FlowId, Group, GroupId,
    Label, Org, OrgId, Ticketer, TicketerId,
};

pub use cache::AssetCache;

/// Bitmask selecting the asset classes a refresh reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refresh(u32);

impl Refresh {
    pub const NONE: Refresh = Refresh(0);
    pub const ORG: Refresh = Refresh(1);
    pub const CHANNELS: Refresh = Refresh(1 << 1);
    pub const FLOWS: Refresh = Refresh(1 << 2);
    pub const GROUPS: Refresh = Refresh(1 << 3);
    pub const FIELDS: Refresh = Refresh(1 << 4);
    pub const LABELS: Refresh = Refresh(1 << 5);
    pub const TICKETERS: Refresh = Refresh(1 << 6);
    pub const CAMPAIGNS: Refresh = Refresh(1 << 7);
    pub const ALL: Refresh = Refresh(u32::MAX);

    pub fn contains(&self, other: Refresh) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Refresh {
    type Output = Refresh;

    fn bitor(self, rhs: Refresh) -> Refresh {
        Refresh(self.0 | rhs.0)
    }
}

/// An immutable snapshot of one org's configuration.
pub struct OrgAssets {
    org: Org,
    generation: u64,

    flows: HashMap<FlowId, Arc<Flow>>,
    flows_by_uuid: HashMap<Uuid, Arc<Flow>>,
    flows_by_name: HashMap<String, Arc<Flow>>,

    channels: HashMap<ChannelId, Arc<Channel>>,
    channels_by_uuid: HashMap<Uuid, Arc<Channel>>,

    groups: HashMap<GroupId, Arc<Group>>,
    groups_by_uuid: HashMap<Uuid, Arc<Group>>,

    fields: HashMap<FieldId, Arc<Field>>,
    fields_by_uuid: HashMap<Uuid, Arc<Field>>,
    fields_by_key: HashMap<String, Arc<Field>>,

    labels_by_uuid: HashMap<Uuid, Arc<Label>>,

    ticketers: HashMap<TicketerId, Arc<Ticketer>>,
    ticketers_by_uuid: HashMap<Uuid, Arc<Ticketer>>,

    campaigns: Vec<Arc<Campaign>>,
    campaign_events: Vec<Arc<CampaignEvent>>,
    /// events keyed by the group their campaign watches
    campaign_events_by_group: HashMap<GroupId, Vec<Arc<CampaignEvent>>>,
    /// events keyed by the contact field they are relative to
    campaign_events_by_field: HashMap<FieldId, Vec<Arc<CampaignEvent>>>,
}

impl OrgAssets {
    /// Loads a complete snapshot for the org.
    pub async fn load(db: &PgPool, org_id: OrgId) -> Result<OrgAssets> {
        let mut assets = OrgAssets {
            org: Org::load(db, org_id).await?,
            generation: 1,
            flows: HashMap::new(),
            flows_by_uuid: HashMap::new(),
            flows_by_name: HashMap::new(),
            channels: HashMap::new(),
            channels_by_uuid: HashMap::new(),
            groups: HashMap::new(),
            groups_by_uuid: HashMap::new(),
            fields: HashMap::new(),
            fields_by_uuid: HashMap::new(),
            fields_by_key: HashMap::new(),
            labels_by_uuid: HashMap::new(),
            ticketers: HashMap::new(),
            ticketers_by_uuid: HashMap::new(),
            campaigns: Vec::new(),
            campaign_events: Vec::new(),
            campaign_events_by_group: HashMap::new(),
            campaign_events_by_field: HashMap::new(),
        };
        assets.reload(db, Refresh::ALL).await?;
        Ok(assets)
    }

    /// Builds the next generation of this snapshot, reloading only the
    /// classes in `mask` and carrying everything else over by reference.
    pub async fn refreshed(&self, db: &PgPool, mask: Refresh) -> Result<OrgAssets> {
        let mut next = self.shallow_copy();
        next.generation = self.generation + 1;
        next.reload(db, mask).await?;
        Ok(next)
    }

    fn shallow_copy(&self) -> OrgAssets {
        OrgAssets {
            org: self.org.clone(),
            generation: self.generation,
            flows: self.flows.clone(),
            flows_by_uuid: self.flows_by_uuid.clone(),
            flows_by_name: self.flows_by_name.clone(),
            channels: self.channels.clone(),
            channels_by_uuid: self.channels_by_uuid.clone(),
            groups: self.groups.clone(),
            groups_by_uuid: self.groups_by_uuid.clone(),
            fields: self.fields.clone(),
            fields_by_uuid: self.fields_by_uuid.clone(),
            fields_by_key: self.fields_by_key.clone(),
            labels_by_uuid: self.labels_by_uuid.clone(),
            ticketers: self.ticketers.clone(),
            ticketers_by_uuid: self.ticketers_by_uuid.clone(),
            campaigns: self.campaigns.clone(),
            campaign_events: self.campaign_events.clone(),
            campaign_events_by_group: self.campaign_events_by_group.clone(),
            campaign_events_by_field: self.campaign_events_by_field.clone(),
        }
    }

    async fn reload(&mut self, db: &PgPool, mask: Refresh) -> Result<()> {
        let org_id = self.org.id;

        if mask.contains(Refresh::ORG) {
            self.org = Org::load(db, org_id).await?;
        }
        if mask.contains(Refresh::FLOWS) {
            self.flows.clear();
            self.flows_by_uuid.clear();
            self.flows_by_name.clear();
            for flow in Flow::load_for_org(db, org_id).await? {
                let flow = Arc::new(flow);
                self.flows.insert(flow.id, flow.clone());
                self.flows_by_uuid.insert(flow.uuid, flow.clone());
                self.flows_by_name.insert(flow.name.to_lowercase(), flow);
            }
        }
        if mask.contains(Refresh::CHANNELS) {
            self.channels.clear();
            self.channels_by_uuid.clear();
            for channel in Channel::load_for_org(db, org_id).await? {
                let channel = Arc::new(channel);
                self.channels.insert(channel.id, channel.clone());
                self.channels_by_uuid.insert(channel.uuid, channel);
            }
        }
        if mask.contains(Refresh::GROUPS) {
            self.groups.clear();
            self.groups_by_uuid.clear();
            for group in Group::load_for_org(db, org_id).await? {
                let group = Arc::new(group);
                self.groups.insert(group.id, group.clone());
                self.groups_by_uuid.insert(group.uuid, group);
            }
        }
        if mask.contains(Refresh::FIELDS) {
            self.fields.clear();
            self.fields_by_uuid.clear();
            self.fields_by_key.clear();
            for field in Field::load_for_org(db, org_id).await? {
                let field = Arc::new(field);
                self.fields.insert(field.id, field.clone());
                self.fields_by_uuid.insert(field.uuid, field.clone());
                self.fields_by_key.insert(field.key.clone(), field);
            }
        }
        if mask.contains(Refresh::LABELS) {
            self.labels_by_uuid.clear();
            for label in Label::load_for_org(db, org_id).await? {
                self.labels_by_uuid.insert(label.uuid, Arc::new(label));
            }
        }
        if mask.contains(Refresh::TICKETERS) {
            self.ticketers.clear();
            self.ticketers_by_uuid.clear();
            for ticketer in Ticketer::load_for_org(db, org_id).await? {
                let ticketer = Arc::new(ticketer);
                self.ticketers.insert(ticketer.id, ticketer.clone());
                self.ticketers_by_uuid.insert(ticketer.uuid, ticketer);
            }
        }
        if mask.contains(Refresh::CAMPAIGNS) {
            self.campaigns.clear();
            self.campaign_events.clear();
            self.campaign_events_by_group.clear();
            self.campaign_events_by_field.clear();

            let campaigns = sqlx::query_as::<_, Campaign>(
                "SELECT id, uuid, org_id, name, group_id FROM campaigns WHERE org_id = $1 AND is_active = TRUE ORDER BY id",
            )
            .bind(org_id)
            .fetch_all(db)
            .await?;
            let groups_by_campaign: HashMap<_, _> =
                campaigns.iter().map(|c| (c.id, c.group_id)).collect();
            self.campaigns = campaigns.into_iter().map(Arc::new).collect();

            for event in CampaignEvent::load_for_org(db, org_id).await? {
                let event = Arc::new(event);
                self.campaign_events.push(event.clone());
                if let Some(&group_id) = groups_by_campaign.get(&event.campaign_id) {
                    self.campaign_events_by_group
                        .entry(group_id)
                        .or_default()
                        .push(event.clone());
                }
                if let Some(field_id) = event.relative_to_id {
                    self.campaign_events_by_field
                        .entry(field_id)
                        .or_default()
                        .push(event);
                }
            }
        }

        Ok(())
    }

    pub fn org(&self) -> &Org {
        &self.org
    }

    pub fn org_id(&self) -> OrgId {
        self.org.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.org.timezone()
    }

    pub fn flow(&self, id: FlowId) -> Result<Arc<Flow>> {
        self.flows
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowhubError::AssetMissing(format!("no such flow: {id}")))
    }

    pub fn flow_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Flow>> {
        self.flows_by_uuid.get(uuid).cloned()
    }

    pub fn flow_by_name(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows_by_name.get(&name.to_lowercase()).cloned()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    pub fn channel_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Channel>> {
        self.channels_by_uuid.get(uuid).cloned()
    }

    /// All channels, lowest id first.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = self.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.id);
        channels
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<Group>> {
        self.groups.get(&id).cloned()
    }

    pub fn group_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Group>> {
        self.groups_by_uuid.get(uuid).cloned()
    }

    pub fn field(&self, id: FieldId) -> Option<Arc<Field>> {
        self.fields.get(&id).cloned()
    }

    pub fn field_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Field>> {
        self.fields_by_uuid.get(uuid).cloned()
    }

    pub fn field_by_key(&self, key: &str) -> Option<Arc<Field>> {
        self.fields_by_key.get(key).cloned()
    }

    pub fn label_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Label>> {
        self.labels_by_uuid.get(uuid).cloned()
    }

    pub fn ticketer(&self, id: TicketerId) -> Option<Arc<Ticketer>> {
        self.ticketers.get(&id).cloned()
    }

    pub fn ticketer_by_uuid(&self, uuid: &Uuid) -> Option<Arc<Ticketer>> {
        self.ticketers_by_uuid.get(uuid).cloned()
    }

    pub fn campaigns(&self) -> &[Arc<Campaign>] {
        &self.campaigns
    }

    pub fn campaign_events(&self) -> &[Arc<CampaignEvent>] {
        &self.campaign_events
    }

    pub fn campaign_events_for_group(&self, group_id: GroupId) -> &[Arc<CampaignEvent>] {
        self.campaign_events_by_group
            .get(&group_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn campaign_events_for_field(&self, field_id: FieldId) -> &[Arc<CampaignEvent>] {
        self.campaign_events_by_field
            .get(&field_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The group owning a campaign event, resolved through the snapshot.
    pub fn group_for_campaign_event(&self, event: &CampaignEvent) -> Option<GroupId> {
        self.campaigns
            .iter()
            .find(|c| c.id == event.campaign_id)
            .map(|c| c.group_id)
    }

    #[cfg(test)]
    pub fn for_tests(org: Org) -> OrgAssets {
        OrgAssets {
            org,
            generation: 1,
            flows: HashMap::new(),
            flows_by_uuid: HashMap::new(),
            flows_by_name: HashMap::new(),
            channels: HashMap::new(),
            channels_by_uuid: HashMap::new(),
            groups: HashMap::new(),
            groups_by_uuid: HashMap::new(),
            fields: HashMap::new(),
            fields_by_uuid: HashMap::new(),
            fields_by_key: HashMap::new(),
            labels_by_uuid: HashMap::new(),
            ticketers: HashMap::new(),
            ticketers_by_uuid: HashMap::new(),
            campaigns: Vec::new(),
            campaign_events: Vec::new(),
            campaign_events_by_group: HashMap::new(),
            campaign_events_by_field: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn add_flow_for_tests(&mut self, flow: Flow) {
        let flow = Arc::new(flow);
        self.flows.insert(flow.id, flow.clone());
        self.flows_by_uuid.insert(flow.uuid, flow.clone());
        self.flows_by_name.insert(flow.name.to_lowercase(), flow);
    }

    #[cfg(test)]
    pub fn add_field_for_tests(&mut self, field: Field) {
        let field = Arc::new(field);
        self.fields.insert(field.id, field.clone());
        self.fields_by_uuid.insert(field.uuid, field.clone());
        self.fields_by_key.insert(field.key.clone(), field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_mask_algebra() {
        let mask = Refresh::FLOWS | Refresh::GROUPS;
        assert!(mask.contains(Refresh::FLOWS));
        assert!(mask.contains(Refresh::GROUPS));
        assert!(!mask.contains(Refresh::CHANNELS));
        assert!(Refresh::ALL.contains(mask));
        assert!(mask.contains(Refresh::NONE));
    }
}

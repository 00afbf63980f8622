//! Campaigns: groups of contacts scheduled into flows relative to a date
//! field, and the event fires that realize the schedule.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

use super::{CampaignEventId, CampaignId, ContactId, EventFireId, FieldId, FlowId, GroupId, OrgId};

#[derive(Debug, Clone, FromRow)]
pub struct Campaign {
    pub id: CampaignId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub group_id: GroupId,
}

/// Unit of a campaign event's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl OffsetUnit {
    pub fn from_code(code: &str) -> Result<OffsetUnit> {
        match code {
            "M" => Ok(OffsetUnit::Minutes),
            "H" => Ok(OffsetUnit::Hours),
            "D" => Ok(OffsetUnit::Days),
            "W" => Ok(OffsetUnit::Weeks),
            other => Err(FlowhubError::Validation(format!(
                "unknown offset unit: {other}"
            ))),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OffsetUnit::Minutes => "M",
            OffsetUnit::Hours => "H",
            OffsetUnit::Days => "D",
            OffsetUnit::Weeks => "W",
        }
    }
}

/// A single scheduled event within a campaign.
#[derive(Debug, Clone, FromRow)]
pub struct CampaignEvent {
    pub id: CampaignEventId,
    pub uuid: Uuid,
    pub campaign_id: CampaignId,
    pub flow_id: FlowId,
    /// contact field the fire time is computed from; NULL when relative to
    /// a system field
    pub relative_to_id: Option<FieldId>,
    /// system field key when relative_to_id is NULL: created_on or
    /// last_seen_on
    pub relative_to_key: Option<String>,
    pub offset_amount: i32,
    pub offset_unit: String,
    /// hour of day (org timezone) deliveries snap to, -1 for none
    pub delivery_hour: i32,
    pub is_active: bool,
}

impl CampaignEvent {
    pub fn unit(&self) -> Result<OffsetUnit> {
        OffsetUnit::from_code(&self.offset_unit)
    }

    /// Computes when this event fires for a contact whose relative field
    /// holds `relative_to`. All arithmetic happens in the org's timezone
    /// so day offsets and the delivery hour honor DST.
    pub fn fire_time(&self, tz: Tz, relative_to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let local = relative_to.with_timezone(&tz);

        let shifted = match self.unit()? {
            OffsetUnit::Minutes => local + Duration::minutes(self.offset_amount as i64),
            OffsetUnit::Hours => local + Duration::hours(self.offset_amount as i64),
            OffsetUnit::Days => local + Duration::days(self.offset_amount as i64),
            OffsetUnit::Weeks => local + Duration::weeks(self.offset_amount as i64),
        };

        let fire = if self.delivery_hour >= 0 {
            let date = shifted.date_naive();
            let naive = date
                .and_hms_opt(self.delivery_hour as u32, 0, 0)
                .ok_or_else(|| {
                    FlowhubError::Validation(format!("invalid delivery hour: {}", self.delivery_hour))
                })?;
            // on a DST gap take the later valid time
            match tz.from_local_datetime(&naive) {
                chrono::LocalResult::Single(dt) => dt,
                chrono::LocalResult::Ambiguous(first, _) => first,
                chrono::LocalResult::None => tz
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
                    .ok_or_else(|| {
                        FlowhubError::Validation("unresolvable delivery time".to_string())
                    })?,
            }
        } else {
            shifted
        };

        Ok(fire.with_timezone(&Utc))
    }

    pub async fn load(
        db: impl sqlx::PgExecutor<'_>,
        event_id: CampaignEventId,
    ) -> Result<Option<CampaignEvent>> {
        let event = sqlx::query_as::<_, CampaignEvent>(
            r#"
            SELECT id, uuid, campaign_id, flow_id, relative_to_id, relative_to_key,
                   offset_amount, offset_unit, delivery_hour, is_active
              FROM campaign_events WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(db)
        .await?;
        Ok(event)
    }

    pub async fn load_for_org(
        db: impl sqlx::PgExecutor<'_>,
        org_id: OrgId,
    ) -> Result<Vec<CampaignEvent>> {
        let events = sqlx::query_as::<_, CampaignEvent>(
            r#"
            SELECT ce.id, ce.uuid, ce.campaign_id, ce.flow_id, ce.relative_to_id, ce.relative_to_key,
                   ce.offset_amount, ce.offset_unit, ce.delivery_hour, ce.is_active
              FROM campaign_events ce
             INNER JOIN campaigns c ON c.id = ce.campaign_id
             WHERE c.org_id = $1 AND ce.is_active = TRUE AND c.is_active = TRUE
             ORDER BY ce.id
            "#,
        )
        .bind(org_id)
        .fetch_all(db)
        .await?;
        Ok(events)
    }
}

/// A scheduled (contact, campaign event, fire time) tuple.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventFire {
    pub id: EventFireId,
    pub event_id: CampaignEventId,
    pub contact_id: ContactId,
    pub scheduled: DateTime<Utc>,
    pub fired: Option<DateTime<Utc>>,
}

/// Deletes all unfired fires for an event, the first step of a reschedule.
pub async fn delete_unfired_fires(
    db: impl sqlx::PgExecutor<'_>,
    event_id: CampaignEventId,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM event_fires WHERE event_id = $1 AND fired IS NULL")
        .bind(event_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

/// Deletes unfired fires for contacts whose relative field changed; the
/// scheduler re-adds fires for their new values.
pub async fn delete_unfired_fires_for_contacts(
    db: impl sqlx::PgExecutor<'_>,
    event_ids: &[CampaignEventId],
    contact_ids: &[ContactId],
) -> Result<()> {
    if event_ids.is_empty() || contact_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "DELETE FROM event_fires WHERE event_id = ANY($1) AND contact_id = ANY($2) AND fired IS NULL",
    )
    .bind(event_ids)
    .bind(contact_ids)
    .execute(db)
    .await?;
    Ok(())
}

/// Bulk inserts fires for an event.
pub async fn insert_fires(
    db: impl sqlx::PgExecutor<'_>,
    fires: &[(ContactId, CampaignEventId, DateTime<Utc>)],
) -> Result<()> {
    if fires.is_empty() {
        return Ok(());
    }
    let contact_ids: Vec<ContactId> = fires.iter().map(|f| f.0).collect();
    let event_ids: Vec<CampaignEventId> = fires.iter().map(|f| f.1).collect();
    let times: Vec<DateTime<Utc>> = fires.iter().map(|f| f.2).collect();

    sqlx::query(
        r#"
        INSERT INTO event_fires(contact_id, event_id, scheduled)
        SELECT * FROM UNNEST($1::bigint[], $2::int[], $3::timestamptz[])
        "#,
    )
    .bind(&contact_ids)
    .bind(&event_ids)
    .bind(&times)
    .execute(db)
    .await?;

    Ok(())
}

/// Recomputes and inserts the fires for one campaign event: every contact
/// in the campaign group with a value for the relative field gets a fire
/// if that fire is still in the future.
pub async fn schedule_event_fires(
    db: &mut sqlx::PgConnection,
    tz: Tz,
    event: &CampaignEvent,
    group_id: GroupId,
) -> Result<usize> {
    delete_unfired_fires(&mut *db, event.id).await?;

    // the relative value is either a field datetime or a system column
    let rows: Vec<(ContactId, Option<DateTime<Utc>>)> = match (&event.relative_to_id, &event.relative_to_key) {
        (Some(field_id), _) => {
            sqlx::query_as(
                r#"
                SELECT c.id, (c.fields -> f.uuid::text ->> 'datetime')::timestamptz
                  FROM contacts c
                 INNER JOIN contact_group_members cgm ON cgm.contact_id = c.id AND cgm.group_id = $1
                 INNER JOIN contact_fields f ON f.id = $2
                 WHERE c.is_active = TRUE AND c.status = 'A'
                "#,
            )
            .bind(group_id)
            .bind(field_id)
            .fetch_all(&mut *db)
            .await?
        }
        (None, Some(key)) if key == "created_on" => {
            sqlx::query_as(
                r#"
                SELECT c.id, c.created_on
                  FROM contacts c
                 INNER JOIN contact_group_members cgm ON cgm.contact_id = c.id AND cgm.group_id = $1
                 WHERE c.is_active = TRUE AND c.status = 'A'
                "#,
            )
            .bind(group_id)
            .fetch_all(&mut *db)
            .await?
        }
        (None, Some(key)) if key == "last_seen_on" => {
            sqlx::query_as(
                r#"
                SELECT c.id, c.last_seen_on
                  FROM contacts c
                 INNER JOIN contact_group_members cgm ON cgm.contact_id = c.id AND cgm.group_id = $1
                 WHERE c.is_active = TRUE AND c.status = 'A'
                "#,
            )
            .bind(group_id)
            .fetch_all(&mut *db)
            .await?
        }
        (None, other) => {
            return Err(FlowhubError::Validation(format!(
                "unknown relative field: {other:?}"
            )))
        }
    };

    let now = Utc::now();
    let mut fires = Vec::new();
    for (contact_id, relative_to) in rows {
        let Some(relative_to) = relative_to else { continue };
        let fire_time = event.fire_time(tz, relative_to)?;
        if fire_time > now {
            fires.push((contact_id, event.id, fire_time));
        }
    }

    insert_fires(&mut *db, &fires).await?;
    Ok(fires.len())
}

/// Loads due, unfired fires grouped under their events, capped per tick.
pub async fn load_due_fires(
    db: impl sqlx::PgExecutor<'_>,
    limit: i64,
) -> Result<Vec<EventFire>> {
    let fires = sqlx::query_as::<_, EventFire>(
        r#"
        SELECT id, event_id, contact_id, scheduled, fired
          FROM event_fires
         WHERE fired IS NULL AND scheduled <= NOW()
         ORDER BY scheduled
         LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(fires)
}

/// Loads specific fires by id, skipping any already fired by another
/// worker.
pub async fn load_fires(
    db: impl sqlx::PgExecutor<'_>,
    fire_ids: &[EventFireId],
) -> Result<Vec<EventFire>> {
    let fires = sqlx::query_as::<_, EventFire>(
        "SELECT id, event_id, contact_id, scheduled, fired FROM event_fires WHERE id = ANY($1) AND fired IS NULL",
    )
    .bind(fire_ids)
    .fetch_all(db)
    .await?;
    Ok(fires)
}

/// Marks fires handled.
pub async fn mark_fires_fired(
    db: impl sqlx::PgExecutor<'_>,
    fire_ids: &[EventFireId],
) -> Result<()> {
    if fire_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE event_fires SET fired = NOW() WHERE id = ANY($1)")
        .bind(fire_ids)
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    fn event(offset: i32, unit: &str, delivery_hour: i32) -> CampaignEvent {
        CampaignEvent {
            id: 1,
            uuid: Uuid::new_v4(),
            campaign_id: 1,
            flow_id: 1,
            relative_to_id: Some(1),
            relative_to_key: None,
            offset_amount: offset,
            offset_unit: unit.to_string(),
            delivery_hour,
            is_active: true,
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn fire_time_with_delivery_hour_honors_dst() {
        // +5 days at 12:00 local in Pacific time
        let event = event(5, "D", 12);

        // joined 2030-01-01T00:00Z is 2029-12-31 16:00 PST; five days on is
        // Jan 5th, and noon PST is 20:00 UTC
        let fire = event.fire_time(Los_Angeles, utc("2030-01-01T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2030-01-05T20:00:00Z"));

        // in August the org is on PDT so noon is 19:00 UTC
        let fire = event.fire_time(Los_Angeles, utc("2030-08-18T11:31:30Z")).unwrap();
        assert_eq!(fire, utc("2030-08-23T19:00:00Z"));
    }

    #[test]
    fn fire_time_without_delivery_hour() {
        let event1 = event(10, "M", -1);
        let fire = event1.fire_time(Los_Angeles, utc("2030-01-01T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2030-01-01T00:10:00Z"));

        let event2 = event(1, "D", -1);
        let fire = event2.fire_time(Los_Angeles, utc("2040-01-01T00:00:00Z")).unwrap();
        assert_eq!(fire, utc("2040-01-02T00:00:00Z"));
    }

    #[test]
    fn fire_time_weeks_and_hours() {
        let event1 = event(2, "W", -1);
        let fire = event1.fire_time(chrono_tz::UTC, utc("2030-01-01T08:30:00Z")).unwrap();
        assert_eq!(fire, utc("2030-01-15T08:30:00Z"));

        let event2 = event(-3, "H", -1);
        let fire = event2.fire_time(chrono_tz::UTC, utc("2030-01-01T08:30:00Z")).unwrap();
        assert_eq!(fire, utc("2030-01-01T05:30:00Z"));
    }

    #[test]
    fn unknown_unit_errors() {
        let event = event(1, "Y", -1);
        assert!(event.fire_time(chrono_tz::UTC, utc("2030-01-01T00:00:00Z")).is_err());
    }
}

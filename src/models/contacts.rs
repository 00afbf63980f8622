//! Contacts and the bulk mutations the commit hooks apply to them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

use super::fields::FieldValue;
use super::urns::{self, Urn};
use super::{ContactId, GroupId, OrgId};

/// Contact status, stored as a single char column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    Blocked,
    Stopped,
    Archived,
}

impl ContactStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ContactStatus::Active => "A",
            ContactStatus::Blocked => "B",
            ContactStatus::Stopped => "S",
            ContactStatus::Archived => "V",
        }
    }

    pub fn from_code(code: &str) -> Result<ContactStatus> {
        match code {
            "A" => Ok(ContactStatus::Active),
            "B" => Ok(ContactStatus::Blocked),
            "S" => Ok(ContactStatus::Stopped),
            "V" => Ok(ContactStatus::Archived),
            other => Err(FlowhubError::Validation(format!(
                "unknown contact status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    pub timezone: Option<String>,
    pub created_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub urns: Vec<Urn>,
    pub fields: HashMap<Uuid, FieldValue>,
    pub group_ids: Vec<GroupId>,
}

#[derive(FromRow)]
struct ContactRow {
    id: ContactId,
    uuid: Uuid,
    org_id: OrgId,
    name: Option<String>,
    language: Option<String>,
    status: String,
    timezone: Option<String>,
    created_on: DateTime<Utc>,
    last_seen_on: Option<DateTime<Utc>>,
    fields: Option<serde_json::Value>,
}

impl Contact {
    /// Whether this contact currently owns a URN matching the raw string,
    /// compared by normalized identity.
    pub fn has_urn(&self, raw: &str) -> bool {
        self.urns.iter().any(|u| u.matches(raw))
    }

    /// The contact's highest priority URN, if any.
    pub fn preferred_urn(&self) -> Option<&Urn> {
        self.urns.first()
    }

    /// Loads the passed in contacts with their URNs, field values and group
    /// memberships in three round trips.
    pub async fn load(
        db: &mut sqlx::PgConnection,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<Contact>> {
        let rows = sqlx::query_as::<_, ContactRow>(
            r#"
            SELECT id, uuid, org_id, name, language, status, timezone, created_on, last_seen_on, fields
              FROM contacts
             WHERE org_id = $1 AND id = ANY($2) AND is_active = TRUE
            "#,
        )
        .bind(org_id)
        .bind(contact_ids)
        .fetch_all(&mut *db)
        .await?;

        let urn_rows = urns::load_for_contacts(&mut *db, org_id, contact_ids).await?;
        let mut urns_by_contact: HashMap<ContactId, Vec<Urn>> = HashMap::new();
        for row in urn_rows {
            if let Some(contact_id) = row.contact_id {
                let mut urn = Urn::new(&row.scheme, &row.path);
                urn.display = row.display;
                urn.auth = row.auth;
                urn.channel_id = row.channel_id;
                urns_by_contact.entry(contact_id).or_default().push(urn);
            }
        }

        let membership_rows = sqlx::query(
            "SELECT contact_id, group_id FROM contact_group_members WHERE contact_id = ANY($1)",
        )
        .bind(contact_ids)
        .fetch_all(&mut *db)
        .await?;
        let mut groups_by_contact: HashMap<ContactId, Vec<GroupId>> = HashMap::new();
        for row in membership_rows {
            let contact_id: ContactId = row.get("contact_id");
            let group_id: GroupId = row.get("group_id");
            groups_by_contact.entry(contact_id).or_default().push(group_id);
        }

        let mut contacts = Vec::with_capacity(rows.len());
        for row in rows {
            let fields = match row.fields {
                Some(value) => serde_json::from_value(value)?,
                None => HashMap::new(),
            };
            contacts.push(Contact {
                id: row.id,
                uuid: row.uuid,
                org_id: row.org_id,
                name: row.name,
                language: row.language,
                status: ContactStatus::from_code(&row.status)?,
                timezone: row.timezone,
                created_on: row.created_on,
                last_seen_on: row.last_seen_on,
                urns: urns_by_contact.remove(&row.id).unwrap_or_default(),
                fields,
                group_ids: groups_by_contact.remove(&row.id).unwrap_or_default(),
            });
        }

        Ok(contacts)
    }

    /// Creates a brand new active contact, optionally claiming the passed
    /// in URNs.
    pub async fn create(
        db: &mut sqlx::PgConnection,
        org_id: OrgId,
        uuid: Uuid,
        name: Option<&str>,
        language: Option<&str>,
        contact_urns: &[Urn],
    ) -> Result<Contact> {
        let row = sqlx::query(
            r#"
            INSERT INTO contacts(org_id, uuid, name, language, status, is_active, created_on, modified_on)
            VALUES($1, $2, $3, $4, 'A', TRUE, NOW(), NOW())
            RETURNING id, created_on
            "#,
        )
        .bind(org_id)
        .bind(uuid)
        .bind(name)
        .bind(language)
        .fetch_one(&mut *db)
        .await?;
        let id: ContactId = row.get("id");
        let created_on: DateTime<Utc> = row.get("created_on");

        urns::set_contact_urns(&mut *db, org_id, id, contact_urns).await?;

        Ok(Contact {
            id,
            uuid,
            org_id,
            name: name.map(String::from),
            language: language.map(String::from),
            status: ContactStatus::Active,
            timezone: None,
            created_on,
            last_seen_on: None,
            urns: contact_urns.to_vec(),
            fields: HashMap::new(),
            group_ids: Vec::new(),
        })
    }

    /// Resolves a contact by URN identity, creating one if no contact owns
    /// it yet. Used by surveyor submissions and channel events.
    pub async fn resolve_by_urn(
        db: &mut sqlx::PgConnection,
        org_id: OrgId,
        urn: &Urn,
        uuid: Uuid,
    ) -> Result<(ContactId, bool)> {
        if let Some(contact_id) = urns::contact_for_identity(&mut *db, org_id, &urn.identity()).await? {
            return Ok((contact_id, false));
        }

        let contact = Contact::create(db, org_id, uuid, None, None, std::slice::from_ref(urn)).await?;
        Ok((contact.id, true))
    }
}

/// One (contact, name) pair for the bulk name update.
#[derive(Debug, Clone)]
pub struct NameUpdate {
    pub contact_id: ContactId,
    pub name: String,
}

/// Applies name updates in one statement. Names are truncated to the
/// column limit of 128.
pub async fn update_names(db: impl sqlx::PgExecutor<'_>, updates: &[NameUpdate]) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<ContactId> = updates.iter().map(|u| u.contact_id).collect();
    let names: Vec<String> = updates
        .iter()
        .map(|u| u.name.chars().take(128).collect())
        .collect();

    sqlx::query(
        r#"
        UPDATE contacts c
           SET name = r.name, modified_on = NOW()
          FROM UNNEST($1::bigint[], $2::text[]) AS r(id, name)
         WHERE c.id = r.id
        "#,
    )
    .bind(&ids)
    .bind(&names)
    .execute(db)
    .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct LanguageUpdate {
    pub contact_id: ContactId,
    pub language: String,
}

pub async fn update_languages(
    db: impl sqlx::PgExecutor<'_>,
    updates: &[LanguageUpdate],
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<ContactId> = updates.iter().map(|u| u.contact_id).collect();
    let languages: Vec<String> = updates.iter().map(|u| u.language.clone()).collect();

    sqlx::query(
        r#"
        UPDATE contacts c
           SET language = r.language, modified_on = NOW()
          FROM UNNEST($1::bigint[], $2::text[]) AS r(id, language)
         WHERE c.id = r.id
        "#,
    )
    .bind(&ids)
    .bind(&languages)
    .execute(db)
    .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub contact_id: ContactId,
    pub status: ContactStatus,
}

pub async fn update_statuses(
    db: impl sqlx::PgExecutor<'_>,
    updates: &[StatusUpdate],
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<ContactId> = updates.iter().map(|u| u.contact_id).collect();
    let statuses: Vec<&str> = updates.iter().map(|u| u.status.code()).collect();

    sqlx::query(
        r#"
        UPDATE contacts c
           SET status = r.status, modified_on = NOW()
          FROM UNNEST($1::bigint[], $2::text[]) AS r(id, status)
         WHERE c.id = r.id
        "#,
    )
    .bind(&ids)
    .bind(&statuses)
    .execute(db)
    .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct TimezoneUpdate {
    pub contact_id: ContactId,
    pub timezone: Option<String>,
}

pub async fn update_timezones(
    db: impl sqlx::PgExecutor<'_>,
    updates: &[TimezoneUpdate],
) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let ids: Vec<ContactId> = updates.iter().map(|u| u.contact_id).collect();
    let timezones: Vec<Option<String>> = updates.iter().map(|u| u.timezone.clone()).collect();

    sqlx::query(
        r#"
        UPDATE contacts c
           SET timezone = r.timezone, modified_on = NOW()
          FROM UNNEST($1::bigint[], $2::text[]) AS r(id, timezone)
         WHERE c.id = r.id
        "#,
    )
    .bind(&ids)
    .bind(&timezones)
    .execute(db)
    .await?;

    Ok(())
}

/// One field mutation: a value set or cleared for a contact.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub contact_id: ContactId,
    pub field_uuid: Uuid,
    pub value: Option<FieldValue>,
}

/// Applies field updates: sets merge into the JSON column, clears remove
/// the key. One statement per kind.
pub async fn update_fields(db: &mut sqlx::PgConnection, updates: &[FieldUpdate]) -> Result<()> {
    let mut set_ids = Vec::new();
    let mut set_values = Vec::new();
    let mut clear_ids = Vec::new();
    let mut clear_keys = Vec::new();

    for update in updates {
        match &update.value {
            Some(value) => {
                set_ids.push(update.contact_id);
                set_values.push(serde_json::json!({ update.field_uuid.to_string(): value }));
            }
            None => {
                clear_ids.push(update.contact_id);
                clear_keys.push(update.field_uuid.to_string());
            }
        }
    }

    if !set_ids.is_empty() {
        sqlx::query(
            r#"
            UPDATE contacts c
               SET fields = COALESCE(c.fields, '{}'::jsonb) || r.value, modified_on = NOW()
              FROM UNNEST($1::bigint[], $2::jsonb[]) AS r(id, value)
             WHERE c.id = r.id
            "#,
        )
        .bind(&set_ids)
        .bind(&set_values)
        .execute(&mut *db)
        .await?;
    }

    if !clear_ids.is_empty() {
        sqlx::query(
            r#"
            UPDATE contacts c
               SET fields = c.fields - r.key, modified_on = NOW()
              FROM UNNEST($1::bigint[], $2::text[]) AS r(id, key)
             WHERE c.id = r.id
            "#,
        )
        .bind(&clear_ids)
        .bind(&clear_keys)
        .execute(&mut *db)
        .await?;
    }

    Ok(())
}

/// Bumps modified_on for the passed in contacts so downstream syncs pick
/// them up.
pub async fn mark_modified(db: impl sqlx::PgExecutor<'_>, contact_ids: &[ContactId]) -> Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE contacts SET modified_on = NOW() WHERE id = ANY($1)")
        .bind(contact_ids)
        .execute(db)
        .await?;
    Ok(())
}

/// Updates last_seen_on for contacts that sent us something this sprint.
pub async fn update_last_seen(
    db: impl sqlx::PgExecutor<'_>,
    contact_ids: &[ContactId],
    seen_on: DateTime<Utc>,
) -> Result<()> {
    if contact_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE contacts SET last_seen_on = $2, modified_on = NOW() WHERE id = ANY($1)")
        .bind(contact_ids)
        .bind(seen_on)
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            ContactStatus::Active,
            ContactStatus::Blocked,
            ContactStatus::Stopped,
            ContactStatus::Archived,
        ] {
            assert_eq!(ContactStatus::from_code(status.code()).unwrap(), status);
        }
        assert_eq!(ContactStatus::Blocked.code(), "B");
        assert_eq!(ContactStatus::Stopped.code(), "S");
        assert!(ContactStatus::from_code("Z").is_err());
    }

    #[test]
    fn has_urn_uses_normalized_identity() {
        let contact = Contact {
            id: 1,
            uuid: Uuid::new_v4(),
            org_id: 1,
            name: Some("Cathy".to_string()),
            language: None,
            status: ContactStatus::Active,
            timezone: None,
            created_on: Utc::now(),
            last_seen_on: None,
            urns: vec![Urn::parse("tel:+12024561111?channel=4").unwrap()],
            fields: HashMap::new(),
            group_ids: vec![],
        };

        assert!(contact.has_urn("tel:+120-2456-1111"));
        assert!(!contact.has_urn("tel:+15551112222"));
        assert_eq!(contact.preferred_urn().unwrap().identity(), "tel:+12024561111");
    }
}

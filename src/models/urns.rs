//! Contact URNs: canonical addresses like `tel:+12065551212`.
//!
//! A URN belongs to at most one contact at a time and is identified by its
//! normalized `scheme:path` pair. Priority orders the URNs within a
//! contact, lower index first.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{FlowhubError, Result};

use super::{ChannelId, ContactId, OrgId};

pub const SCHEME_TEL: &str = "tel";
pub const SCHEME_TWITTER: &str = "twitter";
pub const SCHEME_WHATSAPP: &str = "whatsapp";
pub const SCHEME_FACEBOOK: &str = "facebook";
pub const SCHEME_TELEGRAM: &str = "telegram";
pub const SCHEME_EMAIL: &str = "mailto";

/// Priority assigned to the first URN of a contact; subsequent URNs step
/// down from here.
pub const TOP_PRIORITY: i32 = 1000;

/// A parsed URN. `display` and `auth` ride along as query-style extras and
/// are excluded from identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urn {
    pub scheme: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

impl Urn {
    pub fn new(scheme: &str, path: &str) -> Urn {
        Urn {
            scheme: scheme.to_string(),
            path: path.to_string(),
            display: None,
            auth: None,
            channel_id: None,
        }
    }

    /// Parses a URN string of the form `scheme:path[?query]`, normalizing
    /// scheme case and tel punctuation.
    pub fn parse(raw: &str) -> Result<Urn> {
        let (head, query) = match raw.split_once('?') {
            Some((h, q)) => (h, Some(q)),
            None => (raw, None),
        };

        let (scheme, path) = head
            .split_once(':')
            .ok_or_else(|| FlowhubError::Validation(format!("invalid URN: {raw}")))?;
        if scheme.is_empty() || path.is_empty() {
            return Err(FlowhubError::Validation(format!("invalid URN: {raw}")));
        }

        let mut urn = Urn::new(&scheme.to_lowercase(), path);
        urn.path = normalize_path(&urn.scheme, path);

        if let Some(query) = query {
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("channel", v)) => urn.channel_id = v.parse().ok(),
                    Some(("display", v)) => urn.display = Some(v.to_string()),
                    Some(("auth", v)) => urn.auth = Some(v.to_string()),
                    _ => {}
                }
            }
        }

        Ok(urn)
    }

    /// The canonical identity string, `scheme:path`. Two URNs are the same
    /// address iff their identities are equal.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }

    /// Whether this URN addresses the same endpoint as the raw string,
    /// comparing normalized identities.
    pub fn matches(&self, raw: &str) -> bool {
        Urn::parse(raw).map(|u| u.identity() == self.identity()).unwrap_or(false)
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identity())
    }
}

/// Normalizes a URN path for its scheme. Tel paths lose their visual
/// punctuation, keeping only digits and a leading `+`; handle-style schemes
/// are lowercased and lose a leading `@`.
fn normalize_path(scheme: &str, path: &str) -> String {
    match scheme {
        SCHEME_TEL => {
            let mut normalized = String::with_capacity(path.len());
            for (i, c) in path.trim().chars().enumerate() {
                if c.is_ascii_digit() || (c == '+' && i == 0) {
                    normalized.push(c);
                }
            }
            normalized
        }
        SCHEME_TWITTER | SCHEME_TELEGRAM => {
            path.trim().trim_start_matches('@').to_lowercase()
        }
        SCHEME_EMAIL => path.trim().to_lowercase(),
        _ => path.trim().to_string(),
    }
}

/// A row in `contact_urns`.
#[derive(Debug, Clone, FromRow)]
pub struct ContactUrn {
    pub id: i64,
    pub org_id: OrgId,
    pub contact_id: Option<ContactId>,
    pub identity: String,
    pub scheme: String,
    pub path: String,
    pub display: Option<String>,
    pub auth: Option<String>,
    pub priority: i32,
    pub channel_id: Option<ChannelId>,
}

/// Loads the URNs owned by each of the passed in contacts, ordered by
/// descending priority.
pub async fn load_for_contacts(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    contact_ids: &[ContactId],
) -> Result<Vec<ContactUrn>> {
    let rows = sqlx::query_as::<_, ContactUrn>(
        r#"
        SELECT id, org_id, contact_id, identity, scheme, path, display, auth, priority, channel_id
          FROM contact_urns
         WHERE org_id = $1 AND contact_id = ANY($2)
         ORDER BY contact_id, priority DESC, id
        "#,
    )
    .bind(org_id)
    .bind(contact_ids)
    .fetch_all(db)
    .await?;

    Ok(rows)
}

/// Looks up the contact currently owning the URN identity, if any.
pub async fn contact_for_identity(
    db: impl sqlx::PgExecutor<'_>,
    org_id: OrgId,
    identity: &str,
) -> Result<Option<ContactId>> {
    let row: Option<(Option<ContactId>,)> = sqlx::query_as(
        "SELECT contact_id FROM contact_urns WHERE org_id = $1 AND identity = $2",
    )
    .bind(org_id)
    .bind(identity)
    .fetch_optional(db)
    .await?;

    Ok(row.and_then(|r| r.0))
}

/// Replaces the full URN set of a contact: inserts or claims rows for the
/// new list, reassigns priorities by position, and orphans rows no longer
/// present. Claiming moves a URN from whichever contact owned it before.
pub async fn set_contact_urns(
    db: &mut sqlx::PgConnection,
    org_id: OrgId,
    contact_id: ContactId,
    urns: &[Urn],
) -> Result<()> {
    let identities: Vec<String> = urns.iter().map(|u| u.identity()).collect();

    sqlx::query(
        "UPDATE contact_urns SET contact_id = NULL, priority = 0 WHERE org_id = $1 AND contact_id = $2 AND identity != ALL($3)",
    )
    .bind(org_id)
    .bind(contact_id)
    .bind(&identities)
    .execute(&mut *db)
    .await?;

    for (i, urn) in urns.iter().enumerate() {
        let priority = TOP_PRIORITY - i as i32;
        sqlx::query(
            r#"
            INSERT INTO contact_urns(org_id, contact_id, identity, scheme, path, display, auth, priority, channel_id)
            VALUES($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(org_id, identity)
            DO UPDATE SET contact_id = EXCLUDED.contact_id, priority = EXCLUDED.priority,
                          display = EXCLUDED.display, auth = COALESCE(EXCLUDED.auth, contact_urns.auth),
                          channel_id = EXCLUDED.channel_id
            "#,
        )
        .bind(org_id)
        .bind(contact_id)
        .bind(urn.identity())
        .bind(&urn.scheme)
        .bind(&urn.path)
        .bind(&urn.display)
        .bind(&urn.auth)
        .bind(priority)
        .bind(urn.channel_id)
        .execute(&mut *db)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_identity() {
        let urn = Urn::parse("tel:+12024561111?channel=4").unwrap();
        assert_eq!(urn.scheme, "tel");
        assert_eq!(urn.path, "+12024561111");
        assert_eq!(urn.channel_id, Some(4));
        assert_eq!(urn.identity(), "tel:+12024561111");

        let urn = Urn::parse("Twitter:@Bobby").unwrap();
        assert_eq!(urn.identity(), "twitter:bobby");

        assert!(Urn::parse("notaurn").is_err());
        assert!(Urn::parse("tel:").is_err());
    }

    #[test]
    fn tel_normalization_matches_punctuated_forms() {
        let urn = Urn::parse("tel:+12024561111?channel=6934a34a-1a37-4a16-a692-9076713b8f79").unwrap();
        assert!(urn.matches("tel:+120-2456-1111"));
        assert!(urn.matches("tel:+1 (202) 456 1111"));
        assert!(!urn.matches("tel:+12024561112"));
        assert!(!urn.matches("whatsapp:+12024561111"));
    }

    #[test]
    fn display_and_auth_ride_along() {
        let urn = Urn::parse("facebook:12345?display=Bob&auth=zz7").unwrap();
        assert_eq!(urn.display.as_deref(), Some("Bob"));
        assert_eq!(urn.auth.as_deref(), Some("zz7"));
        // neither is part of identity
        assert_eq!(urn.identity(), "facebook:12345");
    }
}

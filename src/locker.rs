//! Named advisory locks with TTL and owner tokens.
//!
//! Locks serialize campaign event scheduling, flow start batching,
//! per-contact sprints and leader-only crons. Every lock expires on its
//! own so a crashed holder can't wedge the system, and release checks the
//! token so a holder that lost its lock to expiry can't free the next
//! holder's.

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::PgPool;

use crate::error::{FlowhubError, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Generates a fresh owner token.
fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Tries to take the named lock for `ttl`, retrying until `wait` elapses.
/// Returns the owner token needed to release or extend it.
pub async fn acquire(db: &PgPool, name: &str, ttl: Duration, wait: Duration) -> Result<String> {
    let token = new_token();
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        if try_acquire(db, name, &token, ttl).await? {
            return Ok(token);
        }
        if tokio::time::Instant::now() + RETRY_INTERVAL > deadline {
            return Err(FlowhubError::LockNotAcquired(name.to_string()));
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Single attempt at the named lock: succeeds when the row is absent or
/// its previous holder has expired.
pub async fn try_acquire(db: &PgPool, name: &str, token: &str, ttl: Duration) -> Result<bool> {
    let ttl_secs = ttl.as_secs_f64();
    let result = sqlx::query(
        r#"
        INSERT INTO locks(name, token, expires_on) VALUES($1, $2, NOW() + $3 * INTERVAL '1 second')
        ON CONFLICT (name) DO UPDATE
           SET token = EXCLUDED.token, expires_on = EXCLUDED.expires_on
         WHERE locks.expires_on <= NOW()
        "#,
    )
    .bind(name)
    .bind(token)
    .bind(ttl_secs)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// One-shot acquire for callers that skip their work when the lock is
/// held, e.g. leader-only crons.
pub async fn try_acquire_once(db: &PgPool, name: &str, ttl: Duration) -> Result<Option<String>> {
    let token = new_token();
    if try_acquire(db, name, &token, ttl).await? {
        Ok(Some(token))
    } else {
        Ok(None)
    }
}

/// Releases the named lock if the token still owns it; otherwise a no-op.
pub async fn release(db: &PgPool, name: &str, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM locks WHERE name = $1 AND token = $2")
        .bind(name)
        .bind(token)
        .execute(db)
        .await?;
    Ok(())
}

/// Pushes out the expiry of a held lock; fails if the token no longer owns
/// it.
pub async fn extend(db: &PgPool, name: &str, token: &str, ttl: Duration) -> Result<()> {
    let result = sqlx::query(
        "UPDATE locks SET expires_on = NOW() + $3 * INTERVAL '1 second' WHERE name = $1 AND token = $2",
    )
    .bind(name)
    .bind(token)
    .bind(ttl.as_secs_f64())
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(FlowhubError::LockNotAcquired(name.to_string()));
    }
    Ok(())
}

/// The lock name serializing sprints for one contact.
pub fn contact_lock_name(org_id: crate::models::OrgId, contact_id: crate::models::ContactId) -> String {
    format!("c:{org_id}:{contact_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_sized() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 10);
        assert_ne!(a, b);
    }

    #[test]
    fn contact_lock_names_scope_by_org() {
        assert_eq!(contact_lock_name(1, 42), "c:1:42");
        assert_ne!(contact_lock_name(1, 42), contact_lock_name(2, 42));
    }
}

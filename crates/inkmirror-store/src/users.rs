//! User, subscription, and agent-token repository
//!
//! Users are created on first authentication and removed only by explicit
//! deletion, which cascades to every owned row. Long-lived agent tokens are
//! stored as SHA-256 hashes; the raw token exists only on the device.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use inkmirror_core::domain::newtypes::UserId;
use inkmirror_core::domain::Tier;

use crate::time::{fmt_ts, parse_ts};
use crate::StoreError;

/// Lifetime of an agent token (about 30 days)
pub const AGENT_TOKEN_TTL_DAYS: i64 = 30;

/// A user row joined with its subscription
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// Internal identifier
    pub id: UserId,
    /// Identity from the OAuth provider
    pub external_auth_id: String,
    /// Subscription tier
    pub tier: Tier,
    /// Current billing period start
    pub period_start: DateTime<Utc>,
    /// Current billing period end
    pub period_end: DateTime<Utc>,
}

/// Repository for users, subscriptions, and agent tokens
pub struct UserRepository {
    pool: SqlitePool,
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

impl UserRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Finds a user by external auth id, creating the user and a default
    /// free-tier subscription on first sight
    pub async fn find_or_create(&self, external_auth_id: &str) -> Result<UserRecord, StoreError> {
        if let Some(user) = self.get_by_auth_id(external_auth_id).await? {
            return Ok(user);
        }

        let id = UserId::new();
        let now = Utc::now();
        let period_end = now + Duration::days(30);

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO users (id, external_auth_id, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(external_auth_id)
            .bind(fmt_ts(now))
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO subscriptions (user_id, tier, period_start, period_end) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(Tier::Free.as_str())
        .bind(fmt_ts(now))
        .bind(fmt_ts(period_end))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = %id, "Created user with free subscription");

        Ok(UserRecord {
            id,
            external_auth_id: external_auth_id.to_string(),
            tier: Tier::Free,
            period_start: now,
            period_end,
        })
    }

    /// Looks up a user by external auth id
    pub async fn get_by_auth_id(
        &self,
        external_auth_id: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT u.id, u.external_auth_id, s.tier, s.period_start, s.period_end \
             FROM users u JOIN subscriptions s ON s.user_id = u.id \
             WHERE u.external_auth_id = ?",
        )
        .bind(external_auth_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::map_user(&r)).transpose()
    }

    /// Looks up a user by id
    pub async fn get(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT u.id, u.external_auth_id, s.tier, s.period_start, s.period_end \
             FROM users u JOIN subscriptions s ON s.user_id = u.id \
             WHERE u.id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::map_user(&r)).transpose()
    }

    /// Changes a user's subscription tier, resetting the billing period
    pub async fn set_tier(&self, id: &UserId, tier: Tier) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE subscriptions SET tier = ?, period_start = ?, period_end = ? \
             WHERE user_id = ?",
        )
        .bind(tier.as_str())
        .bind(fmt_ts(now))
        .bind(fmt_ts(now + Duration::days(30)))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("subscription for {id}")));
        }
        Ok(())
    }

    /// Deletes a user; every owned row cascades
    pub async fn delete(&self, id: &UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- agent tokens ---

    /// Stores a new agent token for a user, returning its expiry
    ///
    /// Only the SHA-256 hash of `token` is persisted.
    pub async fn store_agent_token(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let expires_at = now + Duration::days(AGENT_TOKEN_TTL_DAYS);
        sqlx::query(
            "INSERT INTO agent_tokens (token_hash, user_id, created_at, expires_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(hash_token(token))
        .bind(user_id.to_string())
        .bind(fmt_ts(now))
        .bind(fmt_ts(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(expires_at)
    }

    /// Resolves a presented agent token to its user, if valid and unexpired
    pub async fn resolve_agent_token(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id FROM agent_tokens WHERE token_hash = ? AND expires_at > ?",
        )
        .bind(hash_token(token))
        .bind(fmt_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let id: String = r.try_get("user_id")?;
            UserId::from_str(&id).map_err(StoreError::from)
        })
        .transpose()
    }

    /// Removes expired tokens; returns the number pruned
    pub async fn prune_expired_tokens(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM agent_tokens WHERE expires_at <= ?")
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn map_user(row: &sqlx::sqlite::SqliteRow) -> Result<UserRecord, StoreError> {
        let id: String = row.try_get("id")?;
        let external_auth_id: String = row.try_get("external_auth_id")?;
        let tier: String = row.try_get("tier")?;
        let period_start: String = row.try_get("period_start")?;
        let period_end: String = row.try_get("period_end")?;
        Ok(UserRecord {
            id: UserId::from_str(&id)?,
            external_auth_id,
            tier: Tier::parse(&tier)?,
            period_start: parse_ts(&period_start)?,
            period_end: parse_ts(&period_end)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabasePool;

    async fn repo() -> UserRepository {
        let db = DatabasePool::in_memory().await.unwrap();
        UserRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_find_or_create_idempotent() {
        let repo = repo().await;
        let a = repo.find_or_create("oauth|alice").await.unwrap();
        let b = repo.find_or_create("oauth|alice").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.tier, Tier::Free);
    }

    #[tokio::test]
    async fn test_set_tier() {
        let repo = repo().await;
        let user = repo.find_or_create("oauth|bob").await.unwrap();
        repo.set_tier(&user.id, Tier::Pro).await.unwrap();
        let reloaded = repo.get(&user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.tier, Tier::Pro);
    }

    #[tokio::test]
    async fn test_set_tier_missing_user() {
        let repo = repo().await;
        let err = repo.set_tier(&UserId::new(), Tier::Pro).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_agent_token_roundtrip() {
        let repo = repo().await;
        let user = repo.find_or_create("oauth|carol").await.unwrap();
        repo.store_agent_token(&user.id, "tok_secret").await.unwrap();

        let resolved = repo.resolve_agent_token("tok_secret").await.unwrap();
        assert_eq!(resolved, Some(user.id));

        // Wrong token does not resolve
        assert!(repo.resolve_agent_token("tok_other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_tokens() {
        let repo = repo().await;
        let user = repo.find_or_create("oauth|dave").await.unwrap();
        repo.store_agent_token(&user.id, "tok_dave").await.unwrap();
        repo.delete(&user.id).await.unwrap();
        assert!(repo.resolve_agent_token("tok_dave").await.unwrap().is_none());
        assert!(repo.get(&user.id).await.unwrap().is_none());
    }
}

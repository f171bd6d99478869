//! Integration config repository
//!
//! Destination credentials and settings per (user, destination). Only the
//! AES-256-GCM ciphertext and the per-user salt are persisted; decryption
//! happens in the destinations crate with a key derived from the server
//! master secret.

use std::str::FromStr;

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use inkmirror_core::domain::newtypes::{DestinationName, UserId};
use inkmirror_core::domain::IntegrationConfig;

use crate::time::{fmt_ts, parse_ts_opt};
use crate::StoreError;

/// Repository for integration configs
pub struct IntegrationRepository {
    pool: SqlitePool,
}

impl IntegrationRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a destination config
    pub async fn upsert(&self, config: &IntegrationConfig) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO integration_configs \
             (user_id, destination, enabled, encrypted_credentials, salt, last_synced_at, \
              sync_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (user_id, destination) DO UPDATE SET \
             enabled = excluded.enabled, \
             encrypted_credentials = excluded.encrypted_credentials, \
             salt = excluded.salt",
        )
        .bind(config.user_id.to_string())
        .bind(config.destination.as_str())
        .bind(config.enabled)
        .bind(&config.encrypted_credentials)
        .bind(&config.salt)
        .bind(config.last_synced_at.map(fmt_ts))
        .bind(config.sync_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches one destination config
    pub async fn get(
        &self,
        user_id: &UserId,
        destination: &DestinationName,
    ) -> Result<Option<IntegrationConfig>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM integration_configs WHERE user_id = ? AND destination = ?",
        )
        .bind(user_id.to_string())
        .bind(destination.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::map_config(&r)).transpose()
    }

    /// Lists a user's enabled destinations
    pub async fn list_enabled(&self, user_id: &UserId) -> Result<Vec<IntegrationConfig>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM integration_configs WHERE user_id = ? AND enabled = 1 \
             ORDER BY destination",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_config).collect()
    }

    /// Enables or disables a destination
    pub async fn set_enabled(
        &self,
        user_id: &UserId,
        destination: &DestinationName,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE integration_configs SET enabled = ? WHERE user_id = ? AND destination = ?",
        )
        .bind(enabled)
        .bind(user_id.to_string())
        .bind(destination.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "integration config for {destination}"
            )));
        }
        Ok(())
    }

    /// Records a successful sync touch (timestamp + usage counter)
    pub async fn record_sync(
        &self,
        user_id: &UserId,
        destination: &DestinationName,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE integration_configs SET last_synced_at = ?, sync_count = sync_count + 1 \
             WHERE user_id = ? AND destination = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(user_id.to_string())
        .bind(destination.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn map_config(row: &sqlx::sqlite::SqliteRow) -> Result<IntegrationConfig, StoreError> {
        let user_id: String = row.try_get("user_id")?;
        let destination: String = row.try_get("destination")?;
        let enabled: bool = row.try_get("enabled")?;
        let encrypted_credentials: Vec<u8> = row.try_get("encrypted_credentials")?;
        let salt: Vec<u8> = row.try_get("salt")?;
        let last_synced_at: Option<String> = row.try_get("last_synced_at")?;
        let sync_count: i64 = row.try_get("sync_count")?;

        Ok(IntegrationConfig {
            user_id: UserId::from_str(&user_id)?,
            destination: DestinationName::new(destination)?,
            enabled,
            encrypted_credentials,
            salt,
            last_synced_at: parse_ts_opt(last_synced_at.as_deref())?,
            sync_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepository;
    use crate::DatabasePool;

    async fn setup() -> (IntegrationRepository, UserId) {
        let db = DatabasePool::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let user = users.find_or_create("oauth|integrations").await.unwrap();
        (IntegrationRepository::new(db.pool().clone()), user.id)
    }

    fn dest() -> DestinationName {
        DestinationName::new("notion").unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (repo, user) = setup().await;
        let config = IntegrationConfig::new(user, dest(), vec![0xAA; 48], vec![0x01; 16]);
        repo.upsert(&config).await.unwrap();

        let loaded = repo.get(&user, &dest()).await.unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.encrypted_credentials, vec![0xAA; 48]);
        assert_eq!(loaded.salt, vec![0x01; 16]);
    }

    #[tokio::test]
    async fn test_list_enabled_filters_disabled() {
        let (repo, user) = setup().await;
        repo.upsert(&IntegrationConfig::new(user, dest(), vec![1], vec![2]))
            .await
            .unwrap();
        let obsidian = DestinationName::new("obsidian").unwrap();
        repo.upsert(&IntegrationConfig::new(user, obsidian.clone(), vec![1], vec![2]))
            .await
            .unwrap();
        repo.set_enabled(&user, &obsidian, false).await.unwrap();

        let enabled = repo.list_enabled(&user).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].destination, dest());
    }

    #[tokio::test]
    async fn test_record_sync_increments_usage() {
        let (repo, user) = setup().await;
        repo.upsert(&IntegrationConfig::new(user, dest(), vec![1], vec![2]))
            .await
            .unwrap();
        repo.record_sync(&user, &dest()).await.unwrap();
        repo.record_sync(&user, &dest()).await.unwrap();

        let loaded = repo.get(&user, &dest()).await.unwrap().unwrap();
        assert_eq!(loaded.sync_count, 2);
        assert!(loaded.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_set_enabled_missing_row() {
        let (repo, user) = setup().await;
        let err = repo.set_enabled(&user, &dest(), false).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}

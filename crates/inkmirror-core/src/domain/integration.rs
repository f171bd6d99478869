//! IntegrationConfig domain entity
//!
//! Per-(user, destination) credentials and settings. Credentials are held
//! only as an encrypted blob; decryption happens in the destinations crate
//! with a key derived from the server master secret and the user salt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{DestinationName, UserId};

/// Destination credentials and settings for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Owning user
    pub user_id: UserId,
    /// Which destination these credentials are for
    pub destination: DestinationName,
    /// Whether syncs to this destination are active
    pub enabled: bool,
    /// AES-256-GCM ciphertext of the credential JSON (nonce-prefixed)
    pub encrypted_credentials: Vec<u8>,
    /// Per-user salt fed into key derivation
    pub salt: Vec<u8>,
    /// When a sync last touched this destination
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Count of successful syncs (usage accounting)
    pub sync_count: i64,
}

impl IntegrationConfig {
    /// Creates an enabled config from already-encrypted credentials
    pub fn new(
        user_id: UserId,
        destination: DestinationName,
        encrypted_credentials: Vec<u8>,
        salt: Vec<u8>,
    ) -> Self {
        Self {
            user_id,
            destination,
            enabled: true,
            encrypted_credentials,
            salt,
            last_synced_at: None,
            sync_count: 0,
        }
    }

    /// Records a successful sync touch
    pub fn record_sync(&mut self, at: DateTime<Utc>) {
        self.last_synced_at = Some(at);
        self.sync_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config_enabled() {
        let cfg = IntegrationConfig::new(
            UserId::new(),
            DestinationName::new("notion").unwrap(),
            vec![1, 2, 3],
            vec![9; 16],
        );
        assert!(cfg.enabled);
        assert_eq!(cfg.sync_count, 0);
        assert!(cfg.last_synced_at.is_none());
    }

    #[test]
    fn test_record_sync() {
        let mut cfg = IntegrationConfig::new(
            UserId::new(),
            DestinationName::new("notion").unwrap(),
            vec![],
            vec![],
        );
        let now = Utc::now();
        cfg.record_sync(now);
        cfg.record_sync(now);
        assert_eq!(cfg.sync_count, 2);
        assert_eq!(cfg.last_synced_at, Some(now));
    }
}

//! Destination registry and factory
//!
//! Adapters are constructed from a user's [`IntegrationConfig`]: the
//! registry decrypts the credential blob with the key derived for that
//! user's salt, parses the destination-specific credential shape, and
//! returns the adapter behind the [`Destination`] port. Rate limiters are
//! shared per destination name so every adapter for a target draws from the
//! same budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use inkmirror_core::domain::IntegrationConfig;
use inkmirror_core::ports::Destination;

use crate::crypto::CredentialCipher;
use crate::notes::{NotesCredentials, NotesDestination, NOTES_DESTINATION};
use crate::rate_limit::{DestinationRateLimiter, RateLimitSettings};

/// Builds destination adapters from stored integration configs
pub struct DestinationRegistry {
    cipher: CredentialCipher,
    /// Base URL per destination name (override for tests)
    base_urls: HashMap<String, String>,
    /// Shared rate limiter per destination name
    limiters: Mutex<HashMap<String, Arc<DestinationRateLimiter>>>,
    timeout: Duration,
}

impl DestinationRegistry {
    /// Creates a registry over the server master secret
    pub fn new(master_secret: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        let mut base_urls = HashMap::new();
        base_urls.insert(
            NOTES_DESTINATION.to_string(),
            "https://api.notes.example.com".to_string(),
        );
        Self {
            cipher: CredentialCipher::new(master_secret),
            base_urls,
            limiters: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Overrides a destination's base URL (tests point this at a mock server)
    pub fn with_base_url(mut self, name: &str, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(name.to_string(), base_url.into());
        self
    }

    /// Names of destinations this registry can construct
    pub fn known_destinations(&self) -> Vec<&str> {
        self.base_urls.keys().map(String::as_str).collect()
    }

    /// Encrypts plaintext credentials for storage in an IntegrationConfig
    pub fn seal_credentials(&self, salt: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(salt, plaintext)
            .context("Failed to encrypt integration credentials")
    }

    fn limiter_for(&self, name: &str) -> Arc<DestinationRateLimiter> {
        let mut limiters = self.limiters.lock().unwrap();
        limiters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DestinationRateLimiter::new(RateLimitSettings::default())))
            .clone()
    }

    /// Constructs the adapter for a stored config
    ///
    /// # Errors
    /// Fails when the destination name is unknown, the config is disabled,
    /// or the credential blob does not decrypt and parse.
    pub fn build(&self, config: &IntegrationConfig) -> Result<Arc<dyn Destination>> {
        if !config.enabled {
            bail!("destination {} is disabled", config.destination);
        }

        let plaintext = self
            .cipher
            .decrypt(&config.salt, &config.encrypted_credentials)
            .with_context(|| format!("Failed to decrypt credentials for {}", config.destination))?;

        let name = config.destination.as_str();
        let base_url = self
            .base_urls
            .get(name)
            .with_context(|| format!("Unknown destination: {name}"))?;

        debug!(destination = name, "Constructing destination adapter");

        match name {
            NOTES_DESTINATION => {
                let credentials: NotesCredentials = serde_json::from_slice(&plaintext)
                    .context("Invalid notes credential shape")?;
                let adapter = NotesDestination::new(
                    base_url.clone(),
                    credentials,
                    self.limiter_for(name),
                    self.timeout,
                )?;
                Ok(Arc::new(adapter))
            }
            other => bail!("Unknown destination: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkmirror_core::domain::newtypes::{DestinationName, UserId};

    fn config_with(registry: &DestinationRegistry, plaintext: &[u8]) -> IntegrationConfig {
        let salt = CredentialCipher::generate_salt();
        let blob = registry.seal_credentials(&salt, plaintext).unwrap();
        IntegrationConfig::new(
            UserId::new(),
            DestinationName::new(NOTES_DESTINATION).unwrap(),
            blob,
            salt,
        )
    }

    fn registry() -> DestinationRegistry {
        DestinationRegistry::new("master-secret", Duration::from_secs(2))
    }

    #[test]
    fn test_build_notes_destination() {
        let registry = registry();
        let config = config_with(
            &registry,
            br#"{"api_token": "tok", "workspace_id": "ws"}"#,
        );
        let adapter = registry.build(&config).unwrap();
        assert_eq!(adapter.name(), NOTES_DESTINATION);
        assert!(adapter.capabilities().dedupe_check);
    }

    #[test]
    fn test_disabled_config_rejected() {
        let registry = registry();
        let mut config = config_with(
            &registry,
            br#"{"api_token": "tok", "workspace_id": "ws"}"#,
        );
        config.enabled = false;
        assert!(registry.build(&config).is_err());
    }

    #[test]
    fn test_bad_credential_shape_rejected() {
        let registry = registry();
        let config = config_with(&registry, br#"{"wrong": "shape"}"#);
        assert!(registry.build(&config).is_err());
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let registry = registry();
        let salt = CredentialCipher::generate_salt();
        let blob = registry.seal_credentials(&salt, b"{}").unwrap();
        let config = IntegrationConfig::new(
            UserId::new(),
            DestinationName::new("unknown_dest").unwrap(),
            blob,
            salt,
        );
        assert!(registry.build(&config).is_err());
    }

    #[test]
    fn test_wrong_master_secret_fails_decrypt() {
        let sealing = registry();
        let config = config_with(
            &sealing,
            br#"{"api_token": "tok", "workspace_id": "ws"}"#,
        );
        let other = DestinationRegistry::new("different-secret", Duration::from_secs(2));
        assert!(other.build(&config).is_err());
    }
}

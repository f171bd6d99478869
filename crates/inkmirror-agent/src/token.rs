//! Agent token storage
//!
//! The 30-day agent token lives in the OS secure keystore (Secret Service
//! on Linux), never on disk. Losing the keystore entry just means
//! re-running the login flow.

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

/// Keyring service name for the agent
const SERVICE: &str = "inkmirror-agent";

/// Stores and retrieves the agent's bearer token
pub struct TokenStore {
    entry: Entry,
}

impl TokenStore {
    /// Opens the keystore entry for the given account (usually the
    /// configured API URL, so multiple servers can coexist)
    pub fn new(account: &str) -> Result<Self> {
        let entry = Entry::new(SERVICE, account).context("Failed to open keystore entry")?;
        Ok(Self { entry })
    }

    /// Saves the token
    pub fn store(&self, token: &str) -> Result<()> {
        self.entry
            .set_password(token)
            .context("Failed to store agent token in keystore")?;
        debug!("Agent token stored in keystore");
        Ok(())
    }

    /// Loads the token, `None` when absent
    pub fn load(&self) -> Result<Option<String>> {
        match self.entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err).context("Failed to read agent token from keystore"),
        }
    }

    /// Removes the token (logout)
    pub fn clear(&self) -> Result<()> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err).context("Failed to delete agent token"),
        }
    }
}

//! Inkmirror Destinations - third-party sync targets
//!
//! Implements the [`Destination`](inkmirror_core::ports::Destination) port
//! for each supported target, plus the shared machinery they need:
//!
//! - **Credential crypto** - AES-256-GCM blobs with HKDF-derived keys
//! - **Rate limiting** - proactive token buckets with adaptive throttling
//! - **Registry** - factory-from-IntegrationConfig, keyed by destination name
//!
//! Destinations are capability-tagged variants behind one trait; there is no
//! inheritance hierarchy. Construction always goes through the registry so
//! credentials are decrypted in exactly one place.

pub mod crypto;
pub mod notes;
pub mod rate_limit;
pub mod registry;

pub use crypto::CredentialCipher;
pub use notes::NotesDestination;
pub use rate_limit::{DestinationRateLimiter, RateLimitSettings};
pub use registry::DestinationRegistry;

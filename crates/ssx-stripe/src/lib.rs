//! Provider boundary: REST client, object-kind registry, wire types, and
//! webhook signature verification.
//!
//! Nothing in this crate touches the database; documents cross the boundary
//! as raw `serde_json::Value` and are interpreted by the sync engine.

pub mod client;
pub mod error;
pub mod registry;
pub mod types;
pub mod webhook;

pub use client::{ProviderLister, StripeClient};
pub use error::StripeError;
pub use registry::{ObjectKind, DEFAULT_PAGE_SIZE};
pub use types::{EventData, EventEnvelope, ListPage, ListParams};

use sha2::{Digest, Sha256};

/// Hash an API key for storage on the account row.
///
/// Keys are never stored in clear; the hash set lets the ingress associate
/// an incoming key with a known tenant without holding the key itself.
pub fn api_key_hash(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_hash_is_stable_and_key_free() {
        let h = api_key_hash("sk_test_abc");
        assert_eq!(h, api_key_hash("sk_test_abc"));
        assert_ne!(h, api_key_hash("sk_test_abd"));
        assert_eq!(h.len(), 64);
        assert!(!h.contains("sk_test"));
    }
}

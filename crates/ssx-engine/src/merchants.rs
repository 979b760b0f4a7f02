//! Multi-tenant merchant table.
//!
//! The webhook ingress resolves the tenant for a delivery by the request
//! `Host` header. The table comes from `MERCHANT_CONFIG_JSON`, a map of
//! host → `{account_id, webhook_secret}`; single-tenant deployments build a
//! one-entry table from the plain env vars instead.

use std::collections::HashMap;

use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Merchant {
    pub account_id: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct MerchantTable {
    by_host: HashMap<String, Merchant>,
}

impl MerchantTable {
    /// Parse `MERCHANT_CONFIG_JSON`: `{"a.example": {"account_id": …,
    /// "webhook_secret": …}, …}`. Host keys are stored lowercased.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, Merchant> = serde_json::from_str(raw)
            .map_err(|e| ConfigError(format!("MERCHANT_CONFIG_JSON invalid: {e}")))?;
        if parsed.is_empty() {
            return Err(ConfigError("MERCHANT_CONFIG_JSON maps no hosts".into()));
        }
        let by_host = parsed
            .into_iter()
            .map(|(host, merchant)| (host.to_ascii_lowercase(), merchant))
            .collect();
        Ok(Self { by_host })
    }

    /// One tenant answering on every host.
    pub fn single_tenant(account_id: &str, webhook_secret: &str) -> Self {
        let mut by_host = HashMap::new();
        by_host.insert(
            "*".to_string(),
            Merchant {
                account_id: account_id.to_string(),
                webhook_secret: webhook_secret.to_string(),
            },
        );
        Self { by_host }
    }

    /// Resolve a request `Host` header (port ignored, case-insensitive).
    pub fn resolve(&self, host_header: &str) -> Option<&Merchant> {
        let host = host_header
            .rsplit_once(':')
            .map(|(h, port)| if port.chars().all(|c| c.is_ascii_digit()) { h } else { host_header })
            .unwrap_or(host_header)
            .to_ascii_lowercase();
        self.by_host.get(&host).or_else(|| self.by_host.get("*"))
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }
}

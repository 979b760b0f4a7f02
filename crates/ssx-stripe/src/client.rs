//! Provider HTTP client.
//!
//! Thin typed wrapper over the provider's REST API: bearer auth, optional
//! pinned API version, 30 s request deadline, and bounded exponential retry
//! on 429/5xx/transport for idempotent reads. Payloads leave this module as
//! raw `serde_json::Value` documents; interpretation happens upstream.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::StripeError;
use crate::registry::{ObjectKind, DEFAULT_PAGE_SIZE};
use crate::types::{ListPage, ListParams};

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Read seam over the provider's list/retrieve endpoints.
///
/// The sync worker and the upserter are generic over this trait so tests can
/// drive them with an in-process fake instead of the network.
pub trait ProviderLister: Send + Sync {
    /// Fetch one page of a list endpoint.
    fn list_page(
        &self,
        kind: ObjectKind,
        params: &ListParams,
    ) -> impl Future<Output = Result<ListPage, StripeError>> + Send;

    /// Fetch the authoritative current document for one object.
    fn retrieve(
        &self,
        kind: ObjectKind,
        id: &str,
    ) -> impl Future<Output = Result<Value, StripeError>> + Send;
}

#[derive(Clone, Debug)]
pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    api_version: Option<String>,
}

impl StripeClient {
    pub fn new(api_key: &str, api_version: Option<&str>) -> Result<Self, StripeError> {
        if api_key.trim().is_empty() {
            return Err(StripeError::Config("empty provider api key".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StripeError::Config(format!("http client build failed: {e}")))?;

        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.to_string(),
            api_version: api_version.map(|v| v.to_string()),
        })
    }

    /// Point the client at a different base url (test servers).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// The authenticated account document (`GET /v1/account`).
    ///
    /// The tenant row is created from this document on first successful
    /// call; its `id` field is the account primary key.
    pub async fn fetch_account(&self) -> Result<Value, StripeError> {
        self.get_json("/v1/account", &[]).await
    }

    // -----------------------------------------------------------------
    // Webhook endpoint lifecycle
    // -----------------------------------------------------------------

    /// Create a webhook endpoint subscribed to `enabled_events`.
    ///
    /// The response carries the endpoint `id` and its signing `secret`; the
    /// secret is only ever returned on creation.
    pub async fn create_webhook_endpoint(
        &self,
        url: &str,
        enabled_events: &[&str],
    ) -> Result<Value, StripeError> {
        let mut form: Vec<(String, String)> = vec![("url".to_string(), url.to_string())];
        for ev in enabled_events {
            form.push(("enabled_events[]".to_string(), (*ev).to_string()));
        }
        if let Some(v) = &self.api_version {
            form.push(("api_version".to_string(), v.clone()));
        }
        self.post_form("/v1/webhook_endpoints", &form).await
    }

    /// Retrieve one webhook endpoint; `Err(e)` with `e.is_resource_missing()`
    /// when it was deleted out-of-band.
    pub async fn retrieve_webhook_endpoint(&self, id: &str) -> Result<Value, StripeError> {
        self.get_json(&format!("/v1/webhook_endpoints/{id}"), &[])
            .await
    }

    /// Delete one webhook endpoint. Missing endpoints are tolerated.
    pub async fn delete_webhook_endpoint(&self, id: &str) -> Result<(), StripeError> {
        match self.delete(&format!("/v1/webhook_endpoints/{id}")).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_resource_missing() => {
                warn!(endpoint = id, "webhook endpoint already gone remotely");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------

    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, StripeError> {
        let url = format!("{}{}", self.api_base, path);
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut req = self.http.get(&url).bearer_auth(&self.api_key);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(v) = &self.api_version {
                req = req.header("Stripe-Version", v);
            }

            let err = match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| StripeError::Decode(e.to_string()));
                }
                Ok(resp) => Self::api_error(resp).await,
                Err(e) => StripeError::Transport(e.to_string()),
            };

            if err.is_retryable() && attempt < MAX_ATTEMPTS {
                warn!(%url, attempt, error = %err, "provider request failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }
            return Err(err);
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<Value, StripeError> {
        let url = format!("{}{}", self.api_base, path);
        let mut req = self.http.post(&url).bearer_auth(&self.api_key).form(form);
        if let Some(v) = &self.api_version {
            req = req.header("Stripe-Version", v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StripeError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| StripeError::Decode(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<Value, StripeError> {
        let url = format!("{}{}", self.api_base, path);
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| StripeError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| StripeError::Decode(e.to_string()))
    }

    /// Decode the provider's `{"error": {...}}` body into a typed error.
    async fn api_error(resp: reqwest::Response) -> StripeError {
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        let code = body
            .pointer("/error/code")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("no error body")
            .to_string();
        StripeError::Api {
            status,
            code,
            message,
        }
    }
}

impl ProviderLister for StripeClient {
    async fn list_page(
        &self,
        kind: ObjectKind,
        params: &ListParams,
    ) -> Result<ListPage, StripeError> {
        let mut params = params.clone();
        if params.limit.is_none() {
            params.limit = Some(DEFAULT_PAGE_SIZE);
        }
        // Kinds without the created filter never send a created range, even
        // if a caller populated one.
        if !kind.supports_created_filter() {
            params.created_gte = None;
            params.created_lte = None;
        }
        let raw = self.get_json(kind.list_path(), &params.to_query()).await?;
        serde_json::from_value::<ListPage>(raw).map_err(|e| StripeError::Decode(e.to_string()))
    }

    async fn retrieve(&self, kind: ObjectKind, id: &str) -> Result<Value, StripeError> {
        self.get_json(&kind.retrieve_path(id), &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_config_error() {
        match StripeClient::new("  ", None) {
            Err(StripeError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn api_base_trailing_slash_stripped() {
        let c = StripeClient::new("sk_test_1", None)
            .unwrap()
            .with_api_base("http://127.0.0.1:9999/");
        assert_eq!(c.api_base, "http://127.0.0.1:9999");
    }
}

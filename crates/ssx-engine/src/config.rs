//! Environment-driven configuration.
//!
//! Configuration files are out of scope; everything arrives through env
//! vars (binaries load `.env.local` first for dev convenience). Missing
//! required values are Configuration errors and abort startup.

use std::fmt;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_STRIPE_SECRET_KEY: &str = "STRIPE_SECRET_KEY";

/// A missing or invalid configuration input. Maps to exit code 1.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    /// Provider secret key; required by backfill/start, not by migrate.
    pub stripe_secret_key: Option<String>,
    pub stripe_api_version: Option<String>,
    /// Static webhook signing secret for deployments that bring their own
    /// endpoint instead of a managed one.
    pub stripe_webhook_secret: Option<String>,
    pub ngrok_auth_token: Option<String>,
    /// Recognized for compatibility; drives nothing.
    pub enable_sigma: bool,
    pub auto_expand_lists: bool,
    pub backfill_related_entities: bool,
    pub max_postgres_connections: u32,
    pub revalidate_objects_via_stripe_api: bool,
    pub disable_migrations: bool,
    pub use_websocket: bool,
    pub skip_backfill: bool,
    pub webhook_path: String,
    pub keep_webhooks_on_shutdown: bool,
    pub merchant_config_json: Option<String>,
    pub schema: String,
    pub bind_addr: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var(ENV_DATABASE_URL)
            .map_err(|_| ConfigError(format!("missing env var {ENV_DATABASE_URL}")))?;

        let max_postgres_connections = match std::env::var("MAX_POSTGRES_CONNECTIONS") {
            Ok(v) => v
                .parse::<u32>()
                .map_err(|_| ConfigError(format!("MAX_POSTGRES_CONNECTIONS not a number: {v}")))?,
            Err(_) => 10,
        };

        let webhook_path = std::env::var("WEBHOOK_PATH").unwrap_or_else(|_| "/webhooks".into());
        if !webhook_path.starts_with('/') {
            return Err(ConfigError(format!(
                "WEBHOOK_PATH must start with '/': {webhook_path}"
            )));
        }

        let cfg = Self {
            database_url,
            stripe_secret_key: env_opt(ENV_STRIPE_SECRET_KEY),
            stripe_api_version: env_opt("STRIPE_API_VERSION"),
            stripe_webhook_secret: env_opt("STRIPE_WEBHOOK_SECRET"),
            ngrok_auth_token: env_opt("NGROK_AUTH_TOKEN"),
            enable_sigma: env_bool("ENABLE_SIGMA"),
            auto_expand_lists: env_bool("AUTO_EXPAND_LISTS"),
            backfill_related_entities: env_bool("BACKFILL_RELATED_ENTITIES"),
            max_postgres_connections,
            revalidate_objects_via_stripe_api: env_bool("REVALIDATE_OBJECTS_VIA_STRIPE_API"),
            disable_migrations: env_bool("DISABLE_MIGRATIONS"),
            use_websocket: env_bool("USE_WEBSOCKET"),
            skip_backfill: env_bool("SKIP_BACKFILL"),
            webhook_path,
            keep_webhooks_on_shutdown: env_bool("KEEP_WEBHOOKS_ON_SHUTDOWN"),
            merchant_config_json: env_opt("MERCHANT_CONFIG_JSON"),
            schema: std::env::var("SCHEMA").unwrap_or_else(|_| "stripe".into()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8787".into()),
        };
        Ok(cfg)
    }

    /// The provider key, or a Configuration error naming the variable.
    pub fn require_stripe_key(&self) -> Result<&str, ConfigError> {
        self.stripe_secret_key
            .as_deref()
            .ok_or_else(|| ConfigError(format!("missing env var {ENV_STRIPE_SECRET_KEY}")))
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// `1` or `true` (any case) mean enabled; anything else, including unset,
/// means disabled.
fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so cargo's
    // parallel test runner cannot interleave them.
    #[test]
    fn parses_booleans_paths_and_defaults() {
        std::env::set_var(ENV_DATABASE_URL, "postgres://localhost/x");
        std::env::set_var("BACKFILL_RELATED_ENTITIES", "true");
        std::env::set_var("USE_WEBSOCKET", "1");
        std::env::set_var("SKIP_BACKFILL", "no");
        std::env::remove_var("WEBHOOK_PATH");
        std::env::remove_var("MAX_POSTGRES_CONNECTIONS");
        std::env::remove_var(ENV_STRIPE_SECRET_KEY);

        let cfg = SyncConfig::from_env().unwrap();
        assert!(cfg.backfill_related_entities);
        assert!(cfg.use_websocket);
        assert!(!cfg.skip_backfill);
        assert_eq!(cfg.webhook_path, "/webhooks");
        assert_eq!(cfg.max_postgres_connections, 10);
        assert_eq!(cfg.schema, "stripe");
        assert!(cfg.require_stripe_key().is_err());

        std::env::set_var("WEBHOOK_PATH", "hooks");
        assert!(SyncConfig::from_env().is_err());
        std::env::set_var("WEBHOOK_PATH", "/hooks");

        std::env::set_var("MAX_POSTGRES_CONNECTIONS", "abc");
        assert!(SyncConfig::from_env().is_err());
        std::env::remove_var("MAX_POSTGRES_CONNECTIONS");
        std::env::remove_var(ENV_DATABASE_URL);
    }
}

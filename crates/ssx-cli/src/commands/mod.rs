//! CLI subcommand implementations and the exit-code error type.

pub mod backfill;
pub mod migrate;
pub mod start;

use std::fmt;

use ssx_engine::{ConfigError, SyncConfig};

/// CLI failure categories, each with its contract exit code.
#[derive(Debug)]
pub enum CliError {
    /// Missing/invalid inputs. Exit 1.
    Config(String),
    /// DDL could not be applied. Exit 2.
    Migration(String),
    /// Anything that failed after a valid start. Exit 3.
    Runtime(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 1,
            CliError::Migration(_) => 2,
            CliError::Runtime(_) => 3,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "{msg}"),
            CliError::Migration(msg) => write!(f, "migration failed: {msg}"),
            CliError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

/// Load env configuration with CLI flag overrides applied first.
///
/// Flags win over the environment; the override goes through the process
/// env so every downstream `from_env` consumer agrees.
pub fn load_config(
    database_url: Option<&str>,
    stripe_key: Option<&str>,
) -> Result<SyncConfig, CliError> {
    if let Some(url) = database_url {
        std::env::set_var(ssx_engine::config::ENV_DATABASE_URL, url);
    }
    if let Some(key) = stripe_key {
        std::env::set_var(ssx_engine::config::ENV_STRIPE_SECRET_KEY, key);
    }
    Ok(SyncConfig::from_env()?)
}

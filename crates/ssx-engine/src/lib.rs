//! Sync engine core.
//!
//! Ties the provider boundary to the database gateway: the entity upserter,
//! the run registry, the cooperative sync worker, the event processor, and
//! the managed-webhook lifecycle. Transports (HTTP ingress, live stream,
//! CLI) sit above this crate and only adapt its results.

pub mod account;
pub mod config;
pub mod events;
pub mod merchants;
pub mod runs;
pub mod upserter;
pub mod webhooks;
pub mod worker;

pub use account::ensure_account;
pub use config::{ConfigError, SyncConfig};
pub use events::{apply_event, process_signed_event, EventError, Received};
pub use merchants::{Merchant, MerchantTable};
pub use upserter::{EntityUpserter, UpsertOptions, UpsertStats};
pub use worker::{run_sync_workers, WorkerConfig};

//! Shared runtime state for the ingress daemon.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use ssx_db::Db;
use ssx_engine::{EntityUpserter, MerchantTable};
use ssx_stripe::StripeClient;

/// Handle shared across all Axum handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Db,
    pub upserter: EntityUpserter<StripeClient>,
    pub merchants: MerchantTable,
    /// Path the webhook route is mounted on (`WEBHOOK_PATH`).
    pub webhook_path: String,
}

impl AppState {
    pub fn new(
        db: Db,
        upserter: EntityUpserter<StripeClient>,
        merchants: MerchantTable,
        webhook_path: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            upserter,
            merchants,
            webhook_path,
        })
    }
}

/// Spawn the periodic maintenance sweep: stale claims back to pending,
/// ancient runs self-cancelled.
pub fn spawn_sweeper(db: Db, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = ssx_engine::runs::sweep_stale(&db).await {
                error!(error = %e, "maintenance sweep failed");
            }
        }
    });
}

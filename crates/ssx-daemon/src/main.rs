//! ssx-daemon entry point.
//!
//! Thin by intent: tracing, config, state, middleware, listener. Handlers
//! live in `routes.rs`, shared state in `state.rs`.

use std::time::Duration;

use anyhow::{bail, Context};
use ssx_daemon::{routes, state};
use ssx_db::Db;
use ssx_engine::{EntityUpserter, MerchantTable, SyncConfig, UpsertOptions};
use ssx_stripe::StripeClient;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; silent when the file does not exist.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = SyncConfig::from_env()?;

    let db = Db::connect(&cfg.database_url, cfg.max_postgres_connections, &cfg.schema)
        .await
        .context("database connect failed")?;
    if cfg.disable_migrations {
        info!("migrations disabled by DISABLE_MIGRATIONS");
    } else {
        db.migrate().await.context("migrate failed")?;
    }

    let client = StripeClient::new(cfg.require_stripe_key()?, cfg.stripe_api_version.as_deref())?;

    // The event path is where related-entity backfill belongs; bulk sync
    // disables it.
    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::new(client.clone()),
        UpsertOptions {
            backfill_related_entities: cfg.backfill_related_entities,
            revalidate_via_provider: cfg.revalidate_objects_via_stripe_api,
            auto_expand_lists: cfg.auto_expand_lists,
        },
    );

    let merchants = match &cfg.merchant_config_json {
        Some(raw) => MerchantTable::from_json(raw)?,
        None => {
            let Some(secret) = cfg.stripe_webhook_secret.as_deref() else {
                bail!("set MERCHANT_CONFIG_JSON or STRIPE_WEBHOOK_SECRET");
            };
            let account_id =
                ssx_engine::ensure_account(&db, &client, cfg.require_stripe_key()?).await?;
            MerchantTable::single_tenant(&account_id, secret)
        }
    };

    state::spawn_sweeper(db.clone(), SWEEP_INTERVAL);

    let shared = state::AppState::new(db.clone(), upserter, merchants, cfg.webhook_path.clone());
    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("bind failed: {}", cfg.bind_addr))?;
    info!("ssx-daemon listening on http://{}", cfg.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    db.close().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
    }
}

//! `ssx start` — run event ingestion.
//!
//! Preferred mode is the live stream: no inbound HTTP, no tunnel, nothing
//! to expose. With a tunnel (or an explicit public url / merchant table)
//! the HTTP ingress is served instead and a managed webhook endpoint is
//! registered against the public url. Tunnel provisioning itself is an
//! external collaborator; it hands us the public url and nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use ssx_daemon::{routes, AppState};
use ssx_engine::{
    apply_event, runs, webhooks, EntityUpserter, MerchantTable, SyncConfig, UpsertOptions,
    WorkerConfig,
};
use ssx_stream::{EventAck, LiveStreamClient, StreamHandler, DEFAULT_STREAM_URL};
use ssx_stripe::{EventEnvelope, ObjectKind, StripeClient};

use super::CliError;

pub async fn run(
    database_url: Option<&str>,
    stripe_key: Option<&str>,
    ngrok_token: Option<&str>,
    public_url: Option<&str>,
) -> Result<(), CliError> {
    let cfg = super::load_config(database_url, stripe_key)?;
    let tunnel_token = ngrok_token
        .map(str::to_string)
        .or_else(|| cfg.ngrok_auth_token.clone());

    let db = ssx_db::Db::connect(&cfg.database_url, cfg.max_postgres_connections, &cfg.schema)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    if cfg.disable_migrations {
        info!("migrations disabled by DISABLE_MIGRATIONS");
    } else {
        db.migrate()
            .await
            .map_err(|e| CliError::Migration(e.to_string()))?;
    }

    let secret_key = cfg.require_stripe_key()?.to_string();
    let client = StripeClient::new(&secret_key, cfg.stripe_api_version.as_deref())
        .map_err(|e| CliError::Config(e.to_string()))?;
    let account_id = ssx_engine::ensure_account(&db, &client, &secret_key)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    if cfg.enable_sigma {
        info!("ENABLE_SIGMA recognized; no effect in this build");
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    // Event-path upserter: related-entity backfill lives here, per config.
    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::new(client.clone()),
        UpsertOptions {
            backfill_related_entities: cfg.backfill_related_entities,
            revalidate_via_provider: cfg.revalidate_objects_via_stripe_api,
            auto_expand_lists: cfg.auto_expand_lists,
        },
    );

    if cfg.skip_backfill {
        info!("initial backfill skipped by SKIP_BACKFILL");
    } else {
        spawn_initial_backfill(&db, &client, &cfg, &account_id, Arc::clone(&shutdown));
    }

    let use_stream = cfg.use_websocket
        || (tunnel_token.is_none() && public_url.is_none() && cfg.merchant_config_json.is_none());

    if use_stream {
        run_stream(&secret_key, upserter, &account_id, shutdown).await
    } else {
        run_ingress(db, client, cfg, upserter, &account_id, public_url).await
    }
}

// ---------------------------------------------------------------------------
// Live stream mode
// ---------------------------------------------------------------------------

struct EngineHandler {
    upserter: EntityUpserter<StripeClient>,
    account_id: String,
}

impl StreamHandler for EngineHandler {
    fn on_ready(&self, _secret: &str) {
        info!("live stream ready");
    }

    async fn on_event(&self, envelope: EventEnvelope) -> EventAck {
        let event_id = envelope.id.clone();
        match apply_event(&self.upserter, &self.account_id, &envelope).await {
            Ok(received) => EventAck::ok(&received.event_id),
            Err(e) => {
                error!(event = %event_id, error = %e, "stream event apply failed");
                EventAck::failed(&event_id)
            }
        }
    }

    fn on_error(&self, error: &str) {
        warn!(error, "live stream error");
    }

    fn on_close(&self, code: u16, reason: &str) {
        info!(code, reason, "live stream closed");
    }
}

async fn run_stream(
    secret_key: &str,
    upserter: EntityUpserter<StripeClient>,
    account_id: &str,
    shutdown: Arc<AtomicBool>,
) -> Result<(), CliError> {
    info!("starting live stream ingestion (no inbound HTTP)");
    let stream = LiveStreamClient::new(DEFAULT_STREAM_URL, secret_key);

    let stop = stream.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping stream");
            stop.store(true, Ordering::Relaxed);
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let handler = EngineHandler {
        upserter,
        account_id: account_id.to_string(),
    };
    stream.run(&handler).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP ingress mode
// ---------------------------------------------------------------------------

async fn run_ingress(
    db: ssx_db::Db,
    client: StripeClient,
    cfg: SyncConfig,
    upserter: EntityUpserter<StripeClient>,
    account_id: &str,
    public_url: Option<&str>,
) -> Result<(), CliError> {
    let mut managed_webhook_id = None;

    let merchants = match &cfg.merchant_config_json {
        Some(raw) => MerchantTable::from_json(raw)?,
        None => {
            let Some(url) = public_url else {
                return Err(CliError::Config(
                    "HTTP ingress needs --public-url (the tunnel's public address) \
                     or MERCHANT_CONFIG_JSON; or omit the tunnel token to use the live stream"
                        .to_string(),
                ));
            };
            let endpoint_url = format!(
                "{}{}",
                url.trim_end_matches('/'),
                cfg.webhook_path
            );
            let webhook =
                webhooks::find_or_create_managed_webhook(&db, &client, account_id, &endpoint_url)
                    .await
                    .map_err(|e| CliError::Runtime(e.to_string()))?;
            managed_webhook_id = Some(webhook.id.clone());
            MerchantTable::single_tenant(account_id, &webhook.secret)
        }
    };

    let state = AppState::new(
        db.clone(),
        upserter,
        merchants,
        cfg.webhook_path.clone(),
    );
    let app = routes::build_router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .map_err(|e| CliError::Runtime(format!("bind failed on {}: {e}", cfg.bind_addr)))?;
    info!(
        "webhook ingress listening on http://{}{}",
        cfg.bind_addr, cfg.webhook_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("interrupt received, shutting down ingress");
        })
        .await
        .map_err(|e| CliError::Runtime(format!("server crashed: {e}")))?;

    if let Some(id) = managed_webhook_id {
        if cfg.keep_webhooks_on_shutdown {
            info!(endpoint = %id, "keeping managed webhook (KEEP_WEBHOOKS_ON_SHUTDOWN)");
        } else if let Err(e) = webhooks::delete_managed_webhook(&db, &client, &id).await {
            warn!(endpoint = %id, error = %e, "managed webhook teardown failed");
        }
    }

    db.close().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Initial backfill
// ---------------------------------------------------------------------------

/// Kick a full backfill alongside ingestion, trigger label "worker". It
/// joins an existing open run if one survived a crash.
fn spawn_initial_backfill(
    db: &ssx_db::Db,
    client: &StripeClient,
    cfg: &SyncConfig,
    account_id: &str,
    shutdown: Arc<AtomicBool>,
) {
    let db = db.clone();
    let account_id = account_id.to_string();
    // Bulk path: related backfill off.
    let upserter = Arc::new(EntityUpserter::new(
        db.clone(),
        Arc::new(client.clone()),
        UpsertOptions {
            backfill_related_entities: false,
            revalidate_via_provider: cfg.revalidate_objects_via_stripe_api,
            auto_expand_lists: cfg.auto_expand_lists,
        },
    ));

    tokio::spawn(async move {
        let worker_cfg = WorkerConfig::default();
        let objects = ObjectKind::backfill_set();
        let created = match runs::incremental_slices(&db, &account_id, &objects).await {
            Ok(slices) => {
                runs::join_or_create_run_sliced(
                    &db,
                    &account_id,
                    "worker",
                    &slices,
                    worker_cfg.workers as i32,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match created {
            Ok((key, max_concurrency)) => {
                if let Err(e) = ssx_engine::run_sync_workers(
                    db.clone(),
                    upserter,
                    key,
                    max_concurrency,
                    worker_cfg,
                    shutdown,
                )
                .await
                {
                    error!(error = %e, "initial backfill failed");
                } else if let Err(e) = db.touch_account_last_synced(&account_id).await {
                    warn!(error = %e, "last-synced stamp failed");
                }
            }
            Err(e) => error!(error = %e, "initial backfill could not start"),
        }
    });
}

//! `ssx backfill <object|all>` — paginated enumeration of list endpoints
//! into the mirror, resumable across crashes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use ssx_engine::{runs, EntityUpserter, UpsertOptions, WorkerConfig};
use ssx_stripe::{ObjectKind, StripeClient};

use super::CliError;

pub const TRIGGER_LABEL: &str = "cli-backfill";

pub async fn run(
    object: &str,
    database_url: Option<&str>,
    stripe_key: Option<&str>,
) -> Result<(), CliError> {
    let cfg = super::load_config(database_url, stripe_key)?;
    let objects = resolve_objects(object)?;

    let db = ssx_db::Db::connect(&cfg.database_url, cfg.max_postgres_connections, &cfg.schema)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    if !cfg.disable_migrations {
        db.migrate()
            .await
            .map_err(|e| CliError::Migration(e.to_string()))?;
    }

    let client = StripeClient::new(cfg.require_stripe_key()?, cfg.stripe_api_version.as_deref())
        .map_err(|e| CliError::Config(e.to_string()))?;
    let account_id = ssx_engine::ensure_account(&db, &client, cfg.require_stripe_key()?)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    // Bulk sync never chases related references; every kind gets its own
    // object run instead.
    let upserter = Arc::new(EntityUpserter::new(
        db.clone(),
        Arc::new(client),
        UpsertOptions {
            backfill_related_entities: false,
            revalidate_via_provider: cfg.revalidate_objects_via_stripe_api,
            auto_expand_lists: cfg.auto_expand_lists,
        },
    ));

    let worker_cfg = WorkerConfig::default();
    let slices = runs::incremental_slices(&db, &account_id, &objects)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    let (key, max_concurrency) = runs::join_or_create_run_sliced(
        &db,
        &account_id,
        TRIGGER_LABEL,
        &slices,
        worker_cfg.workers as i32,
    )
    .await
    .map_err(|e| CliError::Runtime(e.to_string()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c(Arc::clone(&shutdown));

    ssx_engine::run_sync_workers(
        db.clone(),
        upserter,
        key.clone(),
        max_concurrency,
        worker_cfg,
        shutdown,
    )
    .await
    .map_err(|e| CliError::Runtime(e.to_string()))?;

    db.touch_account_last_synced(&account_id)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    for summary in runs::runs_summary(&db, &account_id)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?
        .iter()
        .filter(|s| s.started_at == key.started_at)
    {
        println!(
            "run={} status={} objects={} complete={} error={} processed={}",
            summary.started_at,
            summary.status,
            summary.total_objects,
            summary.complete,
            summary.error,
            summary.processed_count,
        );
    }

    db.close().await;
    Ok(())
}

fn resolve_objects(arg: &str) -> Result<Vec<ObjectKind>, CliError> {
    if arg.eq_ignore_ascii_case("all") {
        return Ok(ObjectKind::backfill_set());
    }
    let kind = ObjectKind::parse(arg)
        .ok_or_else(|| CliError::Config(format!("unknown object kind: {arg}")))?;
    if kind.requires_context() {
        return Err(CliError::Config(format!(
            "{arg} requires a parent-object context and cannot be backfilled standalone; \
             it is mirrored through its parent objects"
        )));
    }
    Ok(vec![kind])
}

fn spawn_ctrl_c(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight tasks");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_expands_to_backfill_set() {
        assert_eq!(resolve_objects("all").unwrap(), ObjectKind::backfill_set());
        assert_eq!(resolve_objects("ALL").unwrap(), ObjectKind::backfill_set());
    }

    #[test]
    fn single_kind_resolves() {
        assert_eq!(resolve_objects("product").unwrap(), vec![ObjectKind::Product]);
    }

    #[test]
    fn unknown_and_context_kinds_are_config_errors() {
        assert!(matches!(resolve_objects("widget"), Err(CliError::Config(_))));
        assert!(matches!(
            resolve_objects("payment_method"),
            Err(CliError::Config(_))
        ));
    }
}

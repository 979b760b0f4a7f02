//! `ssx migrate` — apply the schema bundle.

use ssx_db::Db;

use super::CliError;

pub async fn run(database_url: Option<&str>) -> Result<(), CliError> {
    let cfg = super::load_config(database_url, None)?;

    let db = Db::connect(&cfg.database_url, cfg.max_postgres_connections, &cfg.schema)
        .await
        .map_err(|e| CliError::Migration(e.to_string()))?;
    db.migrate()
        .await
        .map_err(|e| CliError::Migration(e.to_string()))?;

    println!("migrations_applied=true schema={}", cfg.schema);
    Ok(())
}

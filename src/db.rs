use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::Config;

/// Create the Postgres pool. Connections are opened on first use, so the
/// server starts even while the database is unreachable.
pub fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(&config.postgres_url())
        .with_context(|| "Invalid Postgres connection settings")?;

    Ok(pool)
}

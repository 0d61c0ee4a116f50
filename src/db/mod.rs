//! Postgres pool for the direct profile store.
//!
//! Only used when `DATABASE_URL` is configured; otherwise profiles go through
//! PostgREST and no pool exists. Migrations create the `profiles` table.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AuthConfig;

/// Connect with the configured pool size and run migrations.
///
/// Returns `Ok(None)` when no database URL is configured.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(config: &AuthConfig) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(database_url) = config.database_url.as_deref() else {
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await?;
    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    tracing::info!(max_connections = config.db_max_connections, "profile database ready");
    Ok(Some(pool))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

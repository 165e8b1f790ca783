//! Postgres connection pool and embedded migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// The shared Postgres pool behind [`crate::PgStore`].
pub type DbPool = PgPool;

/// Connect to `database_url` with at most `max_connections` connections.
///
/// Each scheduler step holds a connection only for its claim and its write,
/// never across a collaborator call, so small pools go a long way.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!(max_connections, "connecting to automation database");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the migrations embedded from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying automation schema migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

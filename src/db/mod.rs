//! Database pool construction and embedded migrations

use anyhow::{Context, Result};
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

use crate::queue_config::DB_POOL_SIZE;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

// Embed migrations into the binary
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/");

/// Build the connection pool and check out one connection so an unreachable
/// database fails at startup instead of on the first message.
pub fn connect(database_url: &str) -> Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(DB_POOL_SIZE)
        .build(manager)
        .context("Failed to create database connection pool")?;

    pool.get()
        .context("Failed to get a database connection - is PostgreSQL reachable?")?;
    info!("Database connection pool created");

    Ok(pool)
}

/// Apply pending migrations, returning the names of the applied ones
pub async fn run_migrations(pool: &PgPool) -> Result<Vec<String>> {
    let pool = pool.clone();

    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;
        Ok::<Vec<String>, anyhow::Error>(applied.iter().map(|m| m.to_string()).collect())
    })
    .await
    .context("Migration task panicked")?
}

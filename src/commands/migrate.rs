use anyhow::Result;
use message_log::db;
use tracing::info;

pub async fn handle_migrate(database_url: &str) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "migrate");
    });

    let pool = db::connect(database_url)?;

    info!("Running database migrations...");
    let applied = db::run_migrations(&pool).await?;
    if applied.is_empty() {
        info!("Database schema is up to date");
    } else {
        for migration in &applied {
            info!("Applied migration {}", migration);
        }
        info!("Applied {} migration(s)", applied.len());
    }

    Ok(())
}

use std::io::Write;

use anyhow::{Context, Result};
use message_log::MessageLogRepository;
use message_log::db;

/// Print the newest records, one JSON object per line
pub async fn handle_recent(database_url: &str, limit: i64) -> Result<()> {
    anyhow::ensure!(limit > 0, "--limit must be positive");

    let pool = db::connect(database_url)?;
    let repository = MessageLogRepository::new(pool);
    let records = repository.recent(limit).await?;

    let mut stdout = std::io::stdout().lock();
    for record in &records {
        let line = serde_json::to_string(record).context("Failed to serialize record")?;
        writeln!(stdout, "{}", line)?;
    }

    Ok(())
}

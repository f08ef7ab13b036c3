use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use message_log::LogConsumer;
use message_log::credentials::CredentialProvider;
use message_log::db;
use message_log::instance_lock::InstanceLock;
use message_log::jetstream_consumer::{BrokerConnection, BrokerSettings, JetStreamConsumer};
use message_log::message_log_repo::{MESSAGE_LOG_TABLE, MessageLogRepository};
use message_log::queue_config::{
    BROKER_SECRET_ID, MESSAGE_LOG_CONSUMER, MESSAGE_LOG_STREAM, MESSAGE_LOG_SUBJECT,
    instance_lock_name,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

#[derive(Debug, Clone, Args)]
pub struct ConsumeArgs {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    pub broker_host: String,

    #[arg(long, env = "BROKER_PORT", default_value_t = 4222)]
    pub broker_port: u16,

    /// Broker namespace (JetStream domain)
    #[arg(long, env = "BROKER_DOMAIN")]
    pub domain: Option<String>,

    #[arg(long, env = "BROKER_STREAM", default_value = MESSAGE_LOG_STREAM)]
    pub stream: String,

    /// Durable consumer name
    #[arg(long, env = "BROKER_CONSUMER", default_value = MESSAGE_LOG_CONSUMER)]
    pub consumer: String,

    /// Require TLS on the broker connection
    #[arg(long, env = "BROKER_TLS", default_value_t = true, action = ArgAction::Set)]
    pub tls: bool,

    #[arg(long, env = "BROKER_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Secret identifier for the broker credentials
    #[arg(long, env = "BROKER_SECRET_ID", default_value = BROKER_SECRET_ID)]
    pub secret_id: String,

    /// JSON secrets file; BROKER_USERNAME/BROKER_PASSWORD are used when absent
    #[arg(long, env = "SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,

    /// Terminate a failing message after this many deliveries (default: requeue forever)
    #[arg(long, env = "MAX_DELIVERIES")]
    pub max_deliveries: Option<u64>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Apply pending migrations before consuming
    #[arg(long, env = "RUN_MIGRATIONS")]
    pub run_migrations: bool,
}

impl ConsumeArgs {
    fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.broker_host.clone(),
            port: self.broker_port,
            domain: self.domain.clone(),
            stream_name: self.stream.clone(),
            consumer_name: self.consumer.clone(),
            subject: MESSAGE_LOG_SUBJECT.to_string(),
            tls: self.tls,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

pub async fn handle_consume(args: ConsumeArgs, credentials: &dyn CredentialProvider) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "consume");
    });

    let settings = args.broker_settings();

    info!(
        "Starting message log consumer - broker: {}, stream: {}, consumer: {}, subject: {}",
        settings.url(),
        settings.stream_name,
        settings.consumer_name,
        settings.subject
    );

    // One worker per durable consumer on this host
    let lock_name = instance_lock_name(&settings.consumer_name);
    let _lock = InstanceLock::new(&lock_name).context(
        "Failed to acquire instance lock - is another message-log consumer running?",
    )?;

    let shutdown = CancellationToken::new();
    tokio::spawn(
        wait_for_shutdown_signal(shutdown.clone()).instrument(tracing::info_span!("signals")),
    );

    // Database
    info!("Connecting to database...");
    let pool = db::connect(&args.database_url)?;

    if args.run_migrations {
        let applied = db::run_migrations(&pool).await?;
        info!("Applied {} pending migration(s)", applied.len());
    }

    let repository = MessageLogRepository::new(pool);

    let columns = repository
        .describe_table()
        .await
        .context("Failed to inspect the message log table")?;
    if columns.is_empty() {
        anyhow::bail!(
            "Table '{}' does not exist - run `message-log migrate` first",
            MESSAGE_LOG_TABLE
        );
    }
    info!("Table '{}' mapping:", MESSAGE_LOG_TABLE);
    for column in &columns {
        info!("  {} ({})", column.column_name, column.data_type);
    }

    // Metrics
    if let Some(port) = args.metrics_port {
        message_log::metrics::start_metrics_server(port)?;
    }
    message_log::metrics::initialize_consumer_metrics();

    // Broker
    let broker_credentials = credentials.broker_credentials(&args.secret_id).await;
    if !broker_credentials.is_complete() {
        warn!(
            "Broker credentials for '{}' are incomplete: {:?}",
            args.secret_id, broker_credentials
        );
    }

    info!(
        "Broker namespace: {}",
        settings.domain.as_deref().unwrap_or("(default)")
    );

    let connection = BrokerConnection::connect(&settings, &broker_credentials).await?;
    let consumer = JetStreamConsumer::new(connection.jetstream(), &settings).await?;
    let mut deliveries = consumer.deliveries().await?;

    let log_consumer = LogConsumer::new(repository, MESSAGE_LOG_SUBJECT)
        .with_max_deliveries(args.max_deliveries);
    if let Some(max) = args.max_deliveries.filter(|m| *m > 0) {
        info!("Failing messages are terminated after {} deliveries", max);
    }

    let result = log_consumer.run(&mut deliveries, shutdown).await;

    drop(deliveries);
    drop(consumer);
    connection.close().await;

    let summary = result.context("Message log consumer stopped")?;
    info!(
        "Message log consumer stopped after {} messages",
        summary.persisted
    );

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to register signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, finishing current message...");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), finishing current message...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), finishing current message...");
            }
            Err(err) => {
                error!("Failed to listen for SIGINT signal: {}", err);
                return;
            }
        }
    }

    shutdown.cancel();
}

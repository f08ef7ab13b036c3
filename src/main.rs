use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use message_log::credentials::{CredentialProvider, EnvCredentialProvider, SecretsFileProvider};
use message_log::telemetry::{self, LogSettings, VERSION};
use tracing::error;

mod commands;

use commands::{ConsumeArgs, handle_consume, handle_migrate, handle_recent};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "message-log", version = VERSION)]
#[command(about = "Persist every message from the logging queue to PostgreSQL", long_about = None)]
struct Cli {
    /// Append logs to this file instead of the console
    #[arg(long, env = "LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Report errors to Sentry
    #[arg(long, env = "SENTRY_DSN", global = true, hide_env_values = true)]
    sentry_dsn: Option<String>,

    /// Environment name reported to Sentry
    #[arg(long, env = "SENTRY_ENVIRONMENT", global = true)]
    sentry_environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the logging queue and persist every message
    Consume(ConsumeArgs),
    /// Apply pending database migrations and exit
    Migrate {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
    },
    /// Print the newest message log records as JSON lines
    Recent {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,

        /// Number of records to print
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let _telemetry = match telemetry::init(&LogSettings {
        log_file: cli.log_file.as_deref(),
        sentry_dsn: cli.sentry_dsn.as_deref(),
        environment: cli.sentry_environment.as_deref(),
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Consume(args) => {
            let credentials: Box<dyn CredentialProvider> = match &args.secrets_file {
                Some(path) => Box::new(SecretsFileProvider::load(path)),
                None => Box::new(EnvCredentialProvider),
            };
            handle_consume(args, credentials.as_ref()).await
        }
        Commands::Migrate { database_url } => handle_migrate(&database_url).await,
        Commands::Recent {
            database_url,
            limit,
        } => handle_recent(&database_url, limit).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

//! `automation-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `worker`:   run the scheduler loop against Postgres until Ctrl-C.
//! - `migrate`:  apply pending database migrations.
//! - `validate`: check an automation definition JSON file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use engine::{AutomationDefinition, Collaborators, Scheduler, SchedulerConfig};
use nodes::http::{HttpCollaborators, HttpEndpoints};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "automation-engine",
    about = "Marketing automation engine: enrollment dispatch and scheduling",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop that advances due enrollments.
    Worker(WorkerArgs),
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate an automation definition JSON file.
    Validate {
        /// Path to the definition JSON file.
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct WorkerArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Seconds between two scheduler ticks.
    #[arg(long, env = "SCHEDULER_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Enrollments claimed per tick.
    #[arg(long, env = "SCHEDULER_BATCH_SIZE", default_value_t = 100)]
    batch_size: i64,

    /// Upper bound on a single collaborator call.
    #[arg(long, env = "SEND_TIMEOUT_SECS", default_value_t = 30)]
    send_timeout_secs: u64,

    /// First retry back-off; doubled on every further failure.
    #[arg(long, env = "RETRY_BASE_DELAY_SECS", default_value_t = 60)]
    retry_base_delay_secs: u64,

    /// Cap on the retry back-off.
    #[arg(long, env = "MAX_RETRY_DELAY_SECS", default_value_t = 3600)]
    max_retry_delay_secs: u64,

    /// Reservation on a claimed enrollment; renewed before every step.
    #[arg(long, env = "LEASE_DURATION_SECS", default_value_t = 300)]
    lease_duration_secs: u64,

    /// Written to `locked_by`; defaults to a random id.
    #[arg(long, env = "SCHEDULER_INSTANCE_ID")]
    instance_id: Option<String>,

    #[arg(long, env = "SEND_ENDPOINT")]
    send_endpoint: String,

    #[arg(long, env = "LISTS_ENDPOINT")]
    lists_endpoint: String,

    #[arg(long, env = "CONTACTS_ENDPOINT")]
    contacts_endpoint: String,
}

impl WorkerArgs {
    fn scheduler_config(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            batch_size: self.batch_size,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            retry_base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            instance_id: self.instance_id.clone().unwrap_or(defaults.instance_id),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Worker(args) => run_worker(args).await,
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(())
        }
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let definition: AutomationDefinition =
                serde_json::from_str(&content).context("invalid automation JSON")?;

            match engine::validate_definition(&definition) {
                Ok(order) => {
                    println!("Automation '{}' is valid. Node order: {order:?}", definition.name);
                    Ok(())
                }
                Err(e) => bail!("validation failed: {e}"),
            }
        }
    }
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let config = args.scheduler_config();
    config.validate().context("refusing to start the scheduler")?;
    info!(instance_id = %config.instance_id, "Starting scheduler worker");

    let pool = db::pool::create_pool(&args.database_url, args.max_connections)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(db::PgStore::new(pool));

    let client = reqwest::Client::builder()
        .timeout(config.send_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let http = Arc::new(HttpCollaborators::new(
        client,
        HttpEndpoints {
            send_url: args.send_endpoint,
            lists_url: args.lists_endpoint,
            contacts_url: args.contacts_endpoint,
        },
    ));
    let collaborators = Collaborators { sender: http.clone(), lists: http.clone(), contacts: http };

    let scheduler = Scheduler::new(store, collaborators, config);
    scheduler
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_args(extra: &[&str]) -> WorkerArgs {
        let mut argv = vec![
            "automation-engine",
            "worker",
            "--database-url",
            "postgres://localhost/automations",
            "--send-endpoint",
            "http://mailer/send",
            "--lists-endpoint",
            "http://lists/members",
            "--contacts-endpoint",
            "http://contacts/lookup",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Worker(args) => args,
            _ => panic!("expected the worker subcommand"),
        }
    }

    #[test]
    fn retry_cap_is_configurable() {
        let config = worker_args(&["--max-retry-delay-secs", "120", "--instance-id", "w1"])
            .scheduler_config();
        assert_eq!(config.max_retry_delay, Duration::from_secs(120));
        assert_eq!(config.instance_id, "w1");
        assert_eq!(config.backoff(5), Duration::from_secs(120));
    }

    #[test]
    fn default_worker_config_is_valid() {
        let config = worker_args(&[]).scheduler_config();
        assert_eq!(config.max_retry_delay, Duration::from_secs(3600));
        config.validate().unwrap();
    }

    #[test]
    fn short_lease_is_rejected() {
        let config = worker_args(&["--lease-duration-secs", "40", "--send-timeout-secs", "30"])
            .scheduler_config();
        assert!(config.validate().is_err());
    }
}

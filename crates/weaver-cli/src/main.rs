//! weaver CLI - 全ロールの単一エントリポイント
//!
//! migrator / worker / scheduler / producer はすべてこのバイナリのサブコマンド。
//! プロセス同士は broker と datastore を通してしか話さない。

mod commands;
mod handlers;

use clap::{Parser, Subcommand};
use commands::{
    DeadLettersCommand, DemoCommand, EnqueueCommand, MigrateCommand, SchedulerCommand,
    SchedulesCommand, WorkerCommand,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "weaver", author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). Ignored when RUST_LOG is set
    #[arg(long, default_value = "info", env = "WEAVER_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full, json
    #[arg(long, default_value = "compact", env = "WEAVER_LOG_FORMAT", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate(MigrateCommand),
    /// Lease and execute jobs until interrupted
    Worker(WorkerCommand),
    /// Fire periodic schedules until interrupted
    Scheduler(SchedulerCommand),
    /// Enqueue one job
    Enqueue(EnqueueCommand),
    /// Inspect or replay dead-lettered jobs
    DeadLetters(DeadLettersCommand),
    /// Inspect the schedule table
    Schedules(SchedulesCommand),
    /// Run producer, workers and scheduler in one process against in-memory adapters
    Demo(DemoCommand),
}

fn init_tracing(log_level: &str, log_format: &str) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(format!(
            "weaver={level},weaver_core={level},weaver_pg={level},sqlx=warn",
            level = log_level
        ))?,
    };

    let fmt_layer = match log_format {
        "json" => tracing_subscriber::fmt::layer().json().boxed(),
        "full" => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Commands::Migrate(cmd) => cmd.execute().await,
        Commands::Worker(cmd) => cmd.execute().await,
        Commands::Scheduler(cmd) => cmd.execute().await,
        Commands::Enqueue(cmd) => cmd.execute().await,
        Commands::DeadLetters(cmd) => cmd.execute().await,
        Commands::Schedules(cmd) => cmd.execute().await,
        Commands::Demo(cmd) => cmd.execute().await,
    }
}

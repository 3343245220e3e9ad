//! memwake - background scheduler for memory notifications.
//!
//! Usage:
//!   memwake run                          Arm the schedule and run the queue until Ctrl-C
//!   memwake schedule-debug --minutes N   Queue one diagnostic run N minutes from now
//!   memwake reschedule                   Recompute and replace both wake slots
//!   memwake list                         Print queued work as JSON

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use memwake_core::{
    config::{WORK_NAME_SLOT_1, WORK_NAME_SLOT_2},
    MemwakeConfig,
};
use memwake_engine::{
    Entrypoint, EntrypointRegistry, LifecycleManager, LocalEngineFactory, LocalLoader,
};
use memwake_scheduler::{QueueRunner, SqliteWorkQueue, WorkSubmitter};
use tracing::{info, warn};

mod bridges;
mod entrypoint;

#[derive(Parser)]
#[command(name = "memwake")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config (default: ~/.memwake/memwake.toml)
    #[arg(short, long, env = "MEMWAKE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Arm the schedule and process queued work until Ctrl-C
    Run,

    /// Queue an ad-hoc diagnostic run
    ScheduleDebug {
        /// Delay before the run; 0 runs as soon as possible
        #[arg(long, default_value = "0")]
        minutes: u64,
    },

    /// Recompute both wake slots, replacing any pending ones
    Reschedule,

    /// Print every queued work row as JSON
    List,
}

type Submitter = WorkSubmitter<SqliteWorkQueue>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "memwake_daemon=info,memwake_scheduler=info,memwake_engine=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = MemwakeConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        MemwakeConfig::default()
    });

    let queue = open_queue(&config.database.path)?;
    let submitter = Arc::new(WorkSubmitter::new(
        Arc::new(queue.clone()),
        config.schedule.window(),
        Duration::from_secs(config.schedule.backoff_base_secs),
    ));

    match cli.command {
        Commands::Run => run(config, queue, submitter).await,
        Commands::ScheduleDebug { minutes } => {
            submitter.schedule_debug(debug_delay(minutes))?;
            println!("debug run queued in {minutes} minute(s)");
            Ok(())
        }
        Commands::Reschedule => {
            let set = submitter.reschedule(Local::now().naive_local())?;
            for slot in set.tag([WORK_NAME_SLOT_1, WORK_NAME_SLOT_2]) {
                println!("{}  {}", slot.at.format("%a %Y-%m-%d %H:%M"), slot.name);
            }
            Ok(())
        }
        Commands::List => {
            let work = queue.list_work()?;
            println!("{}", serde_json::to_string_pretty(&work)?);
            Ok(())
        }
    }
}

fn open_queue(db_path: &str) -> anyhow::Result<SqliteWorkQueue> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)
        .with_context(|| format!("opening database {db_path}"))?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(SqliteWorkQueue::new(db)?)
}

async fn run(
    config: MemwakeConfig,
    queue: SqliteWorkQueue,
    submitter: Arc<Submitter>,
) -> anyhow::Result<()> {
    // Replacing on every start would keep pushing the slots into the future.
    let armed = [WORK_NAME_SLOT_1, WORK_NAME_SLOT_2]
        .iter()
        .map(|name| queue.get_work(name))
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .all(Option::is_some);
    if armed {
        info!("wake slots already armed");
    } else {
        submitter.reschedule(Local::now().naive_local())?;
    }

    let target = Entrypoint::new(
        config.worker.entrypoint_library.clone(),
        config.worker.entrypoint_name.clone(),
    );
    let registry = EntrypointRegistry::new();
    entrypoint::register(&registry, target.clone());

    let manager = LifecycleManager::new(
        Arc::new(LocalLoader::new()),
        Arc::new(LocalEngineFactory::new(registry)),
        bridges::build_bridge_set(&config.connectivity),
        submitter,
        target,
        Duration::from_secs(config.worker.init_timeout_secs),
    );
    let runner = QueueRunner::new(
        queue,
        Arc::new(manager),
        Duration::from_millis(config.queue.poll_interval_ms),
        Duration::from_secs(config.queue.job_timeout_secs),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner_task = tokio::spawn(runner.run(shutdown_rx));
    info!(window = %config.schedule.window(), "memwake daemon running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    runner_task.await?;
    Ok(())
}

/// Saturates instead of overflowing on absurd `--minutes` values.
fn debug_delay(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

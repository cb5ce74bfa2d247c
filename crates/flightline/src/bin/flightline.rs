//! Maintenance and ingestion CLI.
//!
//! `ingest` is what the upload server's completion hook invokes; `sweep`
//! and `disk-usage` are the operational maintenance entry points. The
//! sweep always exits 0 — failures are logged, and `--check-only` is the
//! reporting surface.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use flightline::db::{default_database_path, job_repo::JobFilter, Database};
use flightline::worker::{Executor, WorkerPool};
use flightline::{CommandToolRunner, Config, DispatchOutcome, Dispatcher, Ledger, UploadEvent};

#[derive(Parser)]
#[command(name = "flightline", version, about = "Geospatial ingestion and processing pipeline")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, env = "FLIGHTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root override (also usable without a config file).
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Feed one upload-completion event (JSON payload) through the
    /// dispatcher and process it.
    Ingest {
        /// Path to the event payload written by the upload server hook.
        event: PathBuf,
    },
    /// Run a retention sweep. Always exits 0; errors are logged.
    Sweep {
        /// Report what would be reclaimed without mutating anything.
        #[arg(long)]
        check_only: bool,
    },
    /// Calculate per-project disk usage.
    DiskUsage,
    /// List ledger jobs.
    Jobs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(message) => {
            log::error!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    let db = if config.is_test_mode {
        match Database::open_in_memory() {
            Ok(db) => db,
            Err(e) => {
                log::error!("Failed to open in-memory database: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        let db_path = config
            .database_path
            .clone()
            .or_else(default_database_path);
        let Some(db_path) = db_path else {
            log::error!("No database path configured and no home directory found");
            return ExitCode::FAILURE;
        };
        match Database::open(&db_path) {
            Ok(db) => db,
            Err(e) => {
                log::error!("Failed to open database {}: {}", db_path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    };

    let tools = Arc::new(CommandToolRunner::new(&config.tools));
    let executor = Arc::new(Executor::new(Arc::clone(&config), db.clone(), tools));
    let pool = WorkerPool::new(executor, config.worker_count);
    let dispatcher = Dispatcher::new(Arc::clone(&config), db.clone(), pool.sender());
    let ledger = Ledger::new(db);

    let code = match cli.command {
        Command::Ingest { event } => run_ingest(&dispatcher, &event),
        Command::Sweep { check_only } => run_sweep(&dispatcher, &ledger, check_only),
        Command::DiskUsage => run_disk_usage(&dispatcher, &ledger),
        Command::Jobs {
            status,
            name,
            limit,
        } => run_jobs(&ledger, status, name, limit),
    };

    // The dispatcher holds a task sender; drop it so the pool can drain
    // the queue and the workers can observe disconnection.
    drop(dispatcher);
    pool.wait();
    code
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    // fmt's default features bridge `log` records into tracing, so the
    // library's log macros and spans land in one place.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn resolve_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match (&cli.config, &cli.storage_root) {
        (Some(path), _) => flightline::load_config(path)
            .map_err(|e| format!("Failed to load config {}: {}", path.display(), e))?,
        (None, Some(root)) => Config::with_storage_root(root),
        (None, None) => {
            return Err("Provide --config or --storage-root".to_string());
        }
    };
    if let Some(root) = &cli.storage_root {
        config.storage_root = root.clone();
    }
    Ok(config)
}

fn run_ingest(dispatcher: &Dispatcher, event_path: &PathBuf) -> ExitCode {
    let payload = match std::fs::read_to_string(event_path) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!("Failed to read event {}: {}", event_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let event: UploadEvent = match serde_json::from_str(&payload) {
        Ok(event) => event,
        Err(e) => {
            log::error!("Malformed upload event: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match dispatcher.handle_event(&event) {
        Ok(DispatchOutcome::Accepted {
            job_id,
            artifact_id,
        }) => {
            println!("accepted job={} artifact={}", job_id, artifact_id);
            ExitCode::SUCCESS
        }
        Ok(DispatchOutcome::Duplicate { job_id }) => {
            println!("duplicate job={}", job_id);
            ExitCode::SUCCESS
        }
        Ok(DispatchOutcome::Ignored) => {
            println!("ignored");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Upload rejected: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_sweep(dispatcher: &Dispatcher, ledger: &Ledger, check_only: bool) -> ExitCode {
    // Exit code is 0 regardless of outcome; the report (or the log) is
    // the operational surface.
    match dispatcher.request_sweep(check_only) {
        Ok(DispatchOutcome::Accepted { job_id, .. }) => {
            wait_and_print_extra(ledger, &job_id);
        }
        Ok(_) => {}
        Err(e) => log::error!("Sweep failed to start: {}", e),
    }
    ExitCode::SUCCESS
}

fn run_disk_usage(dispatcher: &Dispatcher, ledger: &Ledger) -> ExitCode {
    match dispatcher.request_disk_usage() {
        Ok(DispatchOutcome::Accepted { job_id, .. }) => {
            wait_and_print_extra(ledger, &job_id);
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Disk usage job failed to start: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Polls the job until it reaches COMPLETED, then prints its extra bag.
fn wait_and_print_extra(ledger: &Ledger, job_id: &str) {
    use flightline::JobState;

    loop {
        match ledger.find(job_id) {
            Ok(Some(job)) if job.state == JobState::Completed => {
                if let Some(extra) = job.extra {
                    match serde_json::to_string_pretty(&extra) {
                        Ok(pretty) => println!("{}", pretty),
                        Err(_) => println!("{}", extra),
                    }
                }
                println!("job={} status={}", job.id, job.status.as_str());
                return;
            }
            Ok(Some(_)) => {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Ok(None) => {
                log::error!("Job {} disappeared", job_id);
                return;
            }
            Err(e) => {
                log::error!("Failed to poll job {}: {}", job_id, e);
                return;
            }
        }
    }
}

fn run_jobs(
    ledger: &Ledger,
    status: Option<String>,
    name: Option<String>,
    limit: u64,
) -> ExitCode {
    let filter = JobFilter {
        name,
        status,
        limit: Some(limit),
        ..Default::default()
    };
    match ledger.list(&filter) {
        Ok((jobs, total)) => {
            for job in &jobs {
                println!(
                    "{}  {:<24} {:<9} {:<10} {}",
                    job.id,
                    job.name,
                    job.state.as_str(),
                    job.status.as_str(),
                    job.start_time.to_rfc3339()
                );
            }
            println!("{} of {} jobs", jobs.len(), total);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Failed to list jobs: {}", e);
            ExitCode::FAILURE
        }
    }
}

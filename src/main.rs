mod chat_notify;
mod config;
mod drive;
mod flexible_json;
mod heuristics;
mod invoice;
mod llm_extract;
mod pdf_extract;
mod pipeline;
mod purchase_order;
mod record_db;
mod report;
mod scheduler;
mod validator;
mod webhook;

use clap::{Parser, Subcommand};
use config::Config;
use pipeline::{CycleOutcome, Pipeline};
use record_db::RecordStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use validator::Validator;

/// Invoice vs purchase-order reconciliation service.
#[derive(Parser)]
#[command(name = "invoice_reconcile", version)]
struct Cli {
    /// Path to the TOML config file; missing file means defaults.
    #[arg(long, default_value = "config/invoice_reconcile.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook and the daily validation scheduler
    Serve,
    /// Run one validation cycle now
    Validate,
    /// Print record counts and the anomaly breakdown
    Stats {
        /// Show one record instead
        #[arg(long)]
        record: Option<i64>,
    },
}

/// Daily-rotated log file; `path` names the directory and file prefix.
fn log_appender(path: &Path, max_files: usize) -> Result<RollingFileAppender, InitError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("invoice_reconcile.log");
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(max_files)
        .build(dir)
}

/// Stdout always, plus the log file when configured. Keep the guard alive
/// until exit so buffered lines are flushed.
fn init_tracing(cfg: &Config) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    let (file_layer, guard) = match cfg.log_file.as_deref() {
        Some(path) => {
            let (writer, guard) =
                tracing_appender::non_blocking(log_appender(Path::new(path), cfg.log_max_files)?);
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn build_pipeline(
    cfg: &Config,
    store: Arc<RecordStore>,
) -> Result<Pipeline, Box<dyn std::error::Error>> {
    let extractor = llm_extract::build_extractor(&cfg.llm)?;
    let comparator = llm_extract::build_comparator(&cfg.llm)?;
    let storage = drive::build_storage(&cfg.storage).await?;
    let notifier = chat_notify::build_notifier(cfg.chat.webhook_url.as_deref());

    let validator = Validator::new(store, extractor, comparator);
    Ok(Pipeline::new(validator, storage, notifier, &cfg.reports_dir).with_folders(
        cfg.storage.reports_folder_id.clone(),
        cfg.storage.invoices_folder_id.clone(),
    ))
}

async fn serve(cfg: &Config, store: Arc<RecordStore>) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = Arc::new(build_pipeline(cfg, Arc::clone(&store)).await?);

    let scheduler = if cfg.schedule.enabled {
        let schedule = cfg.schedule.daily()?;
        info!(
            time = %cfg.schedule.validation_time,
            offset = %cfg.schedule.utc_offset,
            "Daily validation scheduled"
        );
        Some(scheduler::spawn(schedule, pipeline))
    } else {
        warn!("Scheduler disabled; run `validate` to process records");
        None
    };

    let state = Arc::new(webhook::AppState { store });
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown requested");
    };
    let served = webhook::serve(&cfg.server, state, shutdown).await;

    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    served?;
    Ok(())
}

fn print_stats(store: &RecordStore) -> Result<(), Box<dyn std::error::Error>> {
    let counts = store.get_counts()?;
    info!(
        total = counts.total,
        processed = counts.processed,
        pending = counts.pending,
        anomalies = counts.anomalies,
        "Database statistics"
    );
    println!("Records:   {}", counts.total);
    println!("Processed: {}", counts.processed);
    println!("Pending:   {}", counts.pending);
    println!("Anomalies: {}", counts.anomalies);
    for (kind, count) in store.anomaly_breakdown()? {
        println!("  {:<36} {}", kind.label(), count);
    }
    Ok(())
}

fn print_record(store: &RecordStore, id: i64) -> Result<(), Box<dyn std::error::Error>> {
    let record = store
        .get_record(id)?
        .ok_or(record_db::StoreError::NotFound(id))?;
    for line in record.detail_lines()? {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e.into());
        }
    }
    let cfg = Config::load_or_default(&cli.config)?;

    // init tracing
    let _log_guard = init_tracing(&cfg)?;

    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let store = Arc::new(RecordStore::open(&cfg.db_path)?);
    info!(db = %cfg.db_path, config = %cli.config.display(), "Store opened");

    match cli.command {
        Command::Serve => serve(&cfg, store).await?,
        Command::Validate => {
            let pipeline = build_pipeline(&cfg, store).await?;
            match pipeline.run_cycle().await {
                CycleOutcome::Idle => info!("Nothing to validate"),
                CycleOutcome::Published { link, summary, .. } => info!(
                    link = %link,
                    total = summary.total,
                    anomalies = summary.anomalies,
                    "Report published"
                ),
                CycleOutcome::Failed(e) => return Err(e.into()),
            }
        }
        Command::Stats { record: None } => print_stats(&store)?,
        Command::Stats { record: Some(id) } => print_record(&store, id)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_appender_writes_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut appender = log_appender(&dir.path().join("logs").join("app.log"), 5).unwrap();
        appender.write_all(b"validation started\n").unwrap();
        appender.flush().unwrap();

        let files: Vec<String> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("app.log"));
        let written = std::fs::read_to_string(dir.path().join("logs").join(&files[0])).unwrap();
        assert_eq!(written, "validation started\n");
    }
}

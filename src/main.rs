//! biosync CLI
//!
//! Collect physiological readings, sync them between devices and query
//! the ingested store.

use anyhow::{anyhow, bail, Context, Result};
use biosync::{
    collector::{check_permission, Producer, SampleWriter, SensorKind, SyntheticProducer},
    config::Config,
    core::parser::parse_timestamp,
    store::Store,
    sync::{
        run_retention, DirectoryTransport, RetentionPolicy, ScheduleConfig, SyncAttempt,
        SyncCoordinator, SyncPaths, SyncRole, SyncScheduler, SyncStatus,
    },
    transparency::{create_shared_log_with_persistence, PipelineLog},
    DATA_DECLARATION, VERSION,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "biosync")]
#[command(version = VERSION)]
#[command(about = "Physiological sample logging and device-to-device sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log readings from the synthetic generator until Ctrl+C
    Collect {
        /// Synthetic generation rate in Hz (defaults to the configured rate)
        #[arg(long)]
        rate: Option<u32>,
    },

    /// Run one sync attempt now
    Sync {
        /// Which side of the link this device is
        #[arg(long, value_parser = parse_role)]
        role: SyncRole,
    },

    /// Run periodic sync until Ctrl+C
    Run {
        #[arg(long, value_parser = parse_role)]
        role: SyncRole,
    },

    /// Print stored records of one sensor kind
    Query {
        #[arg(long, value_parser = parse_kind)]
        kind: SensorKind,

        /// Inclusive lower bound (RFC 3339)
        #[arg(long, value_parser = parse_instant)]
        from: Option<DateTime<Utc>>,

        /// Inclusive upper bound (RFC 3339)
        #[arg(long, value_parser = parse_instant)]
        to: Option<DateTime<Utc>>,

        #[arg(long, value_enum, default_value = "csv")]
        format: OutputFormat,
    },

    /// Delete aged records and excess received archives
    Retain {
        /// Delete records older than this instant (RFC 3339)
        #[arg(long, value_parser = parse_instant, conflicts_with = "older_than_days")]
        before: Option<DateTime<Utc>>,

        /// Delete records older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Pause data collection
    Pause,

    /// Resume data collection
    Resume,

    /// Show pipeline status
    Status,

    /// Display the data handling declaration
    Declaration,

    /// Show configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

fn parse_role(s: &str) -> Result<SyncRole, String> {
    s.parse()
}

fn parse_kind(s: &str) -> Result<SensorKind, String> {
    s.parse()
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(s).ok_or_else(|| format!("'{s}' is not an RFC 3339 instant"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect { rate } => cmd_collect(rate),
        Commands::Sync { role } => runtime()?.block_on(cmd_sync(role)),
        Commands::Run { role } => runtime()?.block_on(cmd_run(role)),
        Commands::Query {
            kind,
            from,
            to,
            format,
        } => cmd_query(kind, from, to, format),
        Commands::Retain {
            before,
            older_than_days,
        } => cmd_retain(before, older_than_days),
        Commands::Pause => cmd_set_paused(true),
        Commands::Resume => cmd_set_paused(false),
        Commands::Status => cmd_status(),
        Commands::Declaration => {
            println!("{DATA_DECLARATION}");
            Ok(())
        }
        Commands::Config => cmd_config(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn cmd_collect(rate: Option<u32>) -> Result<()> {
    println!("biosync v{VERSION}");
    println!();

    let config = Config::load().unwrap_or_default();
    config
        .ensure_directories()
        .context("could not create data directories")?;
    let rate = rate.unwrap_or(config.synthetic_rate_hz);

    let log = create_shared_log_with_persistence(config.stats_path());
    let writer = SampleWriter::builder(&config.data_dir)
        .permission_gate(check_permission)
        .log(log.clone())
        .build();

    println!("Logging to {}", config.data_dir.display());
    println!("  Synthetic respiration + EDA: {rate} Hz");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    let producers = || -> Vec<Box<dyn Producer>> { vec![Box::new(SyntheticProducer::new(rate))] };

    // Support pause/resume from another process by polling the config file.
    let mut paused = config.paused;
    if paused {
        println!("Collection is currently paused.");
        println!("Run `biosync resume` to start collecting.");
        println!();
    } else {
        writer.start_collection(producers())?;
    }

    let mut last_config_check = std::time::Instant::now();
    while running.load(Ordering::SeqCst) {
        if last_config_check.elapsed() >= Duration::from_secs(1) {
            if let Ok(cfg) = Config::load() {
                if cfg.paused != paused {
                    paused = cfg.paused;
                    if paused {
                        println!("Pausing collection...");
                        writer.stop_collection()?;
                    } else {
                        println!("Resuming collection...");
                        writer.start_collection(producers())?;
                    }
                }
            }
            last_config_check = std::time::Instant::now();
        }
        thread::sleep(Duration::from_millis(100));
    }

    println!();
    println!("Stopping collection...");
    writer.stop_collection()?;
    if let Err(e) = log.save() {
        eprintln!("Warning: could not save pipeline stats: {e}");
    }

    println!();
    println!("{}", log.summary());
    Ok(())
}

/// Build a coordinator from the on-disk configuration.
fn coordinator(config: &Config) -> Result<(Arc<SyncCoordinator>, Arc<PipelineLog>)> {
    let store = Store::open(config.store_config())
        .with_context(|| format!("could not open {}", config.database_path.display()))?;
    let log = create_shared_log_with_persistence(config.stats_path());
    let transport = Arc::new(DirectoryTransport::new(&config.spool_dir));

    let coordinator = SyncCoordinator::new(store, transport, SyncPaths::from_config(config))
        .with_channel(config.channel.clone())
        .with_log(log.clone());
    Ok((Arc::new(coordinator), log))
}

async fn cmd_sync(role: SyncRole) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let (coordinator, log) = coordinator(&config)?;

    let attempt = coordinator.sync_once(role).await;
    if let Err(e) = log.save() {
        eprintln!("Warning: could not save pipeline stats: {e}");
    }

    match attempt {
        SyncAttempt::Completed(SyncStatus::Error { message, .. }) => bail!("sync failed: {message}"),
        SyncAttempt::Completed(status) => {
            println!("{status}");
            Ok(())
        }
        SyncAttempt::Rejected => bail!("a sync attempt is already in progress"),
    }
}

async fn cmd_run(role: SyncRole) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let (coordinator, log) = coordinator(&config)?;
    let schedule = ScheduleConfig::from_config(&config);

    println!("biosync v{VERSION}");
    println!(
        "Periodic {role} every {}s (flex {}s), channel {}",
        schedule.interval.as_secs(),
        schedule.flex.as_secs(),
        config.channel
    );
    println!("Press Ctrl+C to stop");
    println!();

    let scheduler = SyncScheduler::new(coordinator.clone(), schedule);
    scheduler.schedule(role);

    let mut states = coordinator.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = states.borrow_and_update().clone();
                println!("[{}] {status}", Utc::now().format("%H:%M:%S"));
                if status.is_terminal() {
                    if let Err(e) = log.save() {
                        eprintln!("Warning: could not save pipeline stats: {e}");
                    }
                }
            }
        }
    }

    scheduler.cancel_all();
    println!();
    println!("{}", log.summary());
    Ok(())
}

fn cmd_query(
    kind: SensorKind,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    format: OutputFormat,
) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let store = Store::open(config.store_config())?;

    let (from, to) = query_bounds(from, to);
    let records = store.range_records(kind, from, to)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Csv => {
            println!("{}", kind.csv_header());
            for record in &records {
                let values: Vec<String> = record.values().iter().map(f64::to_string).collect();
                println!(
                    "{},{}",
                    biosync::collector::types::format_timestamp(record.timestamp()),
                    values.join(",")
                );
            }
        }
    }
    Ok(())
}

/// Missing bounds are open, so records stamped ahead of this device's
/// clock are still listed.
fn query_bounds(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        from.unwrap_or(DateTime::<Utc>::MIN_UTC),
        to.unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

fn cmd_retain(before: Option<DateTime<Utc>>, older_than_days: Option<u32>) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let store = Store::open(config.store_config())?;

    let store_cutoff = match (before, older_than_days) {
        (Some(cutoff), _) => Some(cutoff),
        (None, Some(days)) => Some(Utc::now() - chrono::Duration::days(i64::from(days))),
        (None, None) => None,
    };

    let report = run_retention(
        &store,
        &config.inbox_dir,
        &RetentionPolicy {
            store_cutoff,
            archive_keep: config.archive_keep,
        },
    )?;

    println!("Records deleted: {}", report.records_deleted);
    println!("Archives deleted: {}", report.archives_deleted.len());
    for path in &report.archives_deleted {
        println!("  {}", path.display());
    }
    Ok(())
}

fn cmd_set_paused(paused: bool) -> Result<()> {
    let mut config = Config::load().unwrap_or_default();
    config.paused = paused;
    config.save().context("error saving config")?;
    if paused {
        println!("Collection paused. Use 'biosync resume' to continue.");
    } else {
        println!("Collection resumed.");
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("biosync Status");
    println!("==============");
    println!();
    println!(
        "Sensor Permission: {}",
        if check_permission() {
            "Granted ✓"
        } else {
            "Not Granted ✗"
        }
    );
    println!();

    println!("Configuration:");
    println!("  Logs: {}", config.data_dir.display());
    println!("  Database: {}", config.database_path.display());
    println!("  Channel: {}", config.channel);
    println!(
        "  Sync every {}s (flex {}s)",
        config.sync_interval.as_secs(),
        config.sync_flex.as_secs()
    );
    println!("  Paused: {}", config.paused);
    println!();

    if config.database_path.exists() {
        let store = Store::open(config.store_config())?;
        println!("Stored Records:");
        for kind in SensorKind::ALL {
            println!("  {kind}: {}", store.count(kind)?);
        }
        println!();
    }

    let stats_path = config.stats_path();
    if stats_path.exists() {
        println!("{}", PipelineLog::with_persistence(stats_path).summary());
    } else {
        println!("No previous session data found.");
    }
    Ok(())
}

fn cmd_config() -> Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {}", Config::config_path().display());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl+C handler: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use biosync::core::records::HeartRate;

    #[test]
    fn test_query_without_upper_bound_includes_future_records() {
        let store = Store::open_in_memory().unwrap();
        let ahead = Utc::now() + chrono::Duration::days(1);
        store
            .insert_batch(&[HeartRate {
                id: None,
                timestamp: ahead,
                rate: 64.0,
                confidence: 1.0,
            }])
            .unwrap();

        let (from, to) = query_bounds(None, None);
        let records = store.range_records(SensorKind::HeartRate, from, to).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_query_bounds_keep_explicit_values() {
        let at = parse_instant("2024-01-01T10:00:00Z").unwrap();
        assert_eq!(query_bounds(Some(at), Some(at)), (at, at));
    }
}

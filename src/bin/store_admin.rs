//! Store Admin - operator CLI for the candle store
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin store_admin -- <COMMAND> [OPTIONS]
//! ```
//!
//! Commands:
//! - `compact`                              VACUUM + ANALYZE + REINDEX
//! - `cleanup [--days N] [--execute]`       retention cleanup (dry run unless --execute)
//! - `backup [--compact] [--dest DIR]`      full (default) or size-reduced backup
//! - `restore <DIR>`                        restore from a backup archive
//! - `list-backups`                         archives in BACKUP_DIR, newest first
//! - `quality [SYMBOL]`                     quality report
//! - `coherence`                            cross-timeframe coherence summary
//! - `stats`                                row counts and sizes
//! - `oplog [--limit N]`                    recent operation log entries
//! - `scheduler`                            run periodic maintenance until Ctrl-C
//!
//! Reports are printed to stdout as JSON; logs go to stderr.
//!
//! ## Environment Variables
//!
//! - `CANDLESTORE_DB_PATH` - store file (default: data/candlestore.db)
//! - `BACKUP_DIR`, `BACKUP_TRACKED_DIRS`, `RETENTION_DAYS`,
//!   `MAINTENANCE_INTERVAL_SECS` - see `StoreConfig::from_env`
//! - `RUST_LOG` - log level (default: info)

use candlestore::store::scheduler::maintenance_scheduler_task;
use candlestore::store::{BackupKind, CancelFlag, RetentionPolicy};
use candlestore::{CandleStore, StoreConfig};
use dotenv::dotenv;
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

const USAGE: &str = "Usage: store_admin <compact|cleanup|backup|restore|list-backups|quality|coherence|stats|oplog|scheduler> [OPTIONS]";

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// First argument after the command that is not a flag or a flag's value
fn positional(args: &[String], value_flags: &[&str]) -> Option<String> {
    let mut iter = args.iter().skip(2);
    while let Some(arg) = iter.next() {
        if value_flags.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        if !arg.starts_with("--") {
            return Some(arg.clone());
        }
    }
    None
}

fn parse_number<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
    match flag_value(args, flag) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("Invalid value for {}: {}", flag, raw)),
        None => Ok(None),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).cloned().ok_or(USAGE)?;

    let config = StoreConfig::from_env();
    info!("🛠️  Store Admin: {}", command);
    info!("   ├─ Database: {}", config.db_path.display());
    info!("   └─ Backups: {}", config.backup_dir.display());

    let store = CandleStore::open(config)?;
    let cancel = CancelFlag::new();

    match command.as_str() {
        "compact" => {
            let report = store.compact(&cancel)?;
            print_json(&report)?;
        }
        "cleanup" => {
            let days = parse_number::<u32>(&args, "--days")?
                .unwrap_or(store.config().retention.max_age_days);
            let execute = has_flag(&args, "--execute");
            if !execute {
                info!("🔎 Dry run (pass --execute to delete)");
            }
            let report = store.cleanup(RetentionPolicy::days(days), !execute, &cancel)?;
            print_json(&report)?;
        }
        "backup" => {
            let kind = if has_flag(&args, "--compact") {
                BackupKind::Compact
            } else {
                BackupKind::Full
            };
            let record = match flag_value(&args, "--dest") {
                Some(dest) => store.backup_to(kind, &PathBuf::from(dest), &cancel),
                None => store.backup(kind, &cancel),
            };
            print_json(&record)?;
            if !record.succeeded() {
                return Err(format!(
                    "backup {}: {}",
                    record.status,
                    record.error.unwrap_or_default()
                )
                .into());
            }
        }
        "restore" => {
            let archive = positional(&args, &[]).ok_or("Usage: store_admin restore <DIR>")?;
            let report = store.restore(&PathBuf::from(archive), &cancel);
            print_json(&report)?;
            if !report.record.succeeded() {
                return Err(format!(
                    "restore {}: {}",
                    report.record.status,
                    report.record.error.unwrap_or_default()
                )
                .into());
            }
        }
        "list-backups" => {
            print_json(&store.list_backups()?)?;
        }
        "quality" => {
            let symbol = positional(&args, &[]);
            let report = store.analyze(symbol.as_deref())?;
            print_json(&report)?;
        }
        "coherence" => {
            print_json(&store.get_coherence_stats(None)?)?;
        }
        "stats" => {
            print_json(&store.stats()?)?;
        }
        "oplog" => {
            let limit = parse_number::<usize>(&args, "--limit")?.unwrap_or(20);
            print_json(&store.recent_operations(limit, None)?)?;
        }
        "scheduler" => {
            let store = Arc::new(store);
            let period = store.config().maintenance_interval();
            let policy = store.config().retention;

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async move {
                let (tx, rx) = watch::channel(false);
                let task = tokio::spawn(maintenance_scheduler_task(
                    Arc::clone(&store),
                    period,
                    policy,
                    rx,
                ));

                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("❌ Failed to listen for Ctrl-C: {}", e);
                }
                info!("🛑 Ctrl-C received, stopping scheduler");
                let _ = tx.send(true);
                if let Err(e) = task.await {
                    log::error!("❌ Scheduler task failed: {}", e);
                }

                // The task has exited, so this is the last handle
                if let Ok(store) = Arc::try_unwrap(store) {
                    if let Err(e) = store.close() {
                        log::error!("❌ Close failed: {}", e);
                    }
                }
            });
            return Ok(());
        }
        other => {
            return Err(format!("Unknown command '{}'. {}", other, USAGE).into());
        }
    }

    store.close()?;
    Ok(())
}

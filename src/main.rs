//! partbackup — deduplicated, incremental backup and restore of a columnar
//! database's immutable data parts, with catalog-driven retention and GC.

mod backup;
mod catalog;
mod config;
mod errors;
mod hash;
mod partstore;
mod restore;
mod retention;
mod retry;
mod source;
mod storage;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::backup::TableOutcome as BackupTableOutcome;
use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::restore::TableOutcome as RestoreTableOutcome;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = PathBuf::from("config.json");
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    // Cooperative cancellation: Ctrl-C stops backups/restores at table
    // boundaries without leaving half-written catalog references.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("⚠️ Cancellation requested; finishing in-flight tables...");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let result = backup::run_backup_flow(&app_config, cancel)
                .await
                .context("Backup process failed")?;
            println!("Backup {} finalized as {}", result.id, result.state);
            for report in &result.per_table {
                match &report.outcome {
                    BackupTableOutcome::Success {
                        parts_stored,
                        parts_reused,
                        uploaded_bytes,
                    } => println!(
                        "  ✓ {}: {} uploaded, {} reused, {} bytes transferred",
                        report.table, parts_stored, parts_reused, uploaded_bytes
                    ),
                    BackupTableOutcome::Failed { error } => {
                        println!("  ✗ {}: {error}", report.table)
                    }
                }
            }
        }
        "2" | "restore" => {
            println!("🔄 Starting Restore Process...");
            let result = restore::run_restore_flow(&app_config, cancel)
                .await
                .context("Restore process failed")?;
            println!("Restore of backup {}:", result.backup_id);
            for report in &result.per_table {
                match &report.outcome {
                    RestoreTableOutcome::Success { parts_fetched } => {
                        println!("  ✓ {}: {parts_fetched} parts restored", report.table)
                    }
                    RestoreTableOutcome::Failed { error } => {
                        println!("  ✗ {}: {error}", report.table)
                    }
                }
            }
        }
        "3" | "purge" => {
            println!("🧹 Starting Purge Process...");
            let report = retention::run_purge_flow(&app_config)
                .await
                .context("Purge process failed")?;
            println!(
                "Purged {} backups, deleted {} part blobs, kept {} still-referenced blobs",
                report.deleted_backups.len(),
                report.deleted_parts,
                report.skipped_parts
            );
            if !report.failed_deletes.is_empty() {
                println!(
                    "⚠️ {} blob deletions failed and will be retried next run",
                    report.failed_deletes.len()
                );
            }
        }
        "4" | "list" => {
            list_backups(&app_config).await.context("Listing backups failed")?;
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup), '2' (restore), '3' (purge), or '4' (list).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

async fn list_backups(app_config: &AppConfig) -> Result<()> {
    let driver =
        storage::driver_from_location(&app_config.storage_location, app_config.s3.as_ref()).await?;
    let catalog = Catalog::new(driver);
    let entries = catalog.list().await?;

    if entries.is_empty() {
        println!("No backups found.");
        return Ok(());
    }
    println!(
        "{:<17} {:<17} {:>7} {:>7} {:>14} {:>14}",
        "ID", "STATE", "TABLES", "PARTS", "TOTAL BYTES", "REUSED BYTES"
    );
    for entry in entries {
        println!(
            "{:<17} {:<17} {:>7} {:>7} {:>14} {:>14}",
            entry.id,
            entry.state.to_string(),
            entry.tables.len(),
            entry.part_count(),
            entry.total_bytes(),
            entry.reused_bytes()
        );
    }
    Ok(())
}

/// Prompts the user to select an operation when none was given on the
/// command line.
fn prompt_choice() -> Result<String> {
    use std::io::{stdin, stdout, Write};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. Purge Old Backups (or type 'purge')");
    println!("4. List Backups (or type 'list')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

//! backup-ctl - operator CLI for the research repository backups.

use anyhow::Result;
use backup_core::{config::Config, utils, BackupError, BackupType, Orchestrator};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new backup
    Create {
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Full)]
        backup_type: TypeArg,
    },
    /// Restore a stored backup (and its chain)
    Restore { backup_id: String },
    /// Import a download bundle and restore it
    RestoreFile { bundle: PathBuf },
    /// List backups, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Write a portable bundle of a backup
    Download {
        backup_id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the engine's current timeline
    Timeline,
    /// Check a backup against its integrity manifest
    Verify { backup_id: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TypeArg {
    Full,
    Incremental,
}

impl From<TypeArg> for BackupType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Full => BackupType::Full,
            TypeArg::Incremental => BackupType::Incremental,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let orchestrator = Orchestrator::from_config(&config, None)?;

    match run(&orchestrator, args.command).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.is_no_op() => {
            println!("no changes: {}", e);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("error [{}]: {}", e.kind(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(orchestrator: &Orchestrator, command: Command) -> std::result::Result<(), BackupError> {
    match command {
        Command::Create { backup_type } => {
            let record = orchestrator.create_backup(backup_type.into()).await?;
            println!("{}", record.backup_id);
        }
        Command::Restore { backup_id } => {
            let report = orchestrator.restore_backup(&backup_id, &interrupt_token()).await?;
            println!("restored {} (chain: {})", report.backup_id, report.chain.join(" -> "));
        }
        Command::RestoreFile { bundle } => {
            let report = orchestrator.restore_from_file(&bundle, &interrupt_token()).await?;
            println!("restored {} from {}", report.backup_id, bundle.display());
        }
        Command::List { json } => {
            let backups = orchestrator.list_backups()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else {
                println!("{:<32} {:<12} {:<26} {:>4} {:>14}  PARENT", "ID", "TYPE", "DATE", "TL", "SIZE");
                for b in backups {
                    println!(
                        "{:<32} {:<12} {:<26} {:>4} {:>14}  {}",
                        b.backup_id,
                        b.backup_type,
                        b.backup_date.format("%Y-%m-%d %H:%M:%S UTC"),
                        b.timeline_id,
                        b.total_size_bytes,
                        b.parent_backup_id.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Command::Download { backup_id, output } => {
            let bundle = orchestrator.download_backup(&backup_id).await?;
            if let Err(e) = tokio::fs::rename(&bundle, &output).await {
                // Work dir and output may be on different file systems.
                tracing::debug!(error = %e, "rename failed, copying bundle");
                tokio::fs::copy(&bundle, &output).await?;
                tokio::fs::remove_file(&bundle).await?;
            }
            println!("{}", output.display());
        }
        Command::Timeline => {
            println!("{}", orchestrator.current_timeline().await?);
        }
        Command::Verify { backup_id } => {
            let manifest = orchestrator.verify_backup(&backup_id).await?;
            println!("{} OK ({} files, {})", backup_id, manifest.file_hashes.len(), manifest.overall_hash);
        }
    }
    Ok(())
}

/// Ctrl+C cancels a restore that has not stopped the engine yet.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; restore stops if the engine is still up");
            child.cancel();
        }
    });
    token
}

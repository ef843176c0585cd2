use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sshdump::config::AppConfig;
use sshdump::context::JobContext;
use sshdump::core::{Backup, BackupReport, Connection, Registry};
use sshdump::logging;

#[derive(Parser)]
#[command(name = "sshdump")]
#[command(about = "Stream remote database dumps over SSH into storage destinations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: sshdump.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump and upload every database, or only the named ones
    Run(RunArgs),
    /// Upload an artifact that already exists on the remote host
    Upload(UploadArgs),
    /// Test the connection to every configured server
    Check,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long = "database")]
    databases: Vec<String>,
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    database: String,

    /// Remote path of the artifact
    #[arg(long)]
    artifact: String,
}

/// Command-line values layered over the file and the environment.
#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_parallel_uploads: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    retry_attempts: Option<u32>,

    #[command(flatten)]
    log: LogOverrides,
}

#[derive(Args, Serialize)]
struct LogOverrides {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref(), &cli.overrides)
        .context("Failed to load configuration")?;
    logging::init(&config.log);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match &cli.command {
        Commands::Run(args) => run_backups(&config, &args.databases, cancel)
            .await
            .context("Backup failed")?,
        Commands::Upload(args) => run_upload(&config, args, cancel)
            .await
            .context("Upload failed")?,
        Commands::Check => run_check(&config).await.context("Connection check failed")?,
    }

    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

async fn run_backups(config: &AppConfig, selected: &[String], cancel: CancellationToken) -> Result<()> {
    let jobs = config.jobs(selected)?;
    if jobs.is_empty() {
        bail!("no databases configured");
    }

    let registry = Arc::new(Registry::with_defaults());
    let mut failed = Vec::new();

    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        let database = job.database.clone();
        let ctx = JobContext::new(cancel.clone());
        let backup = Backup::new(job, registry.clone(), config.backup_settings());

        match backup.run(&ctx).await {
            Ok(report) => print_report(&report),
            Err(e) if e.is_cancelled() => {
                info!(database = %database, "Backup cancelled");
                failed.push(database);
                break;
            }
            Err(e) => {
                error!(database = %database, error = %e, "Backup failed");
                failed.push(database);
            }
        }
    }

    if cancel.is_cancelled() {
        bail!("cancelled");
    }
    if !failed.is_empty() {
        bail!("{} database(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

async fn run_upload(config: &AppConfig, args: &UploadArgs, cancel: CancellationToken) -> Result<()> {
    let job = config.job(&args.database)?;
    let backup = Backup::new(
        job,
        Arc::new(Registry::with_defaults()),
        config.backup_settings(),
    );

    let report = backup
        .upload_existing(&args.artifact, &JobContext::new(cancel))
        .await?;
    print_report(&report);
    Ok(())
}

async fn run_check(config: &AppConfig) -> Result<()> {
    let mut unreachable = 0;

    for (name, server) in &config.servers {
        let mut connection = Connection::new(server.ssh.clone());
        let outcome = match connection.connect().await {
            Ok(()) => connection.test_connection().await,
            Err(e) => Err(e),
        };
        connection.close();

        match outcome {
            Ok(()) => println!("{name:<16} {:<32} ok", server.ssh.addr()),
            Err(e) => {
                unreachable += 1;
                println!("{name:<16} {:<32} FAILED: {e}", server.ssh.addr());
            }
        }
    }

    if unreachable > 0 {
        bail!("{unreachable} server(s) unreachable");
    }
    Ok(())
}

fn print_report(report: &BackupReport) {
    let artifact = report
        .artifacts
        .last()
        .map(|a| a.file_name().to_string())
        .unwrap_or_default();
    println!(
        "{}: {} -> {}/{} destinations, {} bytes",
        report.database,
        artifact,
        report.upload.succeeded.len(),
        report.upload.targets(),
        report.upload.bytes
    );
    for failure in &report.upload.failed {
        println!("  {failure}");
    }
}

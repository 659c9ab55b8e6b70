use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cloud_exporter::config::Config;
use cloud_exporter::provider::InMemoryProvider;
use cloud_exporter::scheduler::Exporter;

/// Prometheus exporter for cloud monitoring metrics.
#[derive(Parser)]
#[command(name = "cloud-exporter", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Validate the configuration file and exit.
    Check,
}

/// Build-time version info, injected by build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, or "unknown".
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("cloud-exporter {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    if let Some(Command::Check) = &cli.command {
        println!(
            "{}: ok ({} jobs)",
            config_path.display(),
            cfg.aws.monitor.jobs.len()
        );
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting cloud-exporter",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let inventory_path = cfg
        .aws
        .inventory_file
        .clone()
        .context("aws.inventory_file is required")?;
    let api = Arc::new(
        InMemoryProvider::load(&inventory_path)
            .with_context(|| format!("loading inventory from {}", inventory_path.display()))?,
    );

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut exporter = Exporter::new(cfg, api)?;
    exporter.start().await?;

    let _ = shutdown_rx.await;

    exporter.stop().await?;

    tracing::info!("cloud-exporter stopped");

    Ok(())
}

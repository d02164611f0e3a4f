//! Certgate - Main entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use certgate_config::{validate::validate_runtime, Config};

/// Certgate - certificates for signed-request identities
#[derive(Parser, Debug)]
#[command(name = "certgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Override the listen address
    #[arg(long = "listen", env = "CERTGATE_LISTEN")]
    listen: Option<String>,

    /// Override the certificate base directory
    #[arg(long = "base-dir", env = "CERTGATE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Run the server (default)
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Test) => test_config(&cli, &config),
        Some(Commands::Run) | None => run_server(&cli, config),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }
    if let Some(base_dir) = &cli.base_dir {
        config.certificates.base_dir = base_dir.clone();
    }
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

/// Test configuration and exit
fn test_config(cli: &Cli, config: &Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let result = validate_runtime(config);
    for warning in &result.warnings {
        warn!("{}", warning.message);
    }
    if !result.is_ok() {
        for error in &result.errors {
            tracing::error!("{error}");
        }
        anyhow::bail!(
            "configuration test failed with {} error(s)",
            result.errors.len()
        );
    }

    info!("Configuration test successful:");
    info!("  - listen {}", config.server.listen);
    info!("  - base dir {}", config.certificates.base_dir.display());
    info!("  - issuer {}", config.issuer.command.display());

    let source = cli
        .config
        .as_ref()
        .map_or_else(|| "(defaults)".to_string(), |p| p.display().to_string());
    println!("certgate: configuration {source} test is successful");
    Ok(())
}

/// Run the server until SIGINT or SIGTERM
fn run_server(cli: &Cli, config: Config) -> Result<()> {
    certgate::logging::init(&config.logging, cli.verbose)?;

    match &cli.config {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("No configuration specified, using defaults"),
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    runtime.block_on(async {
        let handle = certgate::serve(&config)
            .await
            .context("Failed to start server")?;

        shutdown_signal().await;
        info!("Received shutdown signal, initiating graceful shutdown");
        handle.shutdown().await;
        Ok(())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

//! modelvault - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelvault::{
    Catalog, Downloader, Janitor, ManifestStore, SystemResources, VaultConfig, backend,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "modelvault")]
#[command(about = "Model artifact download, validation, and caching engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Force one model through the download state machine
    Download {
        /// Model name as declared in the catalog
        model: String,
    },

    /// Download catalog models in priority order (the startup path)
    Sync {
        /// Only download models marked required
        #[arg(long)]
        required_only: bool,
    },

    /// Evict cached models older than the threshold
    Cleanup {
        /// Maximum age in days before a cached model is evicted
        #[arg(long)]
        days: i64,
    },

    /// Re-validate all cached models; zero network, zero writes
    Validate,

    /// List catalog models with their cache status
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    let config = VaultConfig::load(cli.config)?;
    config.validate()?;

    tracing::info!(
        cache_dir = ?config.cache_dir,
        catalog = ?config.catalog_file,
        max_parallel = config.max_parallel_models,
        "Configuration loaded"
    );

    let catalog = Catalog::load(&config.catalog_file)
        .with_context(|| format!("Failed to load catalog {:?}", config.catalog_file))?;
    let manifest = Arc::new(ManifestStore::load(config.manifest_path()).await);

    let backends = backend::build_backends(
        &config.staging_dir(),
        config.request_timeout(),
        config.stall_timeout(),
    );

    let downloader = Arc::new(Downloader::new(
        catalog,
        manifest.clone(),
        backends,
        config.policy(),
        config.cache_dir.clone(),
    ));

    spawn_cancel_listener(&downloader);

    match cli.command {
        Command::Download { model } => {
            let resources = SystemResources::snapshot(&config.cache_dir);
            tracing::info!(
                free_disk = resources.free_disk,
                gpu_count = resources.gpu_count,
                "Resource snapshot taken"
            );

            match downloader.download(&model).await {
                Ok(()) => {
                    println!("cached   {}", model);
                }
                Err(e) => {
                    println!("failed   {}: {}", model, e);
                    std::process::exit(1);
                }
            }
        }

        Command::Sync { required_only } => {
            let resources = SystemResources::snapshot(&config.cache_dir);
            let report = downloader.sync(&resources, required_only).await?;

            for name in &report.cached {
                println!("cached   {}", name);
            }
            for name in &report.skipped {
                println!("skipped  {} (optional, over budget)", name);
            }
            for name in &report.failed_optional {
                println!("failed   {} (optional)", name);
            }
            for name in &report.failed_required {
                println!("failed   {} (required)", name);
            }

            if !report.success() {
                std::process::exit(1);
            }
        }

        Command::Cleanup { days } => {
            let janitor = Janitor::new(manifest, config.cache_dir.clone());
            let report = janitor.cleanup(days).await?;

            for name in &report.removed {
                println!("evicted  {}", name);
            }
            println!("{} evicted, {} retained", report.removed.len(), report.retained);
        }

        Command::Validate => {
            let outcomes = downloader.validate_all().await;

            let mut all_ok = true;
            for outcome in &outcomes {
                println!(
                    "{}  {}",
                    if outcome.ok { "pass" } else { "FAIL" },
                    outcome.model
                );
                all_ok &= outcome.ok;
            }
            println!("{} of {} cached models valid",
                outcomes.iter().filter(|o| o.ok).count(),
                outcomes.len()
            );

            if !all_ok {
                std::process::exit(1);
            }
        }

        Command::List => {
            let catalog = Catalog::load(&config.catalog_file)?;
            for model in catalog.by_priority() {
                let status = if downloader.phase(&model.name).is_some() {
                    "active"
                } else if manifest.get(&model.name).await.is_some() {
                    "cached"
                } else {
                    "missing"
                };
                println!(
                    "{:<10} p{:<3} {:>12}B {} {}",
                    status,
                    model.priority,
                    model.total_size,
                    if model.required { "required" } else { "optional" },
                    model.name
                );
            }
        }
    }

    Ok(())
}

/// Wire shutdown signals to the cooperative cancel flag
///
/// Transfers notice the flag at the next chunk boundary and clean up their
/// model directory exactly like a validation failure.
fn spawn_cancel_listener(downloader: &Arc<Downloader>) {
    let cancel = downloader.cancel_flag();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received, cancelling in-flight transfers");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}

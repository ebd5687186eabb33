//! gridflowd: the site queue daemon.
//!
//! Loads configuration, builds the batch adapter and queue client, then
//! runs reconciliation cycles on a fixed interval until told to stop.

use anyhow::Context;
use clap::Parser;
use gridflow::client::QueueClient;
use gridflow::config::Config;
use gridflow::core::adapter::create_adapter;
use gridflow::core::engine::ReconciliationEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(
    name = "gridflowd",
    version,
    about = "Queue daemon: reconciles pilots against the batch system and submits new ones"
)]
struct Args {
    /// Configuration file (defaults to the user config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn init_tracing(args: &Args) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = gridflow::get_data_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "gridflowd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(args.verbosity.tracing_level_filter().to_string())
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_tracing(&args)?;

    let config = Config::load(args.config.clone())?;
    let client = Arc::new(QueueClient::new(
        &config.service.address,
        config.service.token.as_deref(),
    )?);
    let adapter = create_adapter(config.queue.adapter, config.queue.batchopts.clone());
    let mut engine = ReconciliationEngine::builder(config.queue.clone())
        .with_client(client)
        .with_adapter(adapter)
        .build()?;

    tracing::info!(
        "gridflowd starting as {} against {}",
        config.queue.queue_host(),
        config.service.address
    );

    if args.once {
        engine.run_cycle().await?;
        return Ok(());
    }

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.queue.check_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.run_cycle().await {
                    // the next tick retries; cycles are not retried inline
                    tracing::error!("cycle failed: {e:#}");
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

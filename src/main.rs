use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poolwatch::watch::{self, WatchOptions};
use poolwatch::{CoreManager, SubscriberServer, WatchConfig};
use poolwatch_client::TcpConnector;
use poolwatch_types::HealthCheckConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "poolwatch")]
#[command(about = "Live aggregation of worker-pool telemetry", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor the configured cores and serve their telemetry to subscribers
    Serve {
        /// Path to the TOML configuration (default: ./poolwatch.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overriding the configuration
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Follow a single core and print what it reports
    Watch {
        /// Address of the core (host:port)
        #[arg(short, long)]
        addr: String,

        /// Poll interval (e.g. "1s", "500ms")
        #[arg(short, long, default_value = "1s")]
        interval: String,

        /// PEM certificate to trust; plain TCP when omitted
        #[arg(long)]
        cert_path: Option<PathBuf>,

        /// Intervals a thread may stay busy on one task before it is reported
        #[arg(long, default_value_t = 3)]
        max_working_interval_times: u32,

        /// Minimum share of busy threads before usage is reported as low
        #[arg(long, default_value_t = 0.5)]
        min_usage_rate: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    match args.command {
        Command::Serve { config, listen } => serve(config, listen, shutdown).await,
        Command::Watch {
            addr,
            interval,
            cert_path,
            max_working_interval_times,
            min_usage_rate,
        } => {
            let options = WatchOptions {
                addr,
                interval,
                cert_path,
                health_check: HealthCheckConfig {
                    max_working_interval_times,
                    min_usage_rate,
                },
            };
            watch::run(options, Arc::new(TcpConnector::new()), std::io::stdout(), shutdown).await
        }
    }
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        shutdown.cancel();
    });
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut config = WatchConfig::load(config_path.as_deref())?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.listen))?;

    let manager = Arc::new(CoreManager::from_config(
        &config,
        Arc::new(TcpConnector::new()),
    )?);
    tracing::info!(
        cores = manager.list_cores().len(),
        credentials = manager.credential_names().len(),
        "Monitoring started"
    );

    SubscriberServer::new(Arc::clone(&manager))
        .buffer(config.server.subscriber_buffer)
        .serve(listener, shutdown)
        .await?;

    manager.shutdown().await;
    Ok(())
}

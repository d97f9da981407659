//! cdn-s3 -- CDN edge gateway over regional S3-compatible replicas.
//!
//! The gateway keeps no state of its own beyond the optional Redis URL
//! cache, so SIGTERM/SIGINT only stop accepting connections and give
//! in-flight requests a bounded grace period.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cdn_s3::cache::connect_url_cache;
use cdn_s3::config::{Config, LoggingConfig};
use cdn_s3::gateway::Gateway;
use cdn_s3::registry::BackendRegistry;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "cdn-s3",
    version,
    about = "CDN gateway redirecting to presigned URLs across S3-compatible regions"
)]
struct Cli {
    /// Path to a YAML configuration file.  `CDN_*` environment variables
    /// (and `.env`) are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway.
    Start {
        /// Override the bind address (host:port).
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Upload a file to one bucket/region backend.
    ///
    /// Example: cdn-s3 upload avatars us ~/ava.jpg /public/user1/a.jpg
    Upload {
        /// Public bucket alias.
        bucket: String,
        /// Region alias.
        region: String,
        /// Local file (`~/` is expanded).
        local_file: String,
        /// Remote object path.
        remote_path: String,
    },
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("cdn-s3 {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => cdn_s3::config::load_config(path)?,
        None => cdn_s3::config::load_from_env()?,
    };
    init_tracing(&config.logging);
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("Loaded configuration from environment"),
    }

    match cli.command {
        Command::Start { bind } => start(config, bind).await,
        Command::Upload {
            bucket,
            region,
            local_file,
            remote_path,
        } => {
            let registry = BackendRegistry::build(&config.buckets)?;
            cdn_s3::upload::upload_file(&registry, &bucket, &region, &local_file, &remote_path)
                .await?;
            Ok(())
        }
        Command::Version => Ok(()),
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level.  Format `auto` picks JSON when
/// stdout is not a terminal or `CDN_LOG_FORCE_JSON` is set.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let force_json = matches!(
        std::env::var("CDN_LOG_FORCE_JSON").as_deref(),
        Ok("1") | Ok("true")
    );
    let json = match logging.format.as_str() {
        "json" => true,
        "text" => force_json,
        _ => force_json || !std::io::stdout().is_terminal(),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn start(config: Config, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| config.server.bind_addr());

    if config.observability.metrics {
        cdn_s3::metrics::init_metrics();
        cdn_s3::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let registry = Arc::new(BackendRegistry::build(&config.buckets)?);
    info!(
        "Serving {} bucket(s) across {} region(s)",
        registry.bucket_aliases().len(),
        registry.region_aliases().len()
    );

    let cache = connect_url_cache(&config.cache, config.gateway.cache_write_timeout()).await;

    let gateway = Gateway::new(registry, cache, config.gateway.clone());
    let grace = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(cdn_s3::AppState { config, gateway });
    let app = cdn_s3::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("cdn-s3 listening on {}", bind_addr);

    // On SIGTERM/SIGINT stop accepting connections, then give in-flight
    // requests `grace` to finish.
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    let _ = stop_tx.send(true);
    match tokio::time::timeout(grace, server).await {
        Ok(result) => result??,
        Err(_) => warn!("In-flight requests still running after {:?}; exiting", grace),
    }

    info!("cdn-s3 shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}

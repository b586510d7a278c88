//! Worker process: renders pages for requests arriving on the broker.
//!
//! Usage:
//!   scraper-worker [--amqp-url URL] [--queue NAME] [--prefetch N] [--browsers N]
//!                  [--keep-resources] [--no-sandbox] [--debug]
//!
//! Exits with code 1 if the browsers cannot start or the queue cannot be bound.

// ============================================================================
// Imports
// ============================================================================

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scraper_rpc::config::{DEFAULT_AMQP_URL, DEFAULT_PREFETCH};
use scraper_rpc::fetcher::{ChromiumFetcher, ChromiumOptions, FetcherPool, PageFetcher};
use scraper_rpc::transport::{AmqpTransport, Transport};
use scraper_rpc::{BrokerConfig, DEFAULT_QUEUE, Dispatcher, DispatcherConfig, Result};

// ============================================================================
// Arguments
// ============================================================================

/// Headless browser worker for scraper RPC.
#[derive(Parser, Debug)]
#[command(name = "scraper-worker", version)]
#[command(about = "Consume fetch requests and reply with rendered HTML")]
struct Args {
    /// Broker URI
    #[arg(long, env = "SCRAPER_AMQP_URL", default_value = DEFAULT_AMQP_URL)]
    amqp_url: String,

    /// Request queue to consume
    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Requests processed concurrently
    #[arg(long, default_value_t = DEFAULT_PREFETCH)]
    prefetch: u16,

    /// Browser instances to launch
    #[arg(long, default_value_t = 1)]
    browsers: usize,

    /// Let pages load images and run JavaScript
    #[arg(long)]
    keep_resources: bool,

    /// Launch Chromium with --no-sandbox
    #[arg(long)]
    no_sandbox: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let broker = BrokerConfig::new(args.amqp_url);
    broker.validate()?;

    let config = DispatcherConfig::new()
        .with_queue(args.queue)
        .with_prefetch(args.prefetch);
    config.validate()?;

    let options = ChromiumOptions::default()
        .with_disable_resources(!args.keep_resources)
        .with_no_sandbox(args.no_sandbox);

    let mut browsers: Vec<Arc<dyn PageFetcher>> = Vec::with_capacity(args.browsers);
    for _ in 0..args.browsers {
        browsers.push(Arc::new(ChromiumFetcher::launch(options.clone()).await?));
    }
    let pool = Arc::new(FetcherPool::new(browsers)?);
    info!(browsers = pool.len(), "Browsers ready");

    let result = serve(&broker, Arc::clone(&pool) as Arc<dyn PageFetcher>, config).await;

    pool.shutdown().await;
    result
}

async fn serve(
    broker: &BrokerConfig,
    fetcher: Arc<dyn PageFetcher>,
    config: DispatcherConfig,
) -> Result<()> {
    let transport = Arc::new(AmqpTransport::connect(broker).await?);
    let dispatcher = Dispatcher::new(Arc::clone(&transport) as Arc<dyn Transport>, fetcher, config)?;

    let result = dispatcher
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(e) = transport.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    result
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        "scraper_rpc=debug,scraper_worker=debug"
    } else {
        "scraper_rpc=info,scraper_worker=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

//! One-shot client: fetches a single page through the workers.
//!
//! Usage:
//!   scraper-fetch <URL> [--wait-for SEL] [--wait-for-timeout S]
//!                 [--param KEY=VALUE]... [--timeout S]
//!
//! Prints the HTML on success. Exits with code 1 on a fetch failure,
//! timeout, or broker error.

// ============================================================================
// Imports
// ============================================================================

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::error;
use tracing_subscriber::EnvFilter;
use url::Url;

use scraper_rpc::config::DEFAULT_AMQP_URL;
use scraper_rpc::{
    BrokerConfig, DEFAULT_QUEUE, Error, FetchOptions, Requester, RequesterConfig, Result,
};

// ============================================================================
// Arguments
// ============================================================================

/// Fetch one page through scraper RPC workers.
#[derive(Parser, Debug)]
#[command(name = "scraper-fetch", version)]
#[command(about = "Request a rendered page and print its HTML")]
struct Args {
    /// Page to fetch
    url: String,

    /// CSS selector to wait for before capturing the HTML
    #[arg(long)]
    wait_for: Option<String>,

    /// Seconds to wait for the selector
    #[arg(long)]
    wait_for_timeout: Option<f64>,

    /// Extra fetch option; VALUE is parsed as JSON, else taken as a string
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Broker URI
    #[arg(long, env = "SCRAPER_AMQP_URL", default_value = DEFAULT_AMQP_URL)]
    amqp_url: String,

    /// Request queue
    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::config(format!("Invalid {what}: {value}")))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    match run(args).await {
        Ok(html) => {
            println!("{html}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fetch failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<String> {
    Url::parse(&args.url).map_err(|e| Error::config(format!("Invalid URL '{}': {e}", args.url)))?;
    let timeout = seconds(args.timeout, "timeout")?;

    let mut options: FetchOptions = args.params.into_iter().collect();
    if let Some(selector) = args.wait_for {
        options = options.with_wait_for(selector);
    }
    if let Some(limit) = args.wait_for_timeout {
        options = options.with_wait_for_timeout(seconds(limit, "wait-for-timeout")?);
    }

    let broker = BrokerConfig::new(args.amqp_url);
    let config = RequesterConfig::new().with_queue(args.queue);
    let requester = Requester::connect_amqp(&broker, config).await?;

    let result = requester.fetch_html(&args.url, &options, timeout).await;
    if let Err(e) = requester.close().await {
        error!(error = %e, "Failed to close requester");
    }
    result
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        "scraper_rpc=debug,scraper_fetch=debug"
    } else {
        "scraper_rpc=warn,scraper_fetch=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// Copyright 2026 Loopnet Scraper Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use loopnet_scraper::urls::{build_search_url_on, resolve_detail_url_on};
use loopnet_scraper::{FetchConfig, FetchOrchestrator, FetchOutcome, ListingType, PropertyType};

#[derive(Parser)]
#[command(
    name = "loopnet",
    about = "Fetch LoopNet commercial real estate pages politely",
    version,
    after_help = "Settings also read LOOPNET_* environment variables; flags win."
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Never escalate challenge pages to a real browser
    #[arg(long, global = true)]
    no_browser: bool,

    /// Show the browser window when escalating
    #[arg(long, global = true)]
    headful: bool,

    /// Skip the site-root warm-up request
    #[arg(long, global = true)]
    no_warmup: bool,

    /// Minimum seconds between request starts
    #[arg(long, global = true)]
    delay: Option<f64>,

    /// Retries after the first attempt
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Browser fingerprint profile (e.g. chrome136, firefox133, safari18_0)
    #[arg(long, global = true)]
    impersonate: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a single URL
    Fetch {
        url: String,
        /// Include the per-attempt trace in the output
        #[arg(long)]
        attempts: bool,
    },
    /// Fetch a search results page
    Search {
        #[command(flatten)]
        query: SearchQuery,
        /// Include the per-attempt trace in the output
        #[arg(long)]
        attempts: bool,
    },
    /// Fetch a listing detail page by URL or listing id
    Detail {
        url_or_id: String,
        /// Include the per-attempt trace in the output
        #[arg(long)]
        attempts: bool,
    },
    /// Print a URL without fetching it
    Url {
        #[command(subcommand)]
        target: UrlTarget,
    },
}

#[derive(Subcommand)]
enum UrlTarget {
    /// Search results URL
    Search {
        #[command(flatten)]
        query: SearchQuery,
    },
    /// Listing detail URL
    Detail { url_or_id: String },
}

#[derive(clap::Args)]
struct SearchQuery {
    /// City and state ("Houston, TX"), state ("TX") or zip code
    #[arg(long)]
    location: String,
    /// office, retail, industrial, multifamily, land, hospitality,
    /// special-purpose or health-care
    #[arg(long)]
    property_type: Option<PropertyType>,
    /// for-sale or for-lease
    #[arg(long, default_value = "for-sale")]
    listing_type: ListingType,
    /// Results page, starting at 1
    #[arg(long, default_value = "1")]
    page: u32,
}

impl SearchQuery {
    fn url(&self, base_url: &str) -> String {
        build_search_url_on(
            base_url,
            &self.location,
            self.property_type,
            self.listing_type,
            self.page,
        )
    }
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_config(cli: &Cli) -> FetchConfig {
    let mut config = FetchConfig::from_env();
    if cli.no_browser {
        config.browser_enabled = false;
    }
    if cli.headful {
        config.browser_headless = false;
    }
    if cli.no_warmup {
        config.warmup = false;
    }
    if let Some(delay) = cli.delay {
        config.request_delay_seconds = delay.max(0.0);
    }
    if let Some(retries) = cli.retries {
        config.max_retries = retries;
    }
    if let Some(profile) = &cli.impersonate {
        config.impersonate_browser = profile.clone();
    }
    config
}

/// Render an outcome as JSON. Returns whether the fetch succeeded.
fn print_outcome(url: &str, outcome: &FetchOutcome, with_attempts: bool) -> Result<bool> {
    let mut body = match &outcome.result {
        Ok(content) => json!({
            "url": url,
            "content_length": content.len(),
            "content": content,
        }),
        Err(failure) => json!({
            "url": url,
            "error": failure,
        }),
    };
    if with_attempts {
        body["attempts"] = serde_json::to_value(&outcome.attempts)?;
        body["escalated"] = json!(outcome.escalated);
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(outcome.result.is_ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    let config = resolve_config(&cli);

    let (url, with_attempts) = match &cli.command {
        Commands::Fetch { url, attempts } => (url.clone(), *attempts),
        Commands::Search { query, attempts } => (query.url(&config.base_url), *attempts),
        Commands::Detail {
            url_or_id,
            attempts,
        } => (resolve_detail_url_on(&config.base_url, url_or_id), *attempts),
        Commands::Url { target } => {
            let url = match target {
                UrlTarget::Search { query } => query.url(&config.base_url),
                UrlTarget::Detail { url_or_id } => {
                    resolve_detail_url_on(&config.base_url, url_or_id)
                }
            };
            println!("{url}");
            return Ok(());
        }
    };

    tracing::debug!("resolved config: {config:?}");
    let orchestrator = FetchOrchestrator::new(config);
    let outcome = orchestrator.fetch_traced(&url).await;
    orchestrator.close().await;

    if !print_outcome(&url, &outcome, with_attempts)? {
        std::process::exit(2);
    }
    Ok(())
}

mod backend;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use snowcrawl_client::{HttpTierFetcher, QueryEngine, StaticProxyPool};
use snowcrawl_core::job::{JobSpec, JobStatus};
use snowcrawl_core::models::{CrawlResult, Query, QueryType};
use snowcrawl_core::query_guard;
use snowcrawl_core::tier::{TIERS, estimate_cost};
use snowcrawl_core::traits::{Extractor, ProxyEndpoint, TierFetcher};
use snowcrawl_core::url_guard::UrlGuard;
use snowcrawl_core::{CrawlJobRunner, JobOutcome, TracingRunnerReporter};

use crate::backend::LocalBackend;

#[derive(Parser)]
#[command(name = "snowcrawl", version, about = "Tiered crawl execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a crawl job file and print the results as JSON
    Run(RunArgs),

    /// Show the escalation tiers with their cost and latency
    Tiers {
        /// Also estimate the spend for this many pages per tier
        #[arg(short, long)]
        pages: Option<u64>,
    },

    /// Check that a query passes the safety rules, optionally running it on a local file
    CheckQuery {
        /// Query type: xpath, regex, jsonpath, pdf_text, pdf_table, pdf_metadata
        #[arg(short = 't', long = "type", value_parser = parse_query_type)]
        query_type: QueryType,

        /// Query expression
        #[arg(short, long, default_value = "")]
        expr: String,

        /// Query name
        #[arg(short, long, default_value = "query")]
        name: String,

        /// Concatenate matches with `|` instead of returning a list
        #[arg(long, default_value_t = false)]
        join: bool,

        /// Local HTML, JSON or PDF file to run the query against
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the JSON job file
    #[arg(short, long)]
    job: PathBuf,

    /// Allow private, loopback and link-local targets (local fixtures only)
    #[arg(long, default_value_t = false, env = "SNOWCRAWL_ALLOW_PRIVATE")]
    allow_private: bool,

    /// Proxy endpoint for the IP-rotation tier, optionally `region=URL`; repeatable
    #[arg(long = "proxy", value_parser = parse_proxy)]
    proxies: Vec<ProxyEndpoint>,

    /// Override the job's minimum delay between requests to one domain
    #[arg(long, env = "SNOWCRAWL_MIN_DELAY_MS")]
    min_delay_ms: Option<u64>,

    /// Override the job's overall timeout
    #[arg(long, env = "SNOWCRAWL_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Render tiers 3 and 4 with a local headless Chromium
    #[cfg(feature = "browser")]
    #[arg(long, default_value_t = false)]
    browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries only JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("snowcrawl=info".parse()?)
                .add_directive("snowcrawl_core=info".parse()?)
                .add_directive("snowcrawl_client=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args).await?,
        Commands::Tiers { pages } => cmd_tiers(pages),
        Commands::CheckQuery {
            query_type,
            expr,
            name,
            join,
            input,
        } => {
            let mut query = Query::new(name, query_type, expr);
            if join {
                query = query.joined();
            }
            cmd_check_query(query, input.as_deref()).await?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RunReport<'a> {
    job_id: Uuid,
    name: &'a str,
    status: JobStatus,
    results: &'a [CrawlResult],
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut job = load_job(&args.job)?;
    if let Some(ms) = args.min_delay_ms {
        job.min_delay_ms = ms;
    }
    if let Some(secs) = args.timeout_secs {
        job.job_timeout_secs = secs;
    }
    let mut job = job.validated().context("Invalid job settings")?;

    let pool = StaticProxyPool::new(args.proxies);
    if !pool.is_empty() && !job.fetch.proxy.enabled {
        tracing::info!("Proxies given on the command line, enabling the IP-rotation tier");
        job.fetch.proxy.enabled = true;
    }

    let mut fetcher = HttpTierFetcher::new().with_proxies(pool.clone());
    if args.allow_private {
        tracing::warn!("Private address checks are disabled");
        fetcher = fetcher.allow_private_redirects();
    }

    #[cfg(feature = "browser")]
    {
        if args.browser {
            tracing::info!("Launching headless browser for rendered tiers");
            let renderer = snowcrawl_client::BrowserRenderer::launch()
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            let fetcher = fetcher.with_renderer(renderer);
            return execute(fetcher, &job, args.allow_private, &pool).await;
        }
    }

    execute(fetcher, &job, args.allow_private, &pool).await
}

async fn execute<F: TierFetcher>(
    fetcher: F,
    job: &JobSpec,
    allow_private: bool,
    pool: &StaticProxyPool,
) -> Result<()> {
    let backend = LocalBackend::new();
    let runner = CrawlJobRunner::new(fetcher, QueryEngine::new(), backend.clone())
        .with_url_guard(UrlGuard::new().allow_private(allow_private));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping and keeping partial results");
            on_interrupt.cancel();
        }
    });

    let outcome = runner.run_job(job, &cancel, &TracingRunnerReporter).await;

    for stats in pool.stats() {
        tracing::info!(
            proxy = %stats.proxy,
            requests = stats.requests,
            failures = stats.failures,
            bytes = stats.bytes,
            "Proxy usage"
        );
    }

    if let JobOutcome::Error(e) = &outcome {
        anyhow::bail!("Job {} failed: {e}", job.id);
    }

    let status = outcome.status();
    if status != JobStatus::Ready {
        tracing::warn!(job_id = %job.id, %status, "Job stopped early, results are partial");
    }

    let report = RunReport {
        job_id: job.id,
        name: &job.name,
        status,
        results: outcome.results(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Read and validate a job file.
fn load_job(path: &Path) -> Result<JobSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    let job: JobSpec = serde_json::from_str(&raw).context("Invalid JSON in job file")?;
    job.validated().context("Invalid job")
}

/// `URL` or `region=URL`.
fn parse_proxy(raw: &str) -> Result<ProxyEndpoint, String> {
    let (region, url) = match raw.split_once('=') {
        Some((region, url)) if !region.contains("://") => (Some(region.trim()), url.trim()),
        _ => (None, raw.trim()),
    };
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid proxy URL: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
        return Err(format!("unsupported proxy scheme: {}", parsed.scheme()));
    }

    let endpoint = ProxyEndpoint::new(url);
    Ok(match region {
        Some(r) if !r.is_empty() => endpoint.with_region(r),
        _ => endpoint,
    })
}

// ---------------------------------------------------------------------------
// tiers
// ---------------------------------------------------------------------------

fn cmd_tiers(pages: Option<u64>) {
    println!("Escalation tiers:\n");
    for spec in &TIERS {
        println!(
            "  [{}] {:<16} ${:<7} ~{:>2}s  {}",
            spec.tier.ordinal(),
            spec.name,
            spec.cost_per_page,
            spec.expected_latency.as_secs(),
            spec.description,
        );
        if let Some(pages) = pages {
            println!(
                "      {} pages: ${:.2}",
                pages,
                estimate_cost(spec.tier, pages)
            );
        }
    }
}

// ---------------------------------------------------------------------------
// check-query
// ---------------------------------------------------------------------------

async fn cmd_check_query(query: Query, input: Option<&Path>) -> Result<()> {
    let query = query_guard::validate_query(&query)
        .with_context(|| format!("Query '{}' rejected", query.name))?;
    eprintln!("Query '{}' ({}) passes the safety rules", query.name, query.query_type.as_str());

    let Some(path) = input else {
        return Ok(());
    };
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let data = QueryEngine::new()
        .extract(&content, content_type_for(path), std::slice::from_ref(&query))
        .await;
    println!("{}", serde_json::to_string_pretty(&data)?);

    Ok(())
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("pdf") => Some("application/pdf"),
        Some(ext) if ext.eq_ignore_ascii_case("json") => Some("application/json"),
        Some(ext) if ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm") => {
            Some("text/html")
        }
        _ => None,
    }
}

fn parse_query_type(raw: &str) -> Result<QueryType, String> {
    let parsed: QueryType = serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .map_err(|e| e.to_string())?;
    match parsed {
        QueryType::Unknown => Err(format!(
            "unknown query type '{raw}', expected xpath, regex, jsonpath, pdf_text, pdf_table or pdf_metadata"
        )),
        known => Ok(known),
    }
}

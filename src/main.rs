mod config;
mod db;
mod discover;
mod enrich;
mod error;
mod export;
mod fetch;
mod models;
mod parser;
mod pipeline;
mod review;
mod scraper;
mod stats;
mod verify;

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Config, GeminiConfig};
use crate::discover::Discovery;
use crate::enrich::{GeminiClient, GeminiInference, GeminiMatcher, InferenceService};
use crate::export::{ProductSink, RunLog};
use crate::fetch::{Fetcher, PageSource};
use crate::models::{InferenceResult, RawProductRecord, ReviewSignal};
use crate::pipeline::{BatchDeps, RunContext};
use crate::verify::HttpProbe;

#[derive(Parser)]
#[command(name = "catalog_scraper", about = "Wholesale catalog crawler and product matching pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl listing pages and queue every product page found
    Discover {
        /// Max top-level categories to seed from (default: all)
        #[arg(short, long)]
        categories: Option<usize>,
        /// Start from this listing URL instead of the home page categories
        #[arg(short, long)]
        start: Option<String>,
        /// Max product URLs to queue
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Extract one product page and print it as JSON
    Scrape {
        url: String,
        /// Also run brand/category inference
        #[arg(long)]
        infer: bool,
    },
    /// Discover + scrape + checkpoint, then match every pending checkpoint
    Run {
        /// Max queued pages to scrape
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(short, long)]
        categories: Option<usize>,
        #[arg(short, long)]
        start: Option<String>,
        /// Only work the existing queue
        #[arg(long)]
        no_discover: bool,
    },
    /// Match, review and record all pending checkpoints
    Batch {
        /// Limit used for the upstream run, recorded in the run log
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show queue and pipeline statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current record");
                cancel.cancel();
            }
        });
    }

    let result = match cli.command {
        Commands::Discover {
            categories,
            start,
            limit,
        } => {
            let conn = open_store(&config)?;
            let fetcher = Fetcher::new(&config.fetch)?;
            let urls = discover_products(&config, &fetcher, categories, start, limit).await;
            let inserted = db::insert_pages(&conn, &urls)?;
            println!("Queued {} new product URLs ({} total found)", inserted, urls.len());
            Ok(())
        }
        Commands::Scrape { url, infer } => {
            let fetcher = Fetcher::new(&config.fetch)?;
            match pipeline::scrape_one(&fetcher, &config.site, &url).await {
                Ok(raw) => print_scraped(&raw, infer).await,
                Err(e) => {
                    // a page that cannot be fetched is a per-record failure, not a startup one
                    warn!("Scrape failed: {}", e);
                    Ok(())
                }
            }
        }
        Commands::Run {
            limit,
            categories,
            start,
            no_discover,
        } => {
            let gemini = GeminiClient::new(GeminiConfig::from_env()?)?;
            let conn = open_store(&config)?;
            let fetcher: Arc<dyn PageSource> = Arc::new(Fetcher::new(&config.fetch)?);

            // Phase 1: Discover
            if !no_discover {
                let t_discover = Instant::now();
                let urls =
                    discover_products(&config, fetcher.as_ref(), categories, start, None).await;
                let inserted = db::insert_pages(&conn, &urls)?;
                println!(
                    "Queued {} new product URLs ({} found) in {:.1}s",
                    inserted,
                    urls.len(),
                    t_discover.elapsed().as_secs_f64()
                );
            }

            // Phase 2: Scrape + infer + checkpoint
            let pages = db::fetch_unvisited(&conn, limit)?;
            if pages.is_empty() {
                println!("No unvisited pages in the queue.");
            } else {
                let t_prepare = Instant::now();
                println!("Pipeline: scraping {} pages (streaming to checkpoints)...", pages.len());
                let inference = GeminiInference::new(gemini.clone())?;
                let prepared = pipeline::prepare_pages(
                    &conn,
                    &config.site,
                    fetcher,
                    &inference,
                    pages,
                    config.scrape_concurrency,
                    &cancel,
                )
                .await?;
                println!(
                    "Checkpointed {} of {} pages ({} degraded, {} dropped) in {:.1}s",
                    prepared.checkpointed,
                    prepared.total,
                    prepared.degraded,
                    prepared.failed,
                    t_prepare.elapsed().as_secs_f64()
                );
            }

            // Phase 3: Match + review + record
            if cancel.is_cancelled() {
                println!("Interrupted before matching; run 'batch' to resume from checkpoints.");
                Ok(())
            } else {
                run_batch(&config, &conn, gemini, limit, &cancel).await
            }
        }
        Commands::Batch { limit } => {
            let gemini = GeminiClient::new(GeminiConfig::from_env()?)?;
            let conn = open_store(&config)?;
            run_batch(&config, &conn, gemini, limit, &cancel).await
        }
        Commands::Stats => {
            let conn = open_store(&config)?;
            let s = db::get_stats(&conn)?;
            println!("Queued:       {}", s.total);
            println!("Visited:      {}", s.visited);
            println!("Unvisited:    {}", s.unvisited);
            println!("Errors:       {}", s.errors);
            println!("Checkpoints:  {}", s.checkpoints);
            println!("Pending:      {}", s.pending);
            println!("Matched:      {}", s.matched);
            println!("Needs review: {}", s.needs_review);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_store(config: &Config) -> anyhow::Result<rusqlite::Connection> {
    let conn = db::connect(&config.db_path())?;
    db::init_schema(&conn)?;
    Ok(conn)
}

async fn print_scraped(raw: &RawProductRecord, infer: bool) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(raw)?);
    if infer {
        let id = raw.internal_id.clone().unwrap_or_default();
        let inference = GeminiInference::new(GeminiClient::new(GeminiConfig::from_env()?)?)?;
        let result = inference.infer(raw).await.unwrap_or_else(|e| {
            warn!("Inference failed for {}: {}", id, e);
            InferenceResult::degraded(&id, &e)
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

async fn discover_products(
    config: &Config,
    source: &dyn PageSource,
    categories: Option<usize>,
    start: Option<String>,
    limit: Option<usize>,
) -> Vec<String> {
    let discovery = Discovery::new(source, &config.site, &config.discovery);
    let seeds = match start {
        Some(url) => vec![url],
        None => discovery.root_seeds(categories).await,
    };
    if seeds.is_empty() {
        warn!("No category seeds found at {}", config.site.base_url);
        return Vec::new();
    }

    let report = discovery.run(&seeds).await;
    println!(
        "Explored {} listing pages ({} escalated to browser, {} unreachable)",
        report.expansions.len(),
        report.escalated(),
        report.failed()
    );

    let mut products = report.products;
    if let Some(n) = limit {
        products.truncate(n);
    }
    products
}

async fn run_batch(
    config: &Config,
    conn: &rusqlite::Connection,
    gemini: GeminiClient,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let matcher = GeminiMatcher::new(gemini);
    let probe = HttpProbe::new()?;
    let sink = ProductSink::new(config.export_path());
    let run_log = RunLog::new(config.runs_log_path());
    let deps = BatchDeps {
        matcher: &matcher,
        probe: &probe,
        sink: &sink,
        run_log: &run_log,
    };

    let ctx = RunContext::new(&config.site.supplier_name, limit);
    let report = pipeline::run_batch(conn, &deps, ctx, config.match_concurrency, cancel).await?;
    let run = &report.run;
    if run.total == 0 && report.failed == 0 {
        println!("No pending checkpoints. Run 'run' first.");
        return Ok(());
    }

    let flagged: Vec<_> = report
        .outcomes
        .iter()
        .filter(|o| o.needs_review == ReviewSignal::Yes)
        .collect();
    if !flagged.is_empty() {
        println!("{:<12} | {:>10} | {:<48}", "Product", "Confidence", "Official image");
        println!("{}", "-".repeat(76));
        for o in &flagged {
            let confidence = o
                .match_confidence
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".into());
            let image = o.official_image.as_deref().unwrap_or("-");
            println!("{:<12} | {:>10} | {:<48}", truncate(&o.internal_id, 12), confidence, truncate(image, 48));
        }
        println!();
    }

    println!(
        "Run {}: {} recorded, {} matched, review {} yes / {} no, confidence avg {:.4} (min {:.4}, max {:.4})",
        run.run_id,
        run.total,
        run.matched,
        run.needs_review_yes,
        run.needs_review_no,
        run.avg_confidence,
        run.min_confidence,
        run.max_confidence
    );
    if report.failed > 0 {
        println!("{} products could not be recorded and stay pending", report.failed);
    }
    println!("Rows appended to {}", sink.path().display());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SiteProfile;
use crate::db;
use crate::enrich::{InferenceService, MatchService};
use crate::error::{ExtractionError, FetchError};
use crate::export::{ExportRow, ProductSink, RunLog};
use crate::fetch::PageSource;
use crate::models::{Checkpoint, InferenceResult, MatchResult, Outcome, RawProductRecord, RunRecord};
use crate::parser::product;
use crate::review;
use crate::scraper::{self, Fetched, RetryPolicy};
use crate::stats::{self, RunStats};
use crate::verify::{self, ImageProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovered,
    Extracted,
    Inferred,
    Checkpointed,
    Matched,
    Reviewed,
    Recorded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovered => "discovered",
            Stage::Extracted => "extracted",
            Stage::Inferred => "inferred",
            Stage::Checkpointed => "checkpointed",
            Stage::Matched => "matched",
            Stage::Reviewed => "reviewed",
            Stage::Recorded => "recorded",
        };
        f.write_str(name)
    }
}

/// Where one product ended up. `Failed` names the stage that could not be reached.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
    Reached(Stage),
    Failed { stage: Stage, reason: String },
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

// ── Extract → Inference → Checkpoint ──

#[derive(Debug, Default)]
pub struct PrepareStats {
    pub total: usize,
    pub checkpointed: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Scrape queued product pages and checkpoint each one. Results are consumed serially as
/// they stream in; cancellation stops intake but keeps every checkpoint already written.
pub async fn prepare_pages(
    conn: &Connection,
    site: &SiteProfile,
    source: Arc<dyn PageSource>,
    inference: &dyn InferenceService,
    pages: Vec<(i64, String)>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<PrepareStats> {
    let mut stats = PrepareStats {
        total: pages.len(),
        ..Default::default()
    };
    let pb = progress_bar(pages.len())?;
    let mut rx = scraper::scrape_pages_streaming(
        source,
        pages,
        concurrency,
        RetryPolicy::default(),
        cancel.clone(),
    );

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Scrape cancelled, unvisited pages stay queued");
                break;
            }
            fetched = rx.recv() => fetched,
        };
        let Some(fetched) = fetched else { break };

        match prepare_one(conn, site, inference, fetched).await? {
            (RecordState::Reached(_), degraded) => {
                stats.checkpointed += 1;
                if degraded {
                    stats.degraded += 1;
                }
            }
            (RecordState::Failed { stage, reason }, _) => {
                debug!("Never {}: {}", stage, reason);
                stats.failed += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Prepared {} pages ({} checkpointed, {} degraded, {} failed)",
        stats.total, stats.checkpointed, stats.degraded, stats.failed
    );
    Ok(stats)
}

/// Drive one fetched page to a checkpoint. The flag reports a degraded inference.
pub async fn prepare_one(
    conn: &Connection,
    site: &SiteProfile,
    inference: &dyn InferenceService,
    fetched: Fetched,
) -> Result<(RecordState, bool)> {
    let Fetched {
        page_id,
        url,
        result,
    } = fetched;
    debug!("{} {}", url, Stage::Discovered);

    let raw = match product::extract(result, &url, site) {
        Ok(raw) => {
            debug!("{} {}", url, Stage::Extracted);
            raw
        }
        Err(e) => {
            warn!("Dropping {}: {}", url, e);
            db::mark_visited(conn, page_id, Some(&e.to_string()))?;
            return Ok((failed(Stage::Extracted, e), false));
        }
    };

    let Some(internal_id) = raw.internal_id.clone() else {
        let reason = "no product id on page or in URL";
        warn!("Dropping {}: {}", url, reason);
        db::mark_visited(conn, page_id, Some(reason))?;
        return Ok((failed(Stage::Checkpointed, reason), false));
    };

    let (inference, degraded) = infer_or_degrade(inference, &raw, &internal_id).await;
    debug!("{} {}", internal_id, Stage::Inferred);
    let cp = Checkpoint { raw, inference };
    db::save_checkpoint(conn, &cp)?;
    db::mark_visited(conn, page_id, None)?;
    info!("Checkpointed {}", internal_id);

    Ok((RecordState::Reached(Stage::Checkpointed), degraded))
}

async fn infer_or_degrade(
    service: &dyn InferenceService,
    raw: &RawProductRecord,
    internal_id: &str,
) -> (InferenceResult, bool) {
    match service.infer(raw).await {
        Ok(result) => (result, false),
        Err(e) => {
            warn!("Inference failed for {}: {}", internal_id, e);
            (InferenceResult::degraded(internal_id, &e), true)
        }
    }
}

fn failed(stage: Stage, reason: impl fmt::Display) -> RecordState {
    RecordState::Failed {
        stage,
        reason: reason.to_string(),
    }
}

/// Fetch and extract a single product page outside the queue.
pub async fn scrape_one(
    source: &dyn PageSource,
    site: &SiteProfile,
    url: &str,
) -> Result<RawProductRecord, ExtractionError> {
    let fetched = match Url::parse(url) {
        Ok(parsed) => scraper::fetch_product(source, &parsed, RetryPolicy::default()).await,
        Err(e) => Err(FetchError::unreachable(url, e.to_string())),
    };
    product::extract(fetched, url, site)
}

// ── Match → Review → Record ──

/// Everything the batch stage talks to. No inference service: a batch runs from checkpoints alone.
pub struct BatchDeps<'a> {
    pub matcher: &'a dyn MatchService,
    pub probe: &'a dyn ImageProbe,
    pub sink: &'a ProductSink,
    pub run_log: &'a RunLog,
}

/// Run-scoped state for one batch.
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub supplier: String,
    pub discover_limit: Option<usize>,
    stats: RunStats,
}

impl RunContext {
    pub fn new(supplier: &str, discover_limit: Option<usize>) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: stats::run_id(supplier, started_at, discover_limit),
            started_at,
            supplier: supplier.to_string(),
            discover_limit,
            stats: RunStats::default(),
        }
    }

    pub fn finish(&self) -> RunRecord {
        self.stats.finish(
            self.run_id.clone(),
            self.supplier.clone(),
            self.started_at,
            self.discover_limit,
        )
    }
}

pub struct BatchReport {
    pub run: RunRecord,
    pub outcomes: Vec<Outcome>,
    /// Matched but not recorded; their checkpoints stay pending.
    pub failed: usize,
}

/// Consume every pending checkpoint, record each product once, and log the run.
pub async fn run_batch(
    conn: &Connection,
    deps: &BatchDeps<'_>,
    mut ctx: RunContext,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let checkpoints = db::fetch_pending_checkpoints(conn, None)?;
    info!("Run {}: {} pending checkpoints", ctx.run_id, checkpoints.len());

    let pb = progress_bar(checkpoints.len())?;
    let mut outcomes = Vec::with_capacity(checkpoints.len());
    let mut failed = 0;
    let mut matched = stream::iter(checkpoints)
        .map(|cp| async move {
            let m = match_checkpoint(deps.matcher, deps.probe, &cp).await;
            (cp, m)
        })
        .buffer_unordered(concurrency.max(1));

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Batch cancelled, unrecorded checkpoints stay pending");
                break;
            }
            next = matched.next() => next,
        };
        let Some((cp, m)) = next else { break };

        match record(conn, deps.sink, &ctx, &cp, m) {
            Ok(outcome) => {
                ctx.stats.record(&outcome);
                outcomes.push(outcome);
            }
            Err(e) => {
                warn!("Failed to record {}, left pending: {:#}", cp.internal_id(), e);
                failed += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let run = ctx.finish();
    deps.run_log.append(&run)?;
    Ok(BatchReport {
        run,
        outcomes,
        failed,
    })
}

/// Match one checkpoint and settle its official image. Collaborator failures degrade.
pub async fn match_checkpoint(
    matcher: &dyn MatchService,
    probe: &dyn ImageProbe,
    cp: &Checkpoint,
) -> MatchResult {
    let id = cp.internal_id();
    let m = match matcher.find_match(cp).await {
        Ok(m) => m,
        Err(e) => {
            warn!("Match failed for {}: {}", id, e);
            MatchResult::degraded(id, &e)
        }
    };
    let m = verify::resolve_official_image(probe, m).await;
    debug!("{} {}", id, Stage::Matched);
    info!(
        "Match for {}: found={} confidence={:.2} image={}",
        id,
        m.match_found,
        m.match_confidence,
        if m.official_main_image_url.is_some() { "YES" } else { "NO" }
    );
    m
}

fn record(
    conn: &Connection,
    sink: &ProductSink,
    ctx: &RunContext,
    cp: &Checkpoint,
    m: MatchResult,
) -> Result<Outcome> {
    let needs_review = review::needs_review(&m);
    debug!("{} {} ({})", cp.internal_id(), Stage::Reviewed, needs_review);
    sink.append(ExportRow::build(&ctx.supplier, cp, &m, needs_review))?;

    let tx = conn.unchecked_transaction()?;
    db::save_match(&tx, &ctx.run_id, &m, needs_review)?;
    db::mark_consumed(&tx, cp.internal_id())?;
    tx.commit()?;
    debug!("{} {}", cp.internal_id(), Stage::Recorded);

    Ok(Outcome {
        internal_id: cp.internal_id().to_string(),
        match_found: m.match_found,
        match_confidence: Some(m.match_confidence),
        needs_review,
        official_image: m.official_main_image_url,
    })
}

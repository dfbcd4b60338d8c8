use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::warn;

use crate::models::{Checkpoint, InferenceResult, MatchResult, RawProductRecord, ReviewSignal};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pages (
            id         INTEGER PRIMARY KEY,
            url        TEXT UNIQUE NOT NULL,
            visited    BOOLEAN NOT NULL DEFAULT 0,
            visited_at TEXT,
            error      TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_pages_visited ON pages(visited);

        -- Raw record + inference, the resume point for the match stage
        CREATE TABLE IF NOT EXISTS checkpoints (
            internal_id    TEXT PRIMARY KEY,
            raw_json       TEXT NOT NULL,
            inference_json TEXT NOT NULL,
            created_at     TEXT NOT NULL DEFAULT (datetime('now')),
            consumed_at    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_consumed ON checkpoints(consumed_at);

        CREATE TABLE IF NOT EXISTS matches (
            internal_id      TEXT PRIMARY KEY,
            run_id           TEXT NOT NULL,
            match_found      BOOLEAN NOT NULL,
            match_confidence REAL NOT NULL,
            official_image   TEXT,
            needs_review     TEXT NOT NULL CHECK(needs_review IN ('YES','NO')),
            match_json       TEXT NOT NULL,
            matched_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Queue ──

pub fn insert_pages(conn: &Connection, urls: &[String]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO pages (url) VALUES (?1)")?;
        for url in urls {
            count += stmt.execute(rusqlite::params![url])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

pub fn fetch_unvisited(conn: &Connection, limit: Option<usize>) -> Result<Vec<(i64, String)>> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT id, url FROM pages WHERE visited = 0 ORDER BY id LIMIT {}",
            n
        ),
        None => "SELECT id, url FROM pages WHERE visited = 0 ORDER BY id".to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Mark a queued page done. `error` is kept for pages that produced no record.
pub fn mark_visited(conn: &Connection, page_id: i64, error: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE pages SET visited = 1, visited_at = datetime('now'), error = ?2 WHERE id = ?1",
        rusqlite::params![page_id, error],
    )?;
    Ok(())
}

// ── Checkpoints ──

/// A fresh checkpoint replaces any earlier one for the same product and is pending again.
pub fn save_checkpoint(conn: &Connection, cp: &Checkpoint) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO checkpoints (internal_id, raw_json, inference_json)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![
            cp.internal_id(),
            serde_json::to_string(&cp.raw)?,
            serde_json::to_string(&cp.inference)?,
        ],
    )?;
    Ok(())
}

pub fn fetch_pending_checkpoints(conn: &Connection, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
    let sql = format!(
        "SELECT internal_id, raw_json, inference_json
         FROM checkpoints
         WHERE consumed_at IS NULL
         ORDER BY created_at, internal_id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Undecodable rows are skipped and stay pending.
    Ok(rows
        .into_iter()
        .filter_map(|(id, raw, inference)| match decode_checkpoint(&id, &raw, &inference) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!("Skipping unreadable checkpoint: {:#}", e);
                None
            }
        })
        .collect())
}

fn decode_checkpoint(id: &str, raw: &str, inference: &str) -> Result<Checkpoint> {
    let raw: RawProductRecord =
        serde_json::from_str(raw).with_context(|| format!("checkpoint {id}: raw record"))?;
    let inference: InferenceResult =
        serde_json::from_str(inference).with_context(|| format!("checkpoint {id}: inference"))?;
    Ok(Checkpoint { raw, inference })
}

pub fn mark_consumed(conn: &Connection, internal_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE checkpoints SET consumed_at = datetime('now') WHERE internal_id = ?1",
        [internal_id],
    )?;
    Ok(())
}

// ── Matches ──

pub fn save_match(
    conn: &Connection,
    run_id: &str,
    m: &MatchResult,
    needs_review: ReviewSignal,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO matches
         (internal_id, run_id, match_found, match_confidence, official_image, needs_review, match_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            m.product_internal_id,
            run_id,
            m.match_found,
            m.match_confidence,
            m.official_main_image_url,
            needs_review.as_str(),
            serde_json::to_string(m)?,
        ],
    )?;
    Ok(())
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub visited: usize,
    pub unvisited: usize,
    pub errors: usize,
    pub checkpoints: usize,
    pub pending: usize,
    pub matched: usize,
    pub needs_review: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let total = count("SELECT COUNT(*) FROM pages")?;
    let visited = count("SELECT COUNT(*) FROM pages WHERE visited = 1")?;
    Ok(Stats {
        total,
        visited,
        unvisited: total - visited,
        errors: count("SELECT COUNT(*) FROM pages WHERE error IS NOT NULL")?,
        checkpoints: count("SELECT COUNT(*) FROM checkpoints")?,
        pending: count("SELECT COUNT(*) FROM checkpoints WHERE consumed_at IS NULL")?,
        matched: count("SELECT COUNT(*) FROM matches WHERE match_found = 1")?,
        needs_review: count("SELECT COUNT(*) FROM matches WHERE needs_review = 'YES'")?,
    })
}

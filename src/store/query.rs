//! Query engine - range reads behind a coarse whole-cache
//!
//! Cache rules:
//! - key is the exact request (symbol, start, end, limit) per keyspace;
//!   overlapping ranges are never stitched together
//! - only results with fewer than `max_rows` rows are kept
//! - TTL is checked on access; once expired the WHOLE cache is dropped
//! - any write (bulk ingest, aligned write, retention, restore) clears it all
//! - every clear bumps a generation; a load that started under an older
//!   generation is returned to its caller but never stored

use super::alignment::AlignedCandle;
use super::types::{Candle, CandleQuery, Column, ProjectedRow, Timeframe};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Keyspace {
    Primary,
    Latest,
    Aligned(Timeframe),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    keyspace: Keyspace,
    symbol: String,
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<usize>,
}

#[derive(Clone)]
enum CachedRows {
    Candles(Vec<Candle>),
    Aligned(Vec<AlignedCandle>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub invalidations: u64,
}

struct CacheInner {
    entries: HashMap<CacheKey, CachedRows>,
    created_at: Instant,
    generation: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn expire_if_stale(&mut self, ttl: Duration) {
        if self.created_at.elapsed() >= ttl {
            if !self.entries.is_empty() {
                log::debug!("🗑️  Query cache expired ({} entries)", self.entries.len());
                self.entries.clear();
                self.stats.invalidations += 1;
            }
            self.created_at = Instant::now();
            self.generation += 1;
        }
    }
}

/// Bounded, whole-invalidated result cache
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_rows: usize,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_rows: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                created_at: Instant::now(),
                generation: 0,
                stats: CacheStats::default(),
            }),
            ttl,
            max_rows,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // The cache holds no invariants a panicking reader could break
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cached rows for `key` plus the generation a fresh load starts under
    fn get(&self, key: &CacheKey) -> (Option<CachedRows>, u64) {
        let mut inner = self.lock();
        inner.expire_if_stale(self.ttl);
        let rows = inner.entries.get(key).cloned();
        if rows.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        (rows, inner.generation)
    }

    /// Store a load result unless the cache was cleared since `generation`
    fn put(&self, key: CacheKey, rows: CachedRows, len: usize, generation: u64) {
        if len >= self.max_rows {
            return;
        }
        let mut inner = self.lock();
        inner.expire_if_stale(self.ttl);
        if inner.generation != generation {
            log::debug!("🗑️  Dropping load for {} (cache cleared mid-load)", key.symbol);
            return;
        }
        inner.entries.insert(key, rows);
    }

    /// Drop every cached result
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.created_at = Instant::now();
        inner.generation += 1;
        inner.stats.invalidations += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    /// Range read through the cache
    pub fn candles<E>(
        &self,
        query: &CandleQuery,
        load: impl FnOnce() -> Result<Vec<Candle>, E>,
    ) -> Result<Vec<Candle>, E> {
        let key = CacheKey {
            keyspace: Keyspace::Primary,
            symbol: query.symbol.clone(),
            start: query.start,
            end: query.end,
            limit: query.limit,
        };
        self.candles_for_key(key, load)
    }

    /// Latest-N read through the cache
    pub fn latest<E>(
        &self,
        symbol: &str,
        n: usize,
        load: impl FnOnce() -> Result<Vec<Candle>, E>,
    ) -> Result<Vec<Candle>, E> {
        let key = CacheKey {
            keyspace: Keyspace::Latest,
            symbol: symbol.to_string(),
            start: None,
            end: None,
            limit: Some(n),
        };
        self.candles_for_key(key, load)
    }

    fn candles_for_key<E>(
        &self,
        key: CacheKey,
        load: impl FnOnce() -> Result<Vec<Candle>, E>,
    ) -> Result<Vec<Candle>, E> {
        let generation = match self.get(&key) {
            (Some(CachedRows::Candles(rows)), _) => return Ok(rows),
            (_, generation) => generation,
        };
        let rows = load()?;
        self.put(key, CachedRows::Candles(rows.clone()), rows.len(), generation);
        Ok(rows)
    }

    /// Aligned-series read through the cache (timeframe is part of the key)
    pub fn aligned<E>(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<i64>,
        end: Option<i64>,
        load: impl FnOnce() -> Result<Vec<AlignedCandle>, E>,
    ) -> Result<Vec<AlignedCandle>, E> {
        let key = CacheKey {
            keyspace: Keyspace::Aligned(timeframe),
            symbol: symbol.to_string(),
            start,
            end,
            limit: None,
        };
        let generation = match self.get(&key) {
            (Some(CachedRows::Aligned(rows)), _) => return Ok(rows),
            (_, generation) => generation,
        };
        let rows = load()?;
        self.put(key, CachedRows::Aligned(rows.clone()), rows.len(), generation);
        Ok(rows)
    }
}

fn candle_from_row(row: &Row) -> rusqlite::Result<Candle> {
    Ok(Candle {
        symbol: row.get(0)?,
        timestamp: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get(6)?,
    })
}

/// Ascending range read; bounds inclusive, `LIMIT -1` means unbounded
pub fn fetch_candles(conn: &Connection, query: &CandleQuery) -> rusqlite::Result<Vec<Candle>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT symbol, timestamp, open, high, low, close, volume
        FROM candles
        WHERE symbol = ?1
          AND (?2 IS NULL OR timestamp >= ?2)
          AND (?3 IS NULL OR timestamp <= ?3)
        ORDER BY timestamp ASC
        LIMIT ?4
        "#,
    )?;

    let limit = query.limit.map_or(-1, |n| n as i64);
    let rows = stmt.query_map(
        params![query.symbol, query.start, query.end, limit],
        candle_from_row,
    )?;

    let candles = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(candles)
}

/// Row count for a symbol/range without materializing rows
pub fn count_candles(
    conn: &Connection,
    symbol: &str,
    start: Option<i64>,
    end: Option<i64>,
) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM candles
        WHERE symbol = ?1
          AND (?2 IS NULL OR timestamp >= ?2)
          AND (?3 IS NULL OR timestamp <= ?3)
        "#,
        params![symbol, start, end],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Newest `n` candles, returned oldest-first
pub fn fetch_latest(conn: &Connection, symbol: &str, n: usize) -> rusqlite::Result<Vec<Candle>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT symbol, timestamp, open, high, low, close, volume
        FROM candles
        WHERE symbol = ?1
        ORDER BY timestamp DESC
        LIMIT ?2
        "#,
    )?;

    let rows = stmt.query_map(params![symbol, n as i64], candle_from_row)?;
    let mut candles = rows.collect::<Result<Vec<_>, _>>()?;
    candles.reverse();
    Ok(candles)
}

pub fn list_symbols(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM candles ORDER BY symbol")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let symbols = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(symbols)
}

/// Project full rows down to `columns`, in the order given
pub fn project(candles: &[Candle], columns: &[Column]) -> Vec<ProjectedRow> {
    candles
        .iter()
        .map(|c| ProjectedRow {
            timestamp: c.timestamp,
            values: columns.iter().map(|col| col.value_of(c)).collect(),
        })
        .collect()
}

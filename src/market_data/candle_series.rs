// =============================================================================
// Candle series — fixed-capacity OHLCV ring per (market, interval)
// =============================================================================
//
// The ring has a moving head index, so closing a candle is O(1): the head
// advances one slot, the oldest row is overwritten with zeros, and logical
// index -1 (the in-progress candle) maps to the physical head.
//
// Concurrency: exactly one writer (the trade interpreter) per series; any
// number of readers. Readers get eventually-consistent copies and re-read on
// demand.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{Interval, Market};

/// Default ring capacity per series.
pub const SERIES_CAPACITY: usize = 200;

/// One OHLCV row. `open_time_ms` is exchange epoch milliseconds aligned to
/// the interval boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CandleRow {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buyer_volume: f64,
    pub seller_volume: f64,
    pub unique_traders: i64,
}

struct Inner {
    rows: Vec<CandleRow>,
    /// Physical index of logical index -1 (the in-progress candle).
    head: usize,
    last_trade_price: f64,
}

/// Fixed-capacity candle ring for one (market, interval).
pub struct CandleSeries {
    market: Market,
    interval: Interval,
    inner: RwLock<Inner>,
    is_updated: AtomicBool,
}

impl CandleSeries {
    pub fn new(market: Market, interval: Interval, capacity: usize) -> Self {
        assert!(capacity > 0, "series capacity must be non-zero");
        Self {
            market,
            interval,
            inner: RwLock::new(Inner {
                rows: vec![CandleRow::default(); capacity],
                head: capacity - 1,
                last_trade_price: 0.0,
            }),
            is_updated: AtomicBool::new(false),
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().rows.len()
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Open time of the in-progress candle (logical index -1).
    pub fn open_time(&self) -> i64 {
        let inner = self.inner.read();
        inner.rows[inner.head].open_time_ms
    }

    /// Copy of the in-progress candle.
    pub fn latest(&self) -> CandleRow {
        let inner = self.inner.read();
        inner.rows[inner.head]
    }

    /// Copy of all rows in logical order (oldest first, in-progress last).
    pub fn rows(&self) -> Vec<CandleRow> {
        let inner = self.inner.read();
        let cap = inner.rows.len();
        (0..cap)
            .map(|k| inner.rows[(inner.head + 1 + k) % cap])
            .collect()
    }

    pub fn opens(&self) -> Vec<f64> {
        self.column(|r| r.open)
    }

    pub fn highs(&self) -> Vec<f64> {
        self.column(|r| r.high)
    }

    pub fn lows(&self) -> Vec<f64> {
        self.column(|r| r.low)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.column(|r| r.close)
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.column(|r| r.volume)
    }

    pub fn buyer_volumes(&self) -> Vec<f64> {
        self.column(|r| r.buyer_volume)
    }

    pub fn seller_volumes(&self) -> Vec<f64> {
        self.column(|r| r.seller_volume)
    }

    pub fn unique_traders(&self) -> Vec<i64> {
        let inner = self.inner.read();
        let cap = inner.rows.len();
        (0..cap)
            .map(|k| inner.rows[(inner.head + 1 + k) % cap].unique_traders)
            .collect()
    }

    fn column(&self, f: impl Fn(&CandleRow) -> f64) -> Vec<f64> {
        let inner = self.inner.read();
        let cap = inner.rows.len();
        (0..cap)
            .map(|k| f(&inner.rows[(inner.head + 1 + k) % cap]))
            .collect()
    }

    pub fn last_trade_price(&self) -> f64 {
        self.inner.read().last_trade_price
    }

    // ── Writes (single writer) ──────────────────────────────────────────

    /// Advance the ring one slot: the oldest row is discarded and the new
    /// in-progress slot is zero-initialised.
    pub fn create_candle(&self) {
        let mut inner = self.inner.write();
        let cap = inner.rows.len();
        inner.head = (inner.head + 1) % cap;
        let head = inner.head;
        inner.rows[head] = CandleRow::default();
    }

    pub fn set_open_time(&self, open_time_ms: i64) {
        self.with_latest(|r| r.open_time_ms = open_time_ms);
    }

    pub fn set_open(&self, price: f64) {
        self.with_latest(|r| r.open = price);
    }

    pub fn set_high(&self, price: f64) {
        self.with_latest(|r| r.high = price);
    }

    pub fn set_low(&self, price: f64) {
        self.with_latest(|r| r.low = price);
    }

    pub fn set_close(&self, price: f64) {
        self.with_latest(|r| r.close = price);
    }

    pub fn set_volume(&self, volume: f64) {
        self.with_latest(|r| r.volume = volume);
    }

    pub fn add_volume(&self, size: f64) {
        self.with_latest(|r| r.volume += size);
    }

    pub fn add_buyer_volume(&self, size: f64) {
        self.with_latest(|r| r.buyer_volume += size);
    }

    pub fn add_seller_volume(&self, size: f64) {
        self.with_latest(|r| r.seller_volume += size);
    }

    pub fn set_unique_traders(&self, count: i64) {
        self.with_latest(|r| r.unique_traders = count);
    }

    /// Overwrite the in-progress candle wholesale (bootstrap fill).
    pub fn set_latest(&self, row: CandleRow) {
        self.with_latest(|r| *r = row);
    }

    pub fn set_last_trade_price(&self, price: f64) {
        self.inner.write().last_trade_price = price;
    }

    fn with_latest(&self, f: impl FnOnce(&mut CandleRow)) {
        let mut inner = self.inner.write();
        let head = inner.head;
        f(&mut inner.rows[head]);
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn is_updated(&self) -> bool {
        self.is_updated.load(Ordering::Acquire)
    }

    pub fn mark_updated(&self) {
        self.is_updated.store(true, Ordering::Release);
    }

    pub fn clear_updated(&self) {
        self.is_updated.store(false, Ordering::Release);
    }
}

// =============================================================================
// SeriesSet — all candle series for one market
// =============================================================================

/// The set of per-interval candle series a market worker maintains. The set
/// survives supervisor restarts so a rebuilt worker continues the same rings.
pub struct SeriesSet {
    market: Market,
    capacity: usize,
    inner: RwLock<HashMap<Interval, Arc<CandleSeries>>>,
}

impl SeriesSet {
    pub fn new(market: Market, intervals: &[Interval], capacity: usize) -> Self {
        let mut map = HashMap::new();
        for &iv in intervals {
            map.insert(iv, Arc::new(CandleSeries::new(market, iv, capacity)));
        }
        Self {
            market,
            capacity,
            inner: RwLock::new(map),
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn get(&self, interval: Interval) -> Option<Arc<CandleSeries>> {
        self.inner.read().get(&interval).cloned()
    }

    /// Fetch the series for `interval`, creating it on first use.
    pub fn ensure(&self, interval: Interval) -> Arc<CandleSeries> {
        if let Some(series) = self.get(interval) {
            return series;
        }
        let mut map = self.inner.write();
        map.entry(interval)
            .or_insert_with(|| Arc::new(CandleSeries::new(self.market, interval, self.capacity)))
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<CandleSeries>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn intervals(&self) -> Vec<Interval> {
        let mut intervals: Vec<Interval> = self.inner.read().keys().copied().collect();
        intervals.sort();
        intervals
    }

    /// Flip the health flag across every interval.
    pub fn set_healthy(&self, healthy: bool) {
        for series in self.all() {
            if healthy {
                series.mark_updated();
            } else {
                series.clear_updated();
            }
        }
    }

    pub fn all_healthy(&self) -> bool {
        self.all().iter().all(|s| s.is_updated())
    }
}

// =============================================================================
// Publication sinks — stat table and pub/sub bus
// =============================================================================
//
// Indicator engines publish through the `SampleSink` trait so the transport
// can be swapped (the production deployment backs these with a shared-memory
// segment and a Redis bus; this crate ships in-process equivalents with the
// same update-or-insert contract).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{indicator_channel, Exchange, Interval, Market};

/// One computed indicator value.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSample {
    /// Stat name, e.g. "rsi", "atr", "macd_signal".
    pub stat: &'static str,
    pub exchange: Exchange,
    pub market: Market,
    pub timeframe: Interval,
    pub period: usize,
    pub value: f64,
    /// Open time of the candle the value was computed against.
    pub candle_time_ms: i64,
    pub computed_at_ms: i64,
}

impl IndicatorSample {
    /// Deterministic bus key: `{exchange}_{market}_{timeframe}_{period}`.
    pub fn key(&self) -> String {
        indicator_channel(self.exchange, self.market, self.timeframe, self.period)
    }

    /// Stat-table column tag, e.g. "rsi_14".
    pub fn stat_tag(&self) -> String {
        format!("{}_{}", self.stat, self.period)
    }
}

/// Update-or-insert sample destination.
pub trait SampleSink: Send + Sync {
    fn publish(&self, sample: &IndicatorSample);
}

// =============================================================================
// StatTable
// =============================================================================

/// Ring of stat rows per (market, interval), one row per candle window. The
/// layout mirrors the shared-memory stat table: a time column, named stat
/// columns, and an `is_updated` flag.
pub struct StatTable {
    capacity: usize,
    inner: RwLock<HashMap<(Market, Interval), StatSeries>>,
}

#[derive(Default)]
struct StatSeries {
    rows: VecDeque<StatRow>,
    is_updated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatRow {
    pub time_ms: i64,
    pub stats: HashMap<String, f64>,
}

impl StatTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "stat table capacity must be non-zero");
        Self {
            capacity,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Write `tag = value` into the row for `time_ms`, opening a new row when
    /// the candle window advanced and evicting the oldest row past capacity.
    pub fn upsert(&self, market: Market, interval: Interval, time_ms: i64, tag: &str, value: f64) {
        let mut map = self.inner.write();
        let series = map.entry((market, interval)).or_default();

        let needs_new_row = series
            .rows
            .back()
            .map(|row| row.time_ms != time_ms)
            .unwrap_or(true);
        if needs_new_row {
            series.rows.push_back(StatRow {
                time_ms,
                stats: HashMap::new(),
            });
            while series.rows.len() > self.capacity {
                series.rows.pop_front();
            }
        }

        let row = series.rows.back_mut().expect("row pushed above");
        row.stats.insert(tag.to_string(), value);
        series.is_updated = true;
    }

    /// Latest value of `tag`, if any.
    pub fn get(&self, market: Market, interval: Interval, tag: &str) -> Option<f64> {
        let map = self.inner.read();
        map.get(&(market, interval))
            .and_then(|s| s.rows.back())
            .and_then(|row| row.stats.get(tag).copied())
    }

    /// Candle time of the latest row.
    pub fn time(&self, market: Market, interval: Interval) -> Option<i64> {
        let map = self.inner.read();
        map.get(&(market, interval))
            .and_then(|s| s.rows.back())
            .map(|row| row.time_ms)
    }

    pub fn row_count(&self, market: Market, interval: Interval) -> usize {
        let map = self.inner.read();
        map.get(&(market, interval)).map_or(0, |s| s.rows.len())
    }

    pub fn is_updated(&self, market: Market, interval: Interval) -> bool {
        let map = self.inner.read();
        map.get(&(market, interval)).is_some_and(|s| s.is_updated)
    }

    pub fn clear_updated(&self, market: Market, interval: Interval) {
        let mut map = self.inner.write();
        if let Some(series) = map.get_mut(&(market, interval)) {
            series.is_updated = false;
        }
    }
}

impl SampleSink for StatTable {
    fn publish(&self, sample: &IndicatorSample) {
        self.upsert(
            sample.market,
            sample.timeframe,
            sample.candle_time_ms,
            &sample.stat_tag(),
            sample.value,
        );
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Per-channel broadcast capacity; slow subscribers lag rather than block the
/// publisher.
const BUS_CHANNEL_CAPACITY: usize = 256;

/// In-process pub/sub bus keyed by deterministic channel strings.
pub struct Bus {
    channels: RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<serde_json::Value> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }
        let mut map = self.channels.write();
        map.entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish `payload` on `channel`. Messages without subscribers are
    /// silently discarded.
    pub fn publish(&self, channel: &str, payload: serde_json::Value) {
        let _ = self.sender(channel).send(payload);
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        self.sender(channel).subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus-backed sample sink: each sample lands on its deterministic key.
pub struct BusSink {
    bus: Arc<Bus>,
}

impl BusSink {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }
}

impl SampleSink for BusSink {
    fn publish(&self, sample: &IndicatorSample) {
        let payload = serde_json::to_value(sample).unwrap_or_default();
        self.bus.publish(&sample.key(), payload);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stat: &'static str, period: usize, value: f64, time: i64) -> IndicatorSample {
        IndicatorSample {
            stat,
            exchange: Exchange::Hyperliquid,
            market: Market::BtcusdPerp,
            timeframe: Interval::OneMinute,
            period,
            value,
            candle_time_ms: time,
            computed_at_ms: time + 500,
        }
    }

    #[test]
    fn sample_key_matches_contract() {
        let s = sample("rsi", 14, 55.0, 60_000);
        assert_eq!(s.key(), "hyperliquid_btcusd_perp_1m_14");
        assert_eq!(s.stat_tag(), "rsi_14");
    }

    #[test]
    fn stat_table_update_or_insert() {
        let table = StatTable::new(8);
        let (m, iv) = (Market::BtcusdPerp, Interval::OneMinute);

        table.upsert(m, iv, 60_000, "rsi_14", 50.0);
        table.upsert(m, iv, 60_000, "rsi_14", 51.0); // overwrite same window
        assert_eq!(table.get(m, iv, "rsi_14"), Some(51.0));
        assert_eq!(table.row_count(m, iv), 1);

        table.upsert(m, iv, 120_000, "rsi_14", 52.0); // new window, new row
        assert_eq!(table.row_count(m, iv), 2);
        assert_eq!(table.time(m, iv), Some(120_000));
        assert_eq!(table.get(m, iv, "rsi_14"), Some(52.0));
    }

    #[test]
    fn stat_table_evicts_past_capacity() {
        let table = StatTable::new(3);
        let (m, iv) = (Market::Btcusd, Interval::OneMinute);
        for i in 0..5_i64 {
            table.upsert(m, iv, i * 60_000, "atr_14", i as f64);
        }
        assert_eq!(table.row_count(m, iv), 3);
        assert_eq!(table.get(m, iv, "atr_14"), Some(4.0));
    }

    #[test]
    fn stat_table_updated_flag() {
        let table = StatTable::new(4);
        let (m, iv) = (Market::Btcusd, Interval::FiveMinutes);
        assert!(!table.is_updated(m, iv));
        table.upsert(m, iv, 300_000, "rsi_5", 60.0);
        assert!(table.is_updated(m, iv));
        table.clear_updated(m, iv);
        assert!(!table.is_updated(m, iv));
    }

    #[test]
    fn stat_sink_uses_tagged_column() {
        let table = StatTable::new(4);
        table.publish(&sample("rsi", 14, 61.5, 60_000));
        table.publish(&sample("atr", 14, 12.25, 60_000));
        assert_eq!(
            table.get(Market::BtcusdPerp, Interval::OneMinute, "rsi_14"),
            Some(61.5)
        );
        assert_eq!(
            table.get(Market::BtcusdPerp, Interval::OneMinute, "atr_14"),
            Some(12.25)
        );
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("hyperliquid_btcusd_perp");
        bus.publish(
            "hyperliquid_btcusd_perp",
            serde_json::json!({"type": "trades", "price": 100.0}),
        );
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["type"], "trades");
    }

    #[tokio::test]
    async fn bus_sink_publishes_on_sample_key() {
        let bus = Arc::new(Bus::new());
        let mut rx = bus.subscribe("hyperliquid_btcusd_perp_1m_14");
        let sink = BusSink::new(bus.clone());
        sink.publish(&sample("rsi", 14, 48.0, 60_000));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["stat"], "rsi");
        assert_eq!(msg["value"], 48.0);
    }
}

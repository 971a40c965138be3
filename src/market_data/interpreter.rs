// =============================================================================
// Trade interpreter — folds the trade stream into per-interval candles
// =============================================================================
//
// Consumes the bounded trade queue and advances every configured interval's
// candle series. For each trade and interval:
//
//   1. late trades (before the in-progress candle) are dropped;
//   2. a trade more than one interval past the in-progress open time means
//      candles were missed: the ring is re-filled from a REST snapshot ending
//      at the trade's aligned timestamp, leaving an empty in-progress candle;
//   3. a trade at the next boundary closes the candle and opens a new one;
//   4. the in-progress candle absorbs the trade: OHLC, total and per-side
//      volume, and the per-candle unique-trader count.
//
// Unique traders are per candle: the set resets on every rollover.
//
// A misaligned in-progress candle time is an invariant violation, never
// repaired here: the trade is dropped, health goes down, and a latched flag
// tells the supervisor to hard-reset.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::exchange::SnapshotClient;
use crate::publish::Bus;
use crate::types::{market_channel, Exchange, Interval, Market, Side, Trade};

use super::candle_series::{CandleRow, CandleSeries, SeriesSet};
use super::trade_queue::TradeQueue;

pub struct TradeInterpreter {
    market: Market,
    channel: String,
    queue: Arc<TradeQueue>,
    series: Arc<SeriesSet>,
    snapshot: Arc<dyn SnapshotClient>,
    bus: Arc<Bus>,
    /// Traders seen in the current candle, per interval.
    trader_sets: Mutex<HashMap<Interval, HashSet<String>>>,
    /// Latched when a candle-time invariant violation is detected; the
    /// supervisor consumes it and escalates to a hard reset.
    invariant_violated: AtomicBool,
}

impl TradeInterpreter {
    pub fn new(
        exchange: Exchange,
        market: Market,
        queue: Arc<TradeQueue>,
        series: Arc<SeriesSet>,
        snapshot: Arc<dyn SnapshotClient>,
        bus: Arc<Bus>,
    ) -> Self {
        Self {
            market,
            channel: market_channel(exchange, market),
            queue,
            series,
            snapshot,
            bus,
            trader_sets: Mutex::new(HashMap::new()),
            invariant_violated: AtomicBool::new(false),
        }
    }

    pub fn series(&self) -> Arc<SeriesSet> {
        self.series.clone()
    }

    /// Consume the queue until the stop signal fires.
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!(channel = %self.channel, "trade interpreter running");
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                trade = self.queue.pop() => self.apply_trade(&trade).await,
            }
        }
        info!(channel = %self.channel, "trade interpreter stopped");
    }

    /// Advance every interval's candle series with one trade, then publish
    /// the trade on the market channel.
    pub async fn apply_trade(&self, trade: &Trade) {
        for series in self.series.all() {
            self.advance(&series, trade).await;
        }

        self.bus.publish(
            &self.channel,
            serde_json::json!({
                "type": "trades",
                "data": {
                    "price": trade.price,
                    "size": trade.size,
                    "side": trade.side,
                    "time": trade.timestamp_ms,
                }
            }),
        );
    }

    async fn advance(&self, series: &Arc<CandleSeries>, trade: &Trade) {
        let interval = series.interval();
        let span = interval.as_millis();
        let last_ct = series.open_time();
        let next_ct = last_ct + span;

        // Late trade: predates the in-progress candle.
        if trade.timestamp_ms < last_ct {
            return;
        }

        if last_ct != 0 && last_ct % span != 0 {
            // Invariant violation: never repair in place. Drop the trade,
            // pull health down, and leave the hard reset to the supervisor.
            error!(
                channel = %self.channel,
                interval = %interval,
                open_time = last_ct,
                "candle time misaligned; escalating to supervisor"
            );
            self.raise_unhealthy();
            self.invariant_violated.store(true, Ordering::Release);
            return;
        }

        if trade.timestamp_ms - span > last_ct {
            // Missed at least one full candle: back-fill from REST, then let
            // this trade populate the fresh in-progress candle.
            self.bootstrap_series(series, interval.align(trade.timestamp_ms))
                .await;
            self.update_in_progress(series, interval, trade);
            return;
        }

        if trade.timestamp_ms >= next_ct {
            self.close_candle(series, interval, next_ct, trade.price);
        }

        self.update_in_progress(series, interval, trade);
    }

    /// Close the in-progress candle and open the next one at `next_ct`.
    fn close_candle(&self, series: &Arc<CandleSeries>, interval: Interval, next_ct: i64, open: f64) {
        let closed = series.latest();
        series.create_candle();
        self.trader_sets.lock().entry(interval).or_default().clear();
        series.set_open_time(next_ct);
        series.set_open(open);

        self.bus.publish(
            &self.channel,
            serde_json::json!({
                "type": "candle",
                "timeframe": interval.as_str(),
                "data": {
                    "t": closed.open_time_ms,
                    "o": closed.open,
                    "h": closed.high,
                    "l": closed.low,
                    "c": closed.close,
                    "v": closed.volume,
                    "bv": closed.buyer_volume,
                    "sv": closed.seller_volume,
                    "u": closed.unique_traders,
                }
            }),
        );
    }

    fn update_in_progress(&self, series: &Arc<CandleSeries>, interval: Interval, trade: &Trade) {
        let row = series.latest();

        if row.high == 0.0 && row.low == 0.0 {
            // First trade of this candle (prices are never zero).
            if row.open == 0.0 {
                series.set_open(trade.price);
            }
            series.set_high(trade.price.max(row.open));
            series.set_low(if row.open > 0.0 {
                trade.price.min(row.open)
            } else {
                trade.price
            });
        } else {
            if trade.price > row.high {
                series.set_high(trade.price);
            }
            if trade.price < row.low {
                series.set_low(trade.price);
            }
        }

        series.set_close(trade.price);
        series.add_volume(trade.size);
        match trade.side {
            Side::Buy => series.add_buyer_volume(trade.size),
            Side::Sell => series.add_seller_volume(trade.size),
        }

        if !trade.traders.is_empty() {
            let mut sets = self.trader_sets.lock();
            let set = sets.entry(interval).or_default();
            for user in &trade.traders {
                set.insert(user.clone());
            }
            series.set_unique_traders(set.len() as i64);
        }

        series.set_last_trade_price(trade.price);
        series.mark_updated();
    }

    /// Re-fill a series from the snapshot client, ending at `end_time_ms`
    /// (aligned). Historical rows carry exchange-reported OHLCV only; the
    /// in-progress candle is left empty for live trades to advance.
    async fn bootstrap_series(&self, series: &Arc<CandleSeries>, end_time_ms: i64) {
        if let Err(e) = self.try_bootstrap(series, end_time_ms).await {
            error!(
                channel = %self.channel,
                interval = %series.interval(),
                error = %e,
                "candle bootstrap failed"
            );
        }
    }

    async fn try_bootstrap(&self, series: &Arc<CandleSeries>, end_time_ms: i64) -> Result<()> {
        let interval = series.interval();
        let span = interval.as_millis();
        let depth = series.capacity() as i64;

        let candles = self
            .snapshot
            .candle_snapshot(self.market, interval, end_time_ms - depth * span, end_time_ms)
            .await?;

        if candles.is_empty() {
            warn!(
                channel = %self.channel,
                interval = %interval,
                "snapshot returned no candles"
            );
        }

        for candle in candles.iter().filter(|c| c.t != end_time_ms) {
            series.create_candle();
            series.set_latest(CandleRow {
                open_time_ms: candle.t,
                open: candle.o,
                high: candle.h,
                low: candle.l,
                close: candle.c,
                volume: candle.v,
                buyer_volume: 0.0,
                seller_volume: 0.0,
                unique_traders: 0,
            });
        }

        // Fresh, empty in-progress candle at the target boundary.
        series.create_candle();
        series.set_open_time(end_time_ms);
        self.trader_sets.lock().entry(interval).or_default().clear();
        series.mark_updated();

        info!(
            channel = %self.channel,
            interval = %interval,
            end_time_ms,
            count = candles.len(),
            "series bootstrapped from snapshot"
        );
        Ok(())
    }

    // ── Liveness signalling (called by the supervisor) ──────────────────

    pub fn raise_unhealthy(&self) {
        self.series.set_healthy(false);
    }

    pub fn back_to_healthy(&self) {
        self.series.set_healthy(true);
    }

    /// Consume the latched invariant-violation flag. The supervisor polls
    /// this from its watchdog and answers with a hard reset.
    pub fn take_invariant_violation(&self) -> bool {
        self.invariant_violated.swap(false, Ordering::AcqRel)
    }
}

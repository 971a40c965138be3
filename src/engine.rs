// =============================================================================
// Indicator engine — periodic kernel evaluation over candle buffers
// =============================================================================
//
// One engine per (market, indicator family). The engine keeps its own
// close/high/low buffers per subscribed timeframe, seeded from a REST
// snapshot and advanced from the live candle series:
//
//   live candle t == buffer t  => overwrite the last slot in place
//   live candle t  > buffer t  => shift once and append
//   live candle t  < buffer t  => ignore
//
// Subscriptions arrive over a command queue so the loop never blocks callers
// and the engine could be pushed into its own process without changing the
// interface.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::exchange::SnapshotClient;
use crate::indicators;
use crate::market_data::SeriesSet;
use crate::publish::{IndicatorSample, SampleSink};
use crate::types::{indicator_channel, Exchange, IndicatorKind, Interval, Market};

/// Evaluation cadence.
const ENGINE_TICK: Duration = Duration::from_millis(100);
/// Per-timeframe buffer depth; 200 keeps Wilder smoothing stable.
const ENGINE_BUFFER_LEN: usize = 200;
/// HMA window published alongside the RSI family stats.
const HMA_PERIOD: usize = 55;
/// SMA window for the SMA family (value and regression slope).
const SMA_WINDOW: usize = 10;
const SLOPE_TOL: f64 = 1e-6;

#[derive(Debug)]
enum EngineCommand {
    Subscribe { period: usize, timeframe: Interval },
}

pub struct IndicatorEngine {
    exchange: Exchange,
    market: Market,
    family: IndicatorKind,
    /// Deterministic engine key: `{exchange}_{market}_{family}`.
    pk: String,
    series: Arc<SeriesSet>,
    snapshot: Arc<dyn SnapshotClient>,
    sinks: Vec<Arc<dyn SampleSink>>,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineCommand>>>,
    /// Total subscribe calls routed to this engine (initial and replays).
    subscribe_requests: AtomicU64,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IndicatorEngine {
    pub fn new(
        exchange: Exchange,
        market: Market,
        family: IndicatorKind,
        series: Arc<SeriesSet>,
        snapshot: Arc<dyn SnapshotClient>,
        sinks: Vec<Arc<dyn SampleSink>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            exchange,
            market,
            family,
            pk: format!("{}_{}_{}", exchange, market, family),
            series,
            snapshot,
            sinks,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            subscribe_requests: AtomicU64::new(0),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    pub fn family(&self) -> IndicatorKind {
        self.family
    }

    pub fn pk(&self) -> &str {
        &self.pk
    }

    pub fn subscribe_request_count(&self) -> u64 {
        self.subscribe_requests.load(Ordering::Relaxed)
    }

    /// Spawn the evaluation loop. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            return;
        };
        let runner = EngineLoop {
            exchange: self.exchange,
            market: self.market,
            family: self.family,
            pk: self.pk.clone(),
            series: self.series.clone(),
            snapshot: self.snapshot.clone(),
            sinks: self.sinks.clone(),
            buffers: HashMap::new(),
            periods: HashMap::new(),
        };
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(runner.run(cmd_rx, stop_rx)));
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Non-blocking subscription; duplicate tuples re-enqueue harmlessly.
    /// Returns the deterministic sample key.
    pub fn subscribe(&self, period: usize, timeframe: Interval) -> String {
        self.subscribe_requests.fetch_add(1, Ordering::Relaxed);
        let _ = self.cmd_tx.send(EngineCommand::Subscribe { period, timeframe });
        match self.family {
            IndicatorKind::Rsi => {
                indicator_channel(self.exchange, self.market, timeframe, period)
            }
            IndicatorKind::Macd | IndicatorKind::Sma => self.pk.clone(),
        }
    }
}

// =============================================================================
// Evaluation loop
// =============================================================================

struct TimeframeBuffer {
    closes: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    /// Open time of the last buffer slot.
    current_t: i64,
}

struct EngineLoop {
    exchange: Exchange,
    market: Market,
    family: IndicatorKind,
    pk: String,
    series: Arc<SeriesSet>,
    snapshot: Arc<dyn SnapshotClient>,
    sinks: Vec<Arc<dyn SampleSink>>,
    buffers: HashMap<Interval, TimeframeBuffer>,
    periods: HashMap<Interval, BTreeSet<usize>>,
}

impl EngineLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!(engine = %self.pk, "indicator engine running");
        loop {
            while let Ok(cmd) = cmd_rx.try_recv() {
                self.handle_command(cmd).await;
            }

            self.tick();

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(ENGINE_TICK) => {}
            }
        }
        info!(engine = %self.pk, "indicator engine stopped");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Subscribe { period, timeframe } => {
                if !self.buffers.contains_key(&timeframe) {
                    match self.bootstrap_buffer(timeframe).await {
                        Ok(buf) => {
                            self.buffers.insert(timeframe, buf);
                        }
                        Err(e) => {
                            error!(
                                engine = %self.pk,
                                timeframe = %timeframe,
                                error = %e,
                                "buffer bootstrap failed; starting empty"
                            );
                            self.buffers.insert(
                                timeframe,
                                TimeframeBuffer {
                                    closes: Vec::new(),
                                    highs: Vec::new(),
                                    lows: Vec::new(),
                                    current_t: 0,
                                },
                            );
                        }
                    }
                }
                self.periods.entry(timeframe).or_default().insert(period);
                info!(
                    engine = %self.pk,
                    timeframe = %timeframe,
                    period,
                    "engine subscription added"
                );
            }
        }
    }

    /// Seed a timeframe buffer with the most recent historical candles.
    async fn bootstrap_buffer(&self, timeframe: Interval) -> anyhow::Result<TimeframeBuffer> {
        let span = timeframe.as_millis();
        let live_t = self
            .series
            .get(timeframe)
            .map(|s| s.open_time())
            .unwrap_or(0);
        let end = if live_t > 0 {
            live_t
        } else {
            timeframe.align(chrono::Utc::now().timestamp_millis())
        };

        let candles = self
            .snapshot
            .candle_snapshot(
                self.market,
                timeframe,
                end - ENGINE_BUFFER_LEN as i64 * span,
                end,
            )
            .await?;

        let tail = candles.len().saturating_sub(ENGINE_BUFFER_LEN);
        let recent = &candles[tail..];
        let buf = TimeframeBuffer {
            closes: recent.iter().map(|c| c.c).collect(),
            highs: recent.iter().map(|c| c.h).collect(),
            lows: recent.iter().map(|c| c.l).collect(),
            current_t: recent.last().map(|c| c.t).unwrap_or(0),
        };
        info!(
            engine = %self.pk,
            timeframe = %timeframe,
            depth = buf.closes.len(),
            last_t = buf.current_t,
            "buffer bootstrapped"
        );
        Ok(buf)
    }

    fn tick(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        for (&timeframe, buf) in self.buffers.iter_mut() {
            let Some(series) = self.series.get(timeframe) else {
                continue;
            };
            // Hold off until the ingest side declares the series healthy.
            if !series.is_updated() {
                continue;
            }
            let live = series.latest();
            if live.high == 0.0 {
                // Freshly bootstrapped candle with no trades yet.
                continue;
            }

            buf.advance(live.open_time_ms, live.close, live.high, live.low);

            let Some(periods) = self.periods.get(&timeframe) else {
                continue;
            };
            let results =
                evaluate_family(self.family, &buf.closes, &buf.highs, &buf.lows, periods);

            for (stat, period, value) in results {
                if !value.is_finite() {
                    warn!(engine = %self.pk, stat, "non-finite sample dropped");
                    continue;
                }
                let sample = IndicatorSample {
                    stat,
                    exchange: self.exchange,
                    market: self.market,
                    timeframe,
                    period,
                    value,
                    candle_time_ms: buf.current_t,
                    computed_at_ms: now_ms,
                };
                for sink in &self.sinks {
                    sink.publish(&sample);
                }
            }
        }
    }
}

impl TimeframeBuffer {
    fn advance(&mut self, t: i64, close: f64, high: f64, low: f64) {
        if self.current_t == 0 || t > self.current_t {
            if self.closes.len() == ENGINE_BUFFER_LEN {
                self.closes.remove(0);
                self.highs.remove(0);
                self.lows.remove(0);
            }
            self.closes.push(close);
            self.highs.push(high);
            self.lows.push(low);
            self.current_t = t;
        } else if t == self.current_t {
            *self.closes.last_mut().expect("non-empty after first advance") = close;
            *self.highs.last_mut().expect("non-empty") = high;
            *self.lows.last_mut().expect("non-empty") = low;
        }
        // t < current_t: stale candle, ignore.
    }
}

/// Evaluate one family over the buffers. Kernels that report insufficient
/// data are skipped; buffers simply have not filled yet.
fn evaluate_family(
    family: IndicatorKind,
    closes: &[f64],
    highs: &[f64],
    lows: &[f64],
    periods: &BTreeSet<usize>,
) -> Vec<(&'static str, usize, f64)> {
    let mut out = Vec::new();
    match family {
        IndicatorKind::Rsi => {
            for &period in periods {
                if let Ok(value) = indicators::rsi(closes, period) {
                    out.push(("rsi", period, value));
                }
                if let Ok(value) = indicators::atr(highs, lows, closes, period) {
                    out.push(("atr", period, value));
                }
            }
            if let Ok(value) = indicators::hma(closes, HMA_PERIOD) {
                out.push(("hma", HMA_PERIOD, value));
            }
        }
        IndicatorKind::Macd => {
            for &period in periods {
                if let Ok((macd, signal, histogram)) = indicators::macd(
                    closes,
                    indicators::macd::MACD_FAST,
                    indicators::macd::MACD_SLOW,
                    indicators::macd::MACD_SIGNAL,
                ) {
                    out.push(("macd", period, macd));
                    out.push(("macd_signal", period, signal));
                    out.push(("macd_histogram", period, histogram));
                }
            }
        }
        IndicatorKind::Sma => {
            for &period in periods {
                let Ok(smas) = indicators::sma(closes, SMA_WINDOW) else {
                    continue;
                };
                let Ok(slopes) = indicators::regression_slope(&smas, SMA_WINDOW) else {
                    continue;
                };
                let segments = indicators::slope_segments(&slopes, SLOPE_TOL);
                if let (Some(&sma_last), Some(segment)) = (smas.last(), segments.last()) {
                    out.push(("sma", period, sma_last));
                    out.push(("sma_slope", period, segment.mean_slope));
                }
            }
        }
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SnapshotCandle;
    use crate::market_data::SERIES_CAPACITY;
    use crate::publish::{Bus, BusSink, StatTable};
    use anyhow::Result;
    use async_trait::async_trait;

    const T: i64 = 1_700_000_040_000;

    struct MockSnapshot;

    #[async_trait]
    impl SnapshotClient for MockSnapshot {
        async fn candle_snapshot(
            &self,
            _market: Market,
            interval: Interval,
            start_ms: i64,
            end_ms: i64,
        ) -> Result<Vec<SnapshotCandle>> {
            let span = interval.as_millis();
            let count = ((end_ms - start_ms) / span) as usize;
            Ok((0..count)
                .map(|i| {
                    let t = end_ms - (count - 1 - i) as i64 * span;
                    // Gently rising closes, deterministic.
                    let c = 100.0 + i as f64 * 0.1;
                    SnapshotCandle {
                        t,
                        o: c - 0.05,
                        h: c + 0.5,
                        l: c - 0.5,
                        c,
                        v: 5.0,
                    }
                })
                .collect())
        }
    }

    fn expected_snapshot_buffers(end: i64, span: i64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let count = ENGINE_BUFFER_LEN;
        let mut closes = Vec::new();
        let mut highs = Vec::new();
        let mut lows = Vec::new();
        for i in 0..count {
            let _t = end - (count - 1 - i) as i64 * span;
            let c = 100.0 + i as f64 * 0.1;
            closes.push(c);
            highs.push(c + 0.5);
            lows.push(c - 0.5);
        }
        (closes, highs, lows)
    }

    fn rising_periods(values: &[usize]) -> BTreeSet<usize> {
        values.iter().copied().collect()
    }

    #[test]
    fn evaluate_rsi_family_outputs_rsi_atr_hma() {
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.21).sin()).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let out = evaluate_family(
            IndicatorKind::Rsi,
            &closes,
            &highs,
            &lows,
            &rising_periods(&[14]),
        );
        let stats: Vec<&str> = out.iter().map(|(s, _, _)| *s).collect();
        assert!(stats.contains(&"rsi"));
        assert!(stats.contains(&"atr"));
        assert!(stats.contains(&"hma"));

        let rsi = out.iter().find(|(s, _, _)| *s == "rsi").unwrap();
        assert_eq!(rsi.1, 14);
        assert!((0.0..=100.0).contains(&rsi.2));
        let hma = out.iter().find(|(s, _, _)| *s == "hma").unwrap();
        assert_eq!(hma.1, HMA_PERIOD);
    }

    #[test]
    fn evaluate_macd_family_outputs_triple() {
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + i as f64 * 0.2).collect();
        let out = evaluate_family(
            IndicatorKind::Macd,
            &closes,
            &[],
            &[],
            &rising_periods(&[14]),
        );
        assert_eq!(out.len(), 3);
        let (m, s, h) = (out[0].2, out[1].2, out[2].2);
        assert!((h - (m - s)).abs() < 1e-12);
        assert!(m > 0.0);
    }

    #[test]
    fn evaluate_sma_family_outputs_value_and_slope() {
        let closes: Vec<f64> = (0..60).map(|i| 50.0 + i as f64).collect();
        let out = evaluate_family(
            IndicatorKind::Sma,
            &closes,
            &[],
            &[],
            &rising_periods(&[10]),
        );
        let sma = out.iter().find(|(s, _, _)| *s == "sma").unwrap();
        let slope = out.iter().find(|(s, _, _)| *s == "sma_slope").unwrap();
        // SMA of the final window of a unit-step line; slope is 1.
        assert!((sma.2 - (closes[50..].iter().sum::<f64>() / 10.0)).abs() < 1e-9);
        assert!((slope.2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn evaluate_skips_insufficient_buffers() {
        let closes = vec![100.0; 5];
        let out = evaluate_family(
            IndicatorKind::Rsi,
            &closes,
            &closes,
            &closes,
            &rising_periods(&[14]),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn buffer_advance_follows_alignment_rules() {
        let mut buf = TimeframeBuffer {
            closes: vec![1.0, 2.0],
            highs: vec![1.5, 2.5],
            lows: vec![0.5, 1.5],
            current_t: 120_000,
        };

        // Same t: overwrite in place.
        buf.advance(120_000, 2.2, 2.6, 1.6);
        assert_eq!(buf.closes, vec![1.0, 2.2]);

        // Greater t: shift once and append.
        buf.advance(180_000, 3.0, 3.5, 2.5);
        assert_eq!(buf.closes, vec![1.0, 2.2, 3.0]);
        assert_eq!(buf.current_t, 180_000);

        // Lesser t: ignored.
        buf.advance(60_000, 9.9, 9.9, 9.9);
        assert_eq!(buf.closes, vec![1.0, 2.2, 3.0]);
        assert_eq!(buf.current_t, 180_000);
    }

    #[test]
    fn buffer_advance_caps_length() {
        let mut buf = TimeframeBuffer {
            closes: vec![0.0; ENGINE_BUFFER_LEN],
            highs: vec![0.0; ENGINE_BUFFER_LEN],
            lows: vec![0.0; ENGINE_BUFFER_LEN],
            current_t: 60_000,
        };
        buf.advance(120_000, 1.0, 1.0, 1.0);
        assert_eq!(buf.closes.len(), ENGINE_BUFFER_LEN);
        assert_eq!(*buf.closes.last().unwrap(), 1.0);
    }

    #[tokio::test]
    async fn subscribe_key_shapes() {
        let series = Arc::new(SeriesSet::new(
            Market::BtcusdPerp,
            &[Interval::OneMinute],
            SERIES_CAPACITY,
        ));
        let rsi = IndicatorEngine::new(
            Exchange::Hyperliquid,
            Market::BtcusdPerp,
            IndicatorKind::Rsi,
            series.clone(),
            Arc::new(MockSnapshot),
            Vec::new(),
        );
        assert_eq!(
            rsi.subscribe(14, Interval::OneMinute),
            "hyperliquid_btcusd_perp_1m_14"
        );

        let macd = IndicatorEngine::new(
            Exchange::Hyperliquid,
            Market::BtcusdPerp,
            IndicatorKind::Macd,
            series,
            Arc::new(MockSnapshot),
            Vec::new(),
        );
        assert_eq!(
            macd.subscribe(14, Interval::OneMinute),
            "hyperliquid_btcusd_perp_macd"
        );
    }

    #[tokio::test]
    async fn engine_publishes_rsi_to_sinks() {
        let span = Interval::OneMinute.as_millis();
        let series = Arc::new(SeriesSet::new(
            Market::BtcusdPerp,
            &[Interval::OneMinute],
            SERIES_CAPACITY,
        ));

        // Live candle at T with a known close; series healthy.
        let s = series.get(Interval::OneMinute).unwrap();
        s.create_candle();
        s.set_open_time(T);
        s.set_open(120.0);
        s.set_high(121.0);
        s.set_low(119.0);
        s.set_close(120.5);
        s.mark_updated();

        let stat_table = Arc::new(StatTable::new(SERIES_CAPACITY));
        let bus = Arc::new(Bus::new());
        let mut rx = bus.subscribe("hyperliquid_btcusd_perp_1m_14");

        let engine = Arc::new(IndicatorEngine::new(
            Exchange::Hyperliquid,
            Market::BtcusdPerp,
            IndicatorKind::Rsi,
            series.clone(),
            Arc::new(MockSnapshot),
            vec![stat_table.clone(), Arc::new(BusSink::new(bus.clone()))],
        ));

        let key = engine.subscribe(14, Interval::OneMinute);
        assert_eq!(key, "hyperliquid_btcusd_perp_1m_14");
        engine.start();
        tokio::time::sleep(Duration::from_millis(350)).await;
        engine.stop().await;

        // Expected: snapshot buffer whose last (in-progress, t == T) slot is
        // overwritten by the live close.
        let (mut closes, mut highs, mut lows) = expected_snapshot_buffers(T, span);
        *closes.last_mut().unwrap() = 120.5;
        *highs.last_mut().unwrap() = 121.0;
        *lows.last_mut().unwrap() = 119.0;
        let expected_rsi = indicators::rsi(&closes, 14).unwrap();
        let expected_atr = indicators::atr(&highs, &lows, &closes, 14).unwrap();

        let got_rsi = stat_table
            .get(Market::BtcusdPerp, Interval::OneMinute, "rsi_14")
            .expect("rsi published");
        assert!((got_rsi - expected_rsi).abs() < 1e-6, "rsi {got_rsi} vs {expected_rsi}");

        let got_atr = stat_table
            .get(Market::BtcusdPerp, Interval::OneMinute, "atr_14")
            .expect("atr published");
        assert!((got_atr - expected_atr).abs() < 1e-6);

        // Bus side carries the same sample under the deterministic key.
        let msg = rx.recv().await.expect("bus sample");
        assert_eq!(msg["stat"], "rsi");
        assert_eq!(msg["period"], 14);
    }

    #[tokio::test]
    async fn engine_waits_for_healthy_series() {
        let series = Arc::new(SeriesSet::new(
            Market::BtcusdPerp,
            &[Interval::OneMinute],
            SERIES_CAPACITY,
        ));
        // Candle exists but the series is not marked healthy.
        let s = series.get(Interval::OneMinute).unwrap();
        s.create_candle();
        s.set_open_time(T);
        s.set_close(100.0);
        s.set_high(100.0);
        s.set_low(100.0);

        let stat_table = Arc::new(StatTable::new(SERIES_CAPACITY));
        let engine = Arc::new(IndicatorEngine::new(
            Exchange::Hyperliquid,
            Market::BtcusdPerp,
            IndicatorKind::Rsi,
            series,
            Arc::new(MockSnapshot),
            vec![stat_table.clone()],
        ));
        engine.subscribe(14, Interval::OneMinute);
        engine.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        engine.stop().await;

        assert!(stat_table
            .get(Market::BtcusdPerp, Interval::OneMinute, "rsi_14")
            .is_none());
    }
}

// =============================================================================
// Manager — owns workers and indicator engines, runs the outer watcher
// =============================================================================
//
// Process-wide singleton by construction: main builds exactly one and hands
// an Arc to the HTTP layer (no hidden module state). All maps are mutated
// only behind the single async mutex, so subscribe/restart/stop serialise.
//
// Restart escalation: a supervisor that fails its inner watchdog (or goes
// stale past the restart threshold) is stopped, rebuilt on the same candle
// series, and its subscriptions replayed in original order. A worker that
// goes stale again within one window of its restart is marked dead and
// further subscribes for that (exchange, market) are refused.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::engine::IndicatorEngine;
use crate::errors::MonitorError;
use crate::exchange::{
    default_connector_factory, default_snapshot_factory, ConnectorFactory, SnapshotClient,
    SnapshotFactory,
};
use crate::market_data::{SeriesSet, SERIES_CAPACITY};
use crate::publish::{Bus, BusSink, SampleSink, StatTable};
use crate::settings::Settings;
use crate::types::{DataType, Exchange, IndicatorKind, Interval, Market};
use crate::worker::ExchangeWorker;

/// A recorded subscription; the full tuple is the deduplication key and the
/// recorded order drives replay after a worker restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Market {
        exchange: Exchange,
        market: Market,
        data_type: DataType,
        timeframe: Option<Interval>,
    },
    Indicator {
        exchange: Exchange,
        market: Market,
        indicator: IndicatorKind,
        period: usize,
        timeframe: Interval,
    },
}

type WorkerKey = (Exchange, Market);

struct ManagerInner {
    workers: HashMap<WorkerKey, Arc<ExchangeWorker>>,
    engines: HashMap<(Exchange, Market, IndicatorKind), Arc<IndicatorEngine>>,
    /// Candle rings outlive workers so restarts continue the same series.
    series_sets: HashMap<WorkerKey, Arc<SeriesSet>>,
    subscriptions: Vec<Subscription>,
    dead: HashSet<WorkerKey>,
    /// Wall-clock ms of the last watcher-driven restart per worker.
    restarted_at: HashMap<WorkerKey, i64>,
    watcher: Option<tokio::task::JoinHandle<()>>,
    stopped: bool,
}

pub struct Manager {
    settings: Settings,
    bus: Arc<Bus>,
    stat_table: Arc<StatTable>,
    connector_factory: ConnectorFactory,
    snapshot_factory: SnapshotFactory,
    stop_tx: watch::Sender<bool>,
    inner: Mutex<ManagerInner>,
}

impl Manager {
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_factories(
            settings,
            default_connector_factory(),
            default_snapshot_factory(),
        )
    }

    /// Construction seam for tests: swap the venue-facing factories.
    pub fn with_factories(
        settings: Settings,
        connector_factory: ConnectorFactory,
        snapshot_factory: SnapshotFactory,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            bus: Arc::new(Bus::new()),
            stat_table: Arc::new(StatTable::new(SERIES_CAPACITY)),
            connector_factory,
            snapshot_factory,
            stop_tx,
            inner: Mutex::new(ManagerInner {
                workers: HashMap::new(),
                engines: HashMap::new(),
                series_sets: HashMap::new(),
                subscriptions: Vec::new(),
                dead: HashSet::new(),
                restarted_at: HashMap::new(),
                watcher: None,
                stopped: false,
            }),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub fn stat_table(&self) -> Arc<StatTable> {
        self.stat_table.clone()
    }

    /// Snapshot client for the synchronous /candle endpoint.
    pub fn snapshot_client(
        &self,
        exchange: Exchange,
    ) -> Result<Arc<dyn SnapshotClient>, MonitorError> {
        (self.snapshot_factory)(exchange, self.settings.network)
    }

    // ── Subscribe ───────────────────────────────────────────────────────

    /// Subscribe a raw market stream. Idempotent for identical tuples;
    /// returns the deterministic channel `{exchange}_{market}`.
    pub async fn subscribe_market(
        &self,
        exchange: Exchange,
        market: Market,
        data_type: DataType,
        timeframe: Option<Interval>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let key = (exchange, market);
        if inner.dead.contains(&key) {
            return Err(MonitorError::MarketDead { exchange, market }.into());
        }

        let worker = self.ensure_worker(&mut inner, exchange, market).await?;
        let channel = worker.subscribe(data_type, timeframe)?;

        let record = Subscription::Market {
            exchange,
            market,
            data_type,
            timeframe,
        };
        if !inner.subscriptions.contains(&record) {
            inner.subscriptions.push(record);
        }
        Ok(channel)
    }

    /// Subscribe an indicator family. Ensures the underlying candle stream
    /// first, then routes to the engine; returns the sample key.
    pub async fn subscribe_indicator(
        &self,
        exchange: Exchange,
        market: Market,
        indicator: IndicatorKind,
        period: usize,
        timeframe: Interval,
    ) -> Result<String> {
        self.subscribe_market(exchange, market, DataType::Candle, Some(timeframe))
            .await?;

        let mut inner = self.inner.lock().await;
        let engine = self
            .ensure_engine(&mut inner, exchange, market, indicator)
            .await?;
        let channel = engine.subscribe(period, timeframe);

        let record = Subscription::Indicator {
            exchange,
            market,
            indicator,
            period,
            timeframe,
        };
        if !inner.subscriptions.contains(&record) {
            inner.subscriptions.push(record);
        }
        Ok(channel)
    }

    /// Recorded subscriptions in arrival order.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().await.subscriptions.clone()
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    pub async fn is_dead(&self, exchange: Exchange, market: Market) -> bool {
        self.inner.lock().await.dead.contains(&(exchange, market))
    }

    pub async fn indicator_engine(
        &self,
        exchange: Exchange,
        market: Market,
        indicator: IndicatorKind,
    ) -> Option<Arc<IndicatorEngine>> {
        self.inner
            .lock()
            .await
            .engines
            .get(&(exchange, market, indicator))
            .cloned()
    }

    // ── Factories ───────────────────────────────────────────────────────

    async fn ensure_worker(
        &self,
        inner: &mut ManagerInner,
        exchange: Exchange,
        market: Market,
    ) -> Result<Arc<ExchangeWorker>> {
        let key = (exchange, market);
        if let Some(worker) = inner.workers.get(&key) {
            return Ok(worker.clone());
        }

        let series = inner
            .series_sets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(SeriesSet::new(
                    market,
                    &self.settings.intervals,
                    SERIES_CAPACITY,
                ))
            })
            .clone();
        let snapshot = (self.snapshot_factory)(exchange, self.settings.network)?;

        let worker = ExchangeWorker::new(
            exchange,
            market,
            series.clone(),
            snapshot.clone(),
            self.bus.clone(),
            self.settings.network,
            self.connector_factory.clone(),
            self.settings.soft_reset_threshold,
            self.settings.hard_reset_threshold,
        )?;
        worker.clone().start().await?;
        inner.workers.insert(key, worker.clone());
        info!(channel = %worker.channel(), "exchange worker created");

        // Baseline stats for every new market: RSI/ATR for the configured
        // periods plus HMA, across all configured intervals, into the stat
        // table and onto the bus.
        let engine = self
            .ensure_engine(inner, exchange, market, IndicatorKind::Rsi)
            .await?;
        for &interval in &self.settings.intervals {
            for &period in &self.settings.indicator_periods {
                engine.subscribe(period, interval);
            }
        }

        Ok(worker)
    }

    async fn ensure_engine(
        &self,
        inner: &mut ManagerInner,
        exchange: Exchange,
        market: Market,
        indicator: IndicatorKind,
    ) -> Result<Arc<IndicatorEngine>> {
        let key = (exchange, market, indicator);
        if let Some(engine) = inner.engines.get(&key) {
            return Ok(engine.clone());
        }

        let series = inner
            .series_sets
            .get(&(exchange, market))
            .cloned()
            .ok_or(MonitorError::UnsupportedIndicator { exchange, indicator })?;
        let snapshot = (self.snapshot_factory)(exchange, self.settings.network)
            .map_err(|_| MonitorError::UnsupportedIndicator { exchange, indicator })?;

        let sinks: Vec<Arc<dyn SampleSink>> = vec![
            self.stat_table.clone(),
            Arc::new(BusSink::new(self.bus.clone())),
        ];
        let engine = Arc::new(IndicatorEngine::new(
            exchange, market, indicator, series, snapshot, sinks,
        ));
        engine.start();
        inner.engines.insert(key, engine.clone());
        info!(engine = %engine.pk(), "indicator engine created");
        Ok(engine)
    }

    // ── Outer watcher ───────────────────────────────────────────────────

    /// Spawn the watcher that restarts stale or failed supervisors.
    pub async fn start_watcher(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.watcher.is_some() {
            return;
        }
        let manager = self.clone();
        let stop_rx = self.stop_tx.subscribe();
        inner.watcher = Some(tokio::spawn(manager.watch_loop(stop_rx)));
        info!("manager watcher started");
    }

    async fn watch_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let cadence = self.settings.restart_threshold;
        let threshold_ms = cadence.as_millis() as i64;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(cadence) => {}
            }

            let now = chrono::Utc::now().timestamp_millis();
            let stale: Vec<WorkerKey> = {
                let inner = self.inner.lock().await;
                inner
                    .workers
                    .iter()
                    .filter(|(_, worker)| {
                        worker.failed() || now - worker.last_update_ms() > threshold_ms
                    })
                    .map(|(&key, _)| key)
                    .collect()
            };

            for key in stale {
                self.restart_worker(key).await;
            }
        }
        info!("manager watcher stopped");
    }

    /// Stop a stale supervisor, rebuild it on the same candle series, and
    /// replay its recorded subscriptions in original order. A worker that is
    /// back here within one threshold window of its last restart is dead.
    pub async fn restart_worker(&self, key: WorkerKey) {
        let (exchange, market) = key;
        let mut inner = self.inner.lock().await;
        let Some(worker) = inner.workers.get(&key).cloned() else {
            return;
        };

        let now = chrono::Utc::now().timestamp_millis();
        let window_ms = 2 * self.settings.restart_threshold.as_millis() as i64;
        if let Some(&last_restart) = inner.restarted_at.get(&key) {
            if now - last_restart <= window_ms {
                error!(
                    channel = %worker.channel(),
                    "restart did not restore liveness; marking market dead"
                );
                inner.workers.remove(&key);
                inner.dead.insert(key);
                drop(inner);
                worker.stop().await;
                return;
            }
        }

        warn!(channel = %worker.channel(), "restarting exchange worker");
        worker.stop().await;

        let result = async {
            let series = inner
                .series_sets
                .get(&key)
                .cloned()
                .expect("series set exists for live worker");
            let snapshot = (self.snapshot_factory)(exchange, self.settings.network)?;
            let fresh = ExchangeWorker::new(
                exchange,
                market,
                series,
                snapshot,
                self.bus.clone(),
                self.settings.network,
                self.connector_factory.clone(),
                self.settings.soft_reset_threshold,
                self.settings.hard_reset_threshold,
            )?;
            fresh.clone().start().await?;
            Ok::<_, anyhow::Error>(fresh)
        }
        .await;

        match result {
            Ok(fresh) => {
                // Replay every retained subscription in original arrival
                // order: market streams onto the replacement worker,
                // indicator tuples back onto their engines (engines survive
                // the restart, so the re-issue is idempotent).
                let subs = inner.subscriptions.clone();
                for sub in &subs {
                    match sub {
                        Subscription::Market {
                            exchange: sub_ex,
                            market: sub_mkt,
                            data_type,
                            timeframe,
                        } if (*sub_ex, *sub_mkt) == key => {
                            if let Err(e) = fresh.subscribe(*data_type, *timeframe) {
                                warn!(
                                    channel = %fresh.channel(),
                                    error = %e,
                                    "subscription replay failed"
                                );
                            }
                        }
                        Subscription::Indicator {
                            exchange: sub_ex,
                            market: sub_mkt,
                            indicator,
                            period,
                            timeframe,
                        } if (*sub_ex, *sub_mkt) == key => {
                            match inner.engines.get(&(*sub_ex, *sub_mkt, *indicator)) {
                                Some(engine) => {
                                    engine.subscribe(*period, *timeframe);
                                }
                                None => {
                                    warn!(
                                        exchange = %sub_ex,
                                        market = %sub_mkt,
                                        indicator = %indicator,
                                        "indicator engine missing during replay"
                                    );
                                }
                            }
                        }
                        _ => {}
                    }
                }
                inner.workers.insert(key, fresh);
                inner.restarted_at.insert(key, now);
            }
            Err(e) => {
                error!(
                    exchange = %exchange,
                    market = %market,
                    error = %e,
                    "worker restart failed; marking market dead"
                );
                inner.workers.remove(&key);
                inner.dead.insert(key);
            }
        }
    }

    // ── Stop ────────────────────────────────────────────────────────────

    /// Stop engines, then supervisors, then the watcher. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.stopped {
            return;
        }
        inner.stopped = true;

        info!("stopping indicator engines");
        for engine in inner.engines.values() {
            engine.stop().await;
        }
        info!("stopping exchange workers");
        for worker in inner.workers.values() {
            worker.stop().await;
        }

        let _ = self.stop_tx.send(true);
        if let Some(watcher) = inner.watcher.take() {
            let _ = watcher.await;
        }
        info!("manager stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MonitorError;
    use crate::exchange::{
        ChannelSub, ConnState, Connector, ConnectorContext, SnapshotCandle,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    struct NullSnapshot;

    #[async_trait]
    impl SnapshotClient for NullSnapshot {
        async fn candle_snapshot(
            &self,
            _market: Market,
            _interval: Interval,
            _start_ms: i64,
            _end_ms: i64,
        ) -> Result<Vec<SnapshotCandle>> {
            Ok(Vec::new())
        }
    }

    struct MockConnector {
        market: Market,
        last_update: AtomicI64,
        channel_log: PlMutex<Vec<ChannelSub>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn exchange(&self) -> Exchange {
            Exchange::Hyperliquid
        }

        fn market(&self) -> Market {
            self.market
        }

        fn state(&self) -> ConnState {
            ConnState::Open
        }

        fn last_update_ms(&self) -> i64 {
            self.last_update.load(Ordering::Relaxed)
        }

        async fn start(self: Arc<Self>) -> Result<()> {
            Ok(())
        }

        fn reset(&self) {}

        async fn stop(&self) {}

        fn subscribe_channel(&self, sub: ChannelSub) -> Result<(), MonitorError> {
            self.channel_log.lock().push(sub);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockVenue {
        connectors: PlMutex<Vec<Arc<MockConnector>>>,
    }

    impl MockVenue {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn connector_factory(self: Arc<Self>) -> ConnectorFactory {
            let venue = self.clone();
            Arc::new(move |exchange, market, _ctx: ConnectorContext| {
                if exchange != Exchange::Hyperliquid {
                    return Err(MonitorError::UnsupportedExchange(exchange));
                }
                let conn = Arc::new(MockConnector {
                    market,
                    last_update: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
                    channel_log: PlMutex::new(Vec::new()),
                });
                venue.connectors.lock().push(conn.clone());
                Ok(conn as Arc<dyn Connector>)
            })
        }

        fn snapshot_factory(&self) -> SnapshotFactory {
            Arc::new(|exchange, _network| {
                if exchange != Exchange::Hyperliquid {
                    return Err(MonitorError::UnsupportedExchange(exchange));
                }
                Ok(Arc::new(NullSnapshot) as Arc<dyn SnapshotClient>)
            })
        }

        fn count(&self) -> usize {
            self.connectors.lock().len()
        }

        fn connector(&self, index: usize) -> Arc<MockConnector> {
            self.connectors.lock()[index].clone()
        }
    }

    fn manager_with(venue: &Arc<MockVenue>, settings: Settings) -> Arc<Manager> {
        Manager::with_factories(settings, venue.clone().connector_factory(), venue.snapshot_factory())
    }

    fn fast_settings() -> Settings {
        Settings {
            restart_threshold: Duration::from_millis(80),
            soft_reset_threshold: Duration::from_secs(20),
            hard_reset_threshold: Duration::from_secs(30),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn subscribe_market_is_idempotent() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, Settings::default());

        let a = manager
            .subscribe_market(
                Exchange::Hyperliquid,
                Market::BtcusdPerp,
                DataType::Trades,
                None,
            )
            .await
            .unwrap();
        let b = manager
            .subscribe_market(
                Exchange::Hyperliquid,
                Market::BtcusdPerp,
                DataType::Trades,
                None,
            )
            .await
            .unwrap();

        assert_eq!(a, "hyperliquid_btcusd_perp");
        assert_eq!(a, b);
        assert_eq!(manager.worker_count().await, 1);
        assert_eq!(venue.count(), 1);
        assert_eq!(manager.subscriptions().await.len(), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn subscribe_unsupported_exchange_fails() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, Settings::default());

        let err = manager
            .subscribe_market(Exchange::Binance, Market::Btcusd, DataType::Trades, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("binance"));
        assert_eq!(manager.worker_count().await, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn subscribe_indicator_ensures_market_stream() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, Settings::default());

        let key = manager
            .subscribe_indicator(
                Exchange::Hyperliquid,
                Market::BtcusdPerp,
                IndicatorKind::Rsi,
                14,
                Interval::OneMinute,
            )
            .await
            .unwrap();
        assert_eq!(key, "hyperliquid_btcusd_perp_1m_14");

        // The candle stream subscription was created implicitly.
        let subs = manager.subscriptions().await;
        assert!(subs.iter().any(|s| matches!(
            s,
            Subscription::Market {
                data_type: DataType::Candle,
                timeframe: Some(Interval::OneMinute),
                ..
            }
        )));
        assert_eq!(manager.worker_count().await, 1);

        // Same tuple again: no new recording.
        let again = manager
            .subscribe_indicator(
                Exchange::Hyperliquid,
                Market::BtcusdPerp,
                IndicatorKind::Rsi,
                14,
                Interval::OneMinute,
            )
            .await
            .unwrap();
        assert_eq!(key, again);
        assert_eq!(manager.subscriptions().await.len(), subs.len());

        manager.stop().await;
    }

    #[tokio::test]
    async fn restart_replays_subscriptions_in_order() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, Settings::default());
        let (ex, mkt) = (Exchange::Hyperliquid, Market::BtcusdPerp);

        manager
            .subscribe_market(ex, mkt, DataType::Trades, None)
            .await
            .unwrap();
        manager
            .subscribe_market(ex, mkt, DataType::Candle, Some(Interval::OneMinute))
            .await
            .unwrap();
        manager
            .subscribe_market(ex, mkt, DataType::Orderbook, None)
            .await
            .unwrap();
        assert_eq!(venue.count(), 1);

        manager.restart_worker((ex, mkt)).await;
        assert_eq!(venue.count(), 2);
        assert_eq!(manager.worker_count().await, 1);

        // The replacement connector saw every subscription, original order.
        let log = venue.connector(1).channel_log.lock().clone();
        assert_eq!(
            log,
            vec![
                ChannelSub::Trades,
                ChannelSub::Candle(Interval::OneMinute),
                ChannelSub::Orderbook,
            ]
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn restart_replays_indicator_subscriptions() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, Settings::default());
        let (ex, mkt) = (Exchange::Hyperliquid, Market::BtcusdPerp);

        manager
            .subscribe_indicator(ex, mkt, IndicatorKind::Rsi, 14, Interval::OneMinute)
            .await
            .unwrap();
        let engine = manager
            .indicator_engine(ex, mkt, IndicatorKind::Rsi)
            .await
            .unwrap();
        let before = engine.subscribe_request_count();

        manager.restart_worker((ex, mkt)).await;

        // The replacement worker re-subscribed the candle stream and the
        // surviving engine received its subscription tuple again.
        let log = venue.connector(1).channel_log.lock().clone();
        assert_eq!(log, vec![ChannelSub::Candle(Interval::OneMinute)]);
        assert_eq!(engine.subscribe_request_count(), before + 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn second_failed_restart_marks_market_dead() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, fast_settings());
        let (ex, mkt) = (Exchange::Hyperliquid, Market::BtcusdPerp);

        manager
            .subscribe_market(ex, mkt, DataType::Trades, None)
            .await
            .unwrap();

        // First restart succeeds; a second within the window means the
        // restart did not help: the market is declared dead.
        manager.restart_worker((ex, mkt)).await;
        assert!(!manager.is_dead(ex, mkt).await);
        manager.restart_worker((ex, mkt)).await;
        assert!(manager.is_dead(ex, mkt).await);
        assert_eq!(manager.worker_count().await, 0);

        // Further subscribes are refused until operator intervention.
        let err = manager
            .subscribe_market(ex, mkt, DataType::Trades, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dead"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let venue = MockVenue::new();
        let manager = manager_with(&venue, Settings::default());
        manager
            .subscribe_market(
                Exchange::Hyperliquid,
                Market::BtcusdPerp,
                DataType::Trades,
                None,
            )
            .await
            .unwrap();
        manager.clone().start_watcher().await;
        manager.stop().await;
        manager.stop().await;
    }
}

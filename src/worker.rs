// =============================================================================
// Exchange worker supervisor — one per (exchange, market)
// =============================================================================
//
// Owns the connector and the trade interpreter and runs the inner watchdog:
//
//   interpreter invariant flag => hard reset; violations that persist past
//                                two hard resets fail the supervisor;
//   silence > hard threshold  => tear the connector down and rebuild it on
//                                the same trade queue (hard reset); after two
//                                consecutive hard resets that fail to restore
//                                liveness the supervisor fails and leaves the
//                                rest to the manager's outer watcher;
//   silence > soft threshold  => close the socket and let the back-off loop
//                                reconnect (soft reset);
//   otherwise                 => mark the series healthy again if a reset had
//                                flagged them.
//
// The candle series set is owned by the manager and survives supervisor
// restarts, so a rebuilt worker continues the same rings.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::errors::MonitorError;
use crate::exchange::{ChannelSub, Connector, ConnectorContext, ConnectorFactory, SnapshotClient};
use crate::market_data::{SeriesSet, TradeInterpreter, TradeQueue, TRADE_QUEUE_CAPACITY};
use crate::publish::Bus;
use crate::settings::Network;
use crate::types::{market_channel, DataType, Exchange, Interval, Market};

/// Inner watchdog cadence ceiling.
const WATCHDOG_MAX_CADENCE: Duration = Duration::from_secs(10);
/// Consecutive ineffective hard resets before the supervisor fails.
const MAX_HARD_RESETS: u32 = 2;

/// A raw-market subscription this worker carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSubscription {
    pub data_type: DataType,
    pub timeframe: Option<Interval>,
}

pub struct ExchangeWorker {
    exchange: Exchange,
    market: Market,
    channel: String,
    network: Network,
    queue: Arc<TradeQueue>,
    series: Arc<SeriesSet>,
    bus: Arc<Bus>,
    connector: RwLock<Arc<dyn Connector>>,
    connector_factory: ConnectorFactory,
    interpreter: Arc<TradeInterpreter>,
    soft_threshold: Duration,
    hard_threshold: Duration,
    subscriptions: Mutex<Vec<WorkerSubscription>>,
    /// Set when hard-reset escalation gives up; the outer watcher replaces
    /// the whole worker.
    failed: AtomicBool,
    healthy: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ExchangeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        market: Market,
        series: Arc<SeriesSet>,
        snapshot: Arc<dyn SnapshotClient>,
        bus: Arc<Bus>,
        network: Network,
        connector_factory: ConnectorFactory,
        soft_threshold: Duration,
        hard_threshold: Duration,
    ) -> Result<Arc<Self>, MonitorError> {
        let queue = Arc::new(TradeQueue::new(TRADE_QUEUE_CAPACITY));
        let connector = (connector_factory)(
            exchange,
            market,
            ConnectorContext {
                queue: queue.clone(),
                series: series.clone(),
                bus: bus.clone(),
                network,
            },
        )?;
        let interpreter = Arc::new(TradeInterpreter::new(
            exchange,
            market,
            queue.clone(),
            series.clone(),
            snapshot,
            bus.clone(),
        ));
        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            exchange,
            market,
            channel: market_channel(exchange, market),
            network,
            queue,
            series,
            bus,
            connector: RwLock::new(connector),
            connector_factory,
            interpreter,
            soft_threshold,
            hard_threshold,
            subscriptions: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            // Health transitions are edge-triggered; starting "healthy" keeps
            // the watchdog from force-marking empty series before first data.
            healthy: AtomicBool::new(true),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn series(&self) -> Arc<SeriesSet> {
        self.series.clone()
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn last_update_ms(&self) -> i64 {
        self.connector.read().last_update_ms()
    }

    /// Subscriptions recorded on this worker, in arrival order.
    pub fn subscriptions(&self) -> Vec<WorkerSubscription> {
        self.subscriptions.lock().clone()
    }

    /// Start connector, interpreter, and watchdog.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let connector = self.connector.read().clone();
        connector
            .start()
            .await
            .with_context(|| format!("failed to start connector for {}", self.channel))?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.interpreter.clone().run(self.stop_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.clone().run_watchdog(self.stop_tx.subscribe()),
        ));

        info!(channel = %self.channel, "exchange worker started");
        Ok(())
    }

    /// Record and apply a raw-market subscription. Duplicate tuples are
    /// idempotent.
    pub fn subscribe(
        &self,
        data_type: DataType,
        timeframe: Option<Interval>,
    ) -> Result<String, MonitorError> {
        let sub = WorkerSubscription {
            data_type,
            timeframe,
        };
        {
            let subs = self.subscriptions.lock();
            if subs.contains(&sub) {
                return Ok(self.channel.clone());
            }
        }

        let connector = self.connector.read().clone();
        match data_type {
            DataType::Trades => {
                connector.subscribe_channel(ChannelSub::Trades)?;
            }
            DataType::Orderbook => {
                connector.subscribe_channel(ChannelSub::Orderbook)?;
            }
            DataType::Candle => {
                let timeframe = timeframe.unwrap_or(Interval::OneMinute);
                self.series.ensure(timeframe);
                connector.subscribe_channel(ChannelSub::Candle(timeframe))?;
            }
        }

        self.subscriptions.lock().push(sub);
        info!(
            channel = %self.channel,
            data_type = %data_type,
            timeframe = ?timeframe.map(|t| t.as_str()),
            "worker subscription added"
        );
        Ok(self.channel.clone())
    }

    /// Stop all loops and release the socket. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let connector = self.connector.read().clone();
        connector.stop().await;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(channel = %self.channel, "exchange worker stopped");
    }

    // ── Inner watchdog ──────────────────────────────────────────────────

    async fn run_watchdog(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let cadence = (self.soft_threshold / 2)
            .min(WATCHDOG_MAX_CADENCE)
            .max(Duration::from_millis(10));
        let soft_ms = self.soft_threshold.as_millis() as i64;
        let hard_ms = self.hard_threshold.as_millis() as i64;
        let mut consecutive_hard_resets: u32 = 0;
        let mut invariant_resets: u32 = 0;

        info!(channel = %self.channel, "watchdog running");
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(cadence) => {}
            }

            // Interpreter-side invariant violation: the interpreter already
            // pulled health down; the mandated answer is a hard reset, and a
            // violation that outlives the reset budget fails the supervisor.
            if self.interpreter.take_invariant_violation() {
                if invariant_resets >= MAX_HARD_RESETS {
                    error!(
                        channel = %self.channel,
                        "invariant violations persist after hard resets; failing supervisor"
                    );
                    self.failed.store(true, Ordering::Release);
                    break;
                }
                error!(channel = %self.channel, "candle invariant violated; HARD reset");
                self.healthy.store(false, Ordering::Release);
                invariant_resets += 1;
                if let Err(e) = self.hard_reset().await {
                    error!(channel = %self.channel, error = %e, "hard reset failed");
                }
                continue;
            }

            let last = self.last_update_ms();
            if last == 0 {
                // Connector has not produced a frame yet; the outer watcher
                // covers total startup failure.
                continue;
            }
            let silent_ms = chrono::Utc::now().timestamp_millis() - last;

            if silent_ms > hard_ms {
                if consecutive_hard_resets >= MAX_HARD_RESETS {
                    error!(
                        channel = %self.channel,
                        silent_ms,
                        "hard resets exhausted; failing supervisor"
                    );
                    self.failed.store(true, Ordering::Release);
                    break;
                }
                error!(channel = %self.channel, silent_ms, "HARD reset");
                self.healthy.store(false, Ordering::Release);
                self.interpreter.raise_unhealthy();
                consecutive_hard_resets += 1;
                if let Err(e) = self.hard_reset().await {
                    error!(channel = %self.channel, error = %e, "hard reset failed");
                }
            } else if silent_ms > soft_ms {
                warn!(channel = %self.channel, silent_ms, "soft reset");
                self.healthy.store(false, Ordering::Release);
                self.interpreter.raise_unhealthy();
                self.connector.read().reset();
            } else {
                consecutive_hard_resets = 0;
                if !self.healthy.swap(true, Ordering::AcqRel) {
                    info!(channel = %self.channel, "connection recovered");
                    self.interpreter.back_to_healthy();
                }
            }
        }
        info!(channel = %self.channel, "watchdog stopped");
    }

    /// Destroy the connector and construct a fresh one bound to the same
    /// trade queue.
    async fn hard_reset(&self) -> Result<()> {
        let old = self.connector.read().clone();
        old.stop().await;

        let fresh = (self.connector_factory)(
            self.exchange,
            self.market,
            ConnectorContext {
                queue: self.queue.clone(),
                series: self.series.clone(),
                bus: self.bus.clone(),
                network: self.network,
            },
        )?;
        fresh
            .clone()
            .start()
            .await
            .with_context(|| format!("failed to restart connector for {}", self.channel))?;
        *self.connector.write() = fresh;
        Ok(())
    }
}

// =============================================================================
// Hyperliquid WebSocket connector
// =============================================================================
//
// Owns one WebSocket session per market. The read loop survives network
// faults with exponential back-off (2 s doubling, capped at 20 s, reset to
// 2 s on the first message of a fresh session) and replays every recorded
// channel subscription after each reconnect.
//
// Wire shapes:
//   subscribe: {"method":"subscribe","subscription":{"type":"trades","coin":SYM}}
//   inbound:   {"channel":"subscriptionResponse", ...}            (ignored)
//              {"channel":"trades","data":[{px, sz, side, time, users}, ...]}
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::errors::MonitorError;
use crate::market_data::{SeriesSet, TradeQueue};
use crate::publish::Bus;
use crate::settings::Network;
use crate::types::{market_channel, Exchange, Market, Side, Trade};

use super::{hyperliquid_symbol, ChannelSub, ConnState, Connector, ConnectorContext};

const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const TESTNET_WS_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";

const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(2);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(20);
const PING_INTERVAL: Duration = Duration::from_secs(20);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct HyperliquidConnector {
    market: Market,
    ws_url: String,
    channel: String,
    queue: Arc<TradeQueue>,
    series: Arc<SeriesSet>,
    bus: Arc<Bus>,
    state: RwLock<ConnState>,
    last_update_ms: AtomicI64,
    /// Channels to (re)subscribe on every session, trades included.
    channels: Mutex<Vec<ChannelSub>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reset_notify: Notify,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HyperliquidConnector {
    pub fn new(market: Market, ctx: ConnectorContext) -> Self {
        let ws_url = match ctx.network {
            Network::Main => MAINNET_WS_URL,
            Network::Test => TESTNET_WS_URL,
        };
        let (stop_tx, _) = watch::channel(false);
        Self {
            market,
            ws_url: ws_url.to_string(),
            channel: market_channel(Exchange::Hyperliquid, market),
            queue: ctx.queue,
            series: ctx.series,
            bus: ctx.bus,
            state: RwLock::new(ConnState::Closed),
            last_update_ms: AtomicI64::new(0),
            channels: Mutex::new(vec![ChannelSub::Trades]),
            outbound: Mutex::new(None),
            reset_notify: Notify::new(),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnState) {
        *self.state.write() = state;
    }

    fn touch(&self) {
        self.last_update_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Send a JSON message on the live session.
    fn send_json(&self, value: serde_json::Value) -> Result<(), MonitorError> {
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) if *self.state.read() == ConnState::Open => {
                tx.send(Message::Text(value.to_string()))
                    .map_err(|_| MonitorError::NotConnected(self.channel.clone()))
            }
            _ => Err(MonitorError::NotConnected(self.channel.clone())),
        }
    }

    fn subscribe_message(&self, sub: ChannelSub) -> serde_json::Value {
        let coin = hyperliquid_symbol(self.market);
        match sub {
            ChannelSub::Trades => serde_json::json!({
                "method": "subscribe",
                "subscription": { "type": "trades", "coin": coin },
            }),
            ChannelSub::Orderbook => serde_json::json!({
                "method": "subscribe",
                "subscription": { "type": "l2Book", "coin": coin },
            }),
            ChannelSub::Candle(interval) => serde_json::json!({
                "method": "subscribe",
                "subscription": {
                    "type": "candle",
                    "coin": coin,
                    "interval": interval.as_str(),
                },
            }),
        }
    }

    async fn run_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut delay = RECONNECT_DELAY_MIN;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.set_state(ConnState::Connecting);

            let connected = tokio::select! {
                _ = stop_rx.changed() => break,
                result = connect_async(&self.ws_url) => result,
            };

            match connected {
                Ok((ws, _response)) => {
                    info!(channel = %self.channel, "websocket connected");
                    let stopped = self.run_session(ws, &mut stop_rx, &mut delay).await;
                    self.outbound.lock().take();
                    if stopped {
                        break;
                    }
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "websocket connect failed");
                }
            }

            if *stop_rx.borrow() {
                break;
            }

            // Connection lost: mark unhealthy and back off before retrying.
            self.set_state(ConnState::Reconnecting);
            self.series.set_healthy(false);
            warn!(
                channel = %self.channel,
                delay_secs = delay.as_secs(),
                "websocket reconnecting"
            );
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(RECONNECT_DELAY_MAX);
        }

        self.outbound.lock().take();
        self.set_state(ConnState::Stopped);
        info!(channel = %self.channel, "websocket loop stopped");
    }

    /// Drive one WebSocket session until it ends. Returns true when the
    /// connector is stopping for good.
    async fn run_session(
        &self,
        ws: WsStream,
        stop_rx: &mut watch::Receiver<bool>,
        delay: &mut Duration,
    ) -> bool {
        self.set_state(ConnState::Subscribing);
        let (mut write, mut read) = ws.split();

        let subs: Vec<ChannelSub> = self.channels.lock().clone();
        for sub in subs {
            let msg = self.subscribe_message(sub).to_string();
            if write.send(Message::Text(msg)).await.is_err() {
                warn!(channel = %self.channel, "subscribe send failed");
                return false;
            }
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(out_tx);
        self.set_state(ConnState::Open);

        let mut first_message_seen = false;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await; // first tick fires immediately; swallow it

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }
                _ = self.reset_notify.notified() => {
                    info!(channel = %self.channel, "reset requested; closing socket");
                    let _ = write.send(Message::Close(None)).await;
                    return false;
                }
                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return false;
                    }
                }
                Some(msg) = out_rx.recv() => {
                    if write.send(msg).await.is_err() {
                        return false;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(msg)) => {
                        // Every inbound frame counts for liveness, pings included.
                        self.touch();
                        if !first_message_seen {
                            first_message_seen = true;
                            *delay = RECONNECT_DELAY_MIN;
                        }
                        if let Message::Text(text) = msg {
                            if let Err(e) = self.handle_message(&text) {
                                warn!(channel = %self.channel, error = %e, "malformed message skipped");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(channel = %self.channel, error = %e, "websocket read error");
                        return false;
                    }
                    None => {
                        warn!(channel = %self.channel, "websocket stream ended");
                        return false;
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) -> Result<()> {
        let root: serde_json::Value =
            serde_json::from_str(text).context("failed to parse message JSON")?;

        let channel = root["channel"].as_str().unwrap_or_default();
        match channel {
            // One-shot ack, nothing to do.
            "subscriptionResponse" => Ok(()),
            "trades" => {
                let trades = parse_trades(&root["data"])?;
                for trade in trades {
                    self.queue.push(trade);
                }
                Ok(())
            }
            // Raw passthrough for the other subscribed channels.
            "l2Book" | "candle" => {
                self.bus.publish(
                    &self.channel,
                    serde_json::json!({ "type": channel, "data": root["data"] }),
                );
                Ok(())
            }
            other => {
                anyhow::bail!("unknown channel {other:?}")
            }
        }
    }
}

#[async_trait]
impl Connector for HyperliquidConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    fn market(&self) -> Market {
        self.market
    }

    fn state(&self) -> ConnState {
        *self.state.read()
    }

    fn last_update_ms(&self) -> i64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let stop_rx = self.stop_tx.subscribe();
        let this = self.clone();
        *task = Some(tokio::spawn(this.run_loop(stop_rx)));
        Ok(())
    }

    fn reset(&self) {
        self.reset_notify.notify_one();
    }

    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        // Wake the session loop in case it is parked on the reset notify.
        self.reset_notify.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn subscribe_channel(&self, sub: ChannelSub) -> Result<(), MonitorError> {
        {
            let mut channels = self.channels.lock();
            if channels.contains(&sub) {
                return Ok(());
            }
            channels.push(sub);
        }
        // Recorded for replay either way; push it onto the live session when
        // one exists.
        match self.send_json(self.subscribe_message(sub)) {
            Ok(()) => Ok(()),
            Err(MonitorError::NotConnected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Decode the `data` array of a `trades` message.
fn parse_trades(data: &serde_json::Value) -> Result<Vec<Trade>> {
    let items = data.as_array().context("trades data is not an array")?;
    let mut out = Vec::with_capacity(items.len());

    for item in items {
        let price = parse_number(&item["px"], "px")?;
        let size = parse_number(&item["sz"], "sz")?;
        let timestamp_ms = item["time"].as_i64().context("missing field time")?;

        let side = match item["side"].as_str().context("missing field side")? {
            "B" | "b" | "buy" => Side::Buy,
            "A" | "a" | "sell" => Side::Sell,
            other => anyhow::bail!("unknown trade side {other:?}"),
        };

        let traders = item["users"]
            .as_array()
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        out.push(Trade {
            price,
            size,
            side,
            timestamp_ms,
            traders,
        });
    }

    Ok(out)
}

/// Hyperliquid sends numeric values as JSON strings.
fn parse_number(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

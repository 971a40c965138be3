// =============================================================================
// Exchange connectors
// =============================================================================
//
// One connector per (exchange, market). A connector owns the WebSocket
// session and produces decoded trades into the bounded `TradeQueue`; the
// supervisor owns the connector and may replace it wholesale (hard reset)
// while keeping the queue.

pub mod hyperliquid;
pub mod info;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::errors::MonitorError;
use crate::market_data::{SeriesSet, TradeQueue};
use crate::publish::Bus;
use crate::settings::Network;
use crate::types::{Exchange, Interval, Market};

pub use hyperliquid::HyperliquidConnector;
pub use info::{
    default_snapshot_factory, get_info, HyperliquidInfo, SnapshotCandle, SnapshotClient,
    SnapshotFactory,
};

/// Connector connection lifecycle.
///
/// `Closed → Connecting → Subscribing → Open → (Reconnecting) → Closed`,
/// with `Stopped` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Subscribing,
    Open,
    Reconnecting,
    Stopped,
}

/// A WebSocket channel the connector can carry besides the implicit trade
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSub {
    Trades,
    Orderbook,
    Candle(Interval),
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn exchange(&self) -> Exchange;
    fn market(&self) -> Market;
    fn state(&self) -> ConnState;

    /// Wall-clock milliseconds of the last inbound frame (any kind).
    fn last_update_ms(&self) -> i64;

    /// Spawn the read loop. Returns once the loop task is running.
    async fn start(self: Arc<Self>) -> Result<()>;

    /// Force a reconnect cycle without stopping: the socket is closed and the
    /// back-off loop takes over.
    fn reset(&self);

    /// Stop permanently; returns when the read loop has exited.
    async fn stop(&self);

    /// Subscribe an additional channel. Recorded and replayed after every
    /// reconnect; fails with `NotConnected` when the session is not open.
    fn subscribe_channel(&self, sub: ChannelSub) -> Result<(), MonitorError>;
}

/// Translate a canonical market to the Hyperliquid venue symbol.
pub fn hyperliquid_symbol(market: Market) -> &'static str {
    match market {
        Market::Btcusd => "BTC/USDC",
        Market::BtcusdPerp => "BTC",
        Market::Ethusd => "ETH/USDC",
        Market::EthusdPerp => "ETH",
    }
}

/// Everything a connector needs besides its identity.
#[derive(Clone)]
pub struct ConnectorContext {
    pub queue: Arc<TradeQueue>,
    pub series: Arc<SeriesSet>,
    pub bus: Arc<Bus>,
    pub network: Network,
}

/// Signature of the connector factory the manager injects into supervisors.
/// Tests swap in a mock; production uses [`create_connector`].
pub type ConnectorFactory = Arc<
    dyn Fn(Exchange, Market, ConnectorContext) -> Result<Arc<dyn Connector>, MonitorError>
        + Send
        + Sync,
>;

/// Choose the concrete connector for `exchange`.
///
/// Binance is enumerated but its worker is not implemented yet, matching the
/// venue coverage of the snapshot client.
pub fn create_connector(
    exchange: Exchange,
    market: Market,
    ctx: ConnectorContext,
) -> Result<Arc<dyn Connector>, MonitorError> {
    match exchange {
        Exchange::Hyperliquid => Ok(Arc::new(HyperliquidConnector::new(market, ctx))),
        Exchange::Binance => Err(MonitorError::UnsupportedExchange(exchange)),
    }
}

/// Default production factory.
pub fn default_connector_factory() -> ConnectorFactory {
    Arc::new(create_connector)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{SERIES_CAPACITY, TRADE_QUEUE_CAPACITY};

    fn ctx() -> ConnectorContext {
        ConnectorContext {
            queue: Arc::new(TradeQueue::new(TRADE_QUEUE_CAPACITY)),
            series: Arc::new(SeriesSet::new(
                Market::BtcusdPerp,
                &[Interval::OneMinute],
                SERIES_CAPACITY,
            )),
            bus: Arc::new(Bus::new()),
            network: Network::Main,
        }
    }

    #[test]
    fn venue_symbols() {
        assert_eq!(hyperliquid_symbol(Market::Btcusd), "BTC/USDC");
        assert_eq!(hyperliquid_symbol(Market::BtcusdPerp), "BTC");
        assert_eq!(hyperliquid_symbol(Market::EthusdPerp), "ETH");
    }

    #[test]
    fn factory_rejects_binance() {
        let result = create_connector(Exchange::Binance, Market::Btcusd, ctx());
        match result {
            Err(err) => assert!(matches!(err, MonitorError::UnsupportedExchange(_))),
            Ok(_) => panic!("expected UnsupportedExchange error"),
        }
    }

    #[test]
    fn factory_builds_hyperliquid() {
        let conn = create_connector(Exchange::Hyperliquid, Market::BtcusdPerp, ctx()).unwrap();
        assert_eq!(conn.exchange(), Exchange::Hyperliquid);
        assert_eq!(conn.state(), ConnState::Closed);
    }
}

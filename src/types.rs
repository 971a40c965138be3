// =============================================================================
// Shared types used across the market monitoring engine
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Venue a market data stream originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Hyperliquid,
    Binance,
}

impl Exchange {
    /// Canonical lowercase wire name, used in channel keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hyperliquid => "hyperliquid",
            Self::Binance => "binance",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hyperliquid" => Ok(Self::Hyperliquid),
            "binance" => Ok(Self::Binance),
            other => Err(ConfigError::UnknownEnumValue {
                field: "exchange",
                value: other.to_string(),
            }),
        }
    }
}

/// Canonical market identifier. Exchange-specific symbols are translated at
/// the connector boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Btcusd,
    BtcusdPerp,
    Ethusd,
    EthusdPerp,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Btcusd => "btcusd",
            Self::BtcusdPerp => "btcusd_perp",
            Self::Ethusd => "ethusd",
            Self::EthusdPerp => "ethusd_perp",
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Market {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "btcusd" => Ok(Self::Btcusd),
            "btcusd_perp" => Ok(Self::BtcusdPerp),
            "ethusd" => Ok(Self::Ethusd),
            "ethusd_perp" => Ok(Self::EthusdPerp),
            other => Err(ConfigError::UnknownEnumValue {
                field: "market",
                value: other.to_string(),
            }),
        }
    }
}

/// Candle timeframe. Closed set, totally ordered by duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

const MINUTE_MS: i64 = 60 * 1000;

impl Interval {
    /// Fixed span of this interval in milliseconds.
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::OneMinute => MINUTE_MS,
            Self::FiveMinutes => 5 * MINUTE_MS,
            Self::ThirtyMinutes => 30 * MINUTE_MS,
            Self::OneHour => 60 * MINUTE_MS,
            Self::OneDay => 24 * 60 * MINUTE_MS,
            Self::OneWeek => 7 * 24 * 60 * MINUTE_MS,
        }
    }

    /// Wire name as used in subscription bodies and channel keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }

    /// Round `ts_ms` down to the open time of the candle containing it.
    pub fn align(&self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.as_millis())
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Interval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" => Ok(Self::OneHour),
            "1d" => Ok(Self::OneDay),
            "1w" => Ok(Self::OneWeek),
            other => Err(ConfigError::UnknownEnumValue {
                field: "interval",
                value: other.to_string(),
            }),
        }
    }
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single executed trade as decoded from an exchange stream.
///
/// Immutable once received; timestamps are exchange-reported milliseconds
/// since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub timestamp_ms: i64,
    /// Addresses of the two counterparties, when the venue reports them.
    #[serde(default)]
    pub traders: Vec<String>,
}

/// Raw-market data stream kinds a worker can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Trades,
    Orderbook,
    Candle,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Orderbook => "orderbook",
            Self::Candle => "candle",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicator family an engine computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Rsi,
    Macd,
    Sma,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsi => "rsi",
            Self::Macd => "macd",
            Self::Sma => "sma",
        }
    }
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic channel key for a raw market stream.
pub fn market_channel(exchange: Exchange, market: Market) -> String {
    format!("{}_{}", exchange, market)
}

/// Deterministic key for an indicator sample stream.
pub fn indicator_channel(
    exchange: Exchange,
    market: Market,
    timeframe: Interval,
    period: usize,
) -> String {
    format!("{}_{}_{}_{}", exchange, market, timeframe, period)
}

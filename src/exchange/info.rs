// =============================================================================
// Historical snapshot client — Hyperliquid candleSnapshot REST endpoint
// =============================================================================
//
// POST {base}/info with
//   {"type":"candleSnapshot","req":{"coin":SYM,"interval":"1m",
//    "startTime":ms,"endTime":ms}}
// returns an array of candles with string-encoded numeric fields.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::errors::MonitorError;
use crate::settings::Network;
use crate::types::{Exchange, Interval, Market};

use super::hyperliquid_symbol;

const MAINNET_API_URL: &str = "https://api.hyperliquid.xyz";
const TESTNET_API_URL: &str = "https://api.hyperliquid-testnet.xyz";

/// One historical candle as reported by the venue. Only exchange-reported
/// OHLCV travels here; buyer/seller split and trader counts are live-only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SnapshotCandle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Historical candle source. The trade interpreter and the indicator engines
/// bootstrap through this seam; tests substitute a scripted implementation.
#[async_trait]
pub trait SnapshotClient: Send + Sync {
    /// The N most recent candles for (market, interval) within
    /// `[start_ms, end_ms]`, oldest first. `t` is aligned to the interval.
    async fn candle_snapshot(
        &self,
        market: Market,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SnapshotCandle>>;
}

/// Signature of the snapshot-client factory; tests inject mocks.
pub type SnapshotFactory =
    Arc<dyn Fn(Exchange, Network) -> Result<Arc<dyn SnapshotClient>, MonitorError> + Send + Sync>;

/// Choose the snapshot client for `exchange`.
pub fn get_info(
    exchange: Exchange,
    network: Network,
) -> Result<Arc<dyn SnapshotClient>, MonitorError> {
    match exchange {
        Exchange::Hyperliquid => Ok(Arc::new(HyperliquidInfo::new(network))),
        Exchange::Binance => Err(MonitorError::UnsupportedExchange(exchange)),
    }
}

/// Default production factory.
pub fn default_snapshot_factory() -> SnapshotFactory {
    Arc::new(get_info)
}

// =============================================================================
// HyperliquidInfo
// =============================================================================

pub struct HyperliquidInfo {
    base_url: String,
    client: reqwest::Client,
    /// Most recent response, keyed by request identity. Indicator engines
    /// bootstrapping the same timeframe in the same candle window hit this
    /// instead of the venue.
    last: Mutex<Option<CachedSnapshot>>,
}

struct CachedSnapshot {
    market: Market,
    interval: Interval,
    end_ms: i64,
    candles: Vec<SnapshotCandle>,
}

impl HyperliquidInfo {
    pub fn new(network: Network) -> Self {
        let base_url = match network {
            Network::Main => MAINNET_API_URL,
            Network::Test => TESTNET_API_URL,
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.to_string(),
            client,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SnapshotClient for HyperliquidInfo {
    async fn candle_snapshot(
        &self,
        market: Market,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SnapshotCandle>> {
        {
            let cache = self.last.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.market == market && cached.interval == interval && cached.end_ms == end_ms
                {
                    return Ok(cached.candles.clone());
                }
            }
        }

        let body = serde_json::json!({
            "type": "candleSnapshot",
            "req": {
                "coin": hyperliquid_symbol(market),
                "interval": interval.as_str(),
                "startTime": start_ms,
                "endTime": end_ms,
            }
        });

        let url = format!("{}/info", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST /info candleSnapshot request failed")?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse candleSnapshot response")?;

        if !status.is_success() {
            anyhow::bail!("candleSnapshot returned {status}: {payload}");
        }

        let candles = parse_snapshot(&payload)?;
        debug!(
            market = %market,
            interval = %interval,
            count = candles.len(),
            "candle snapshot fetched"
        );

        *self.last.lock() = Some(CachedSnapshot {
            market,
            interval,
            end_ms,
            candles: candles.clone(),
        });

        Ok(candles)
    }
}

/// Decode the candleSnapshot response array.
fn parse_snapshot(payload: &serde_json::Value) -> Result<Vec<SnapshotCandle>> {
    let items = payload
        .as_array()
        .context("candleSnapshot response is not an array")?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(SnapshotCandle {
            t: item["t"].as_i64().context("missing field t")?,
            o: parse_number(&item["o"], "o")?,
            h: parse_number(&item["h"], "h")?,
            l: parse_number(&item["l"], "l")?,
            c: parse_number(&item["c"], "c")?,
            v: parse_number(&item["v"], "v")?,
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

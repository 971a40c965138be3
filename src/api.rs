// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// Three POST endpoints, JSON bodies:
//   /subscribe/market    — subscribe a raw market stream, returns the channel
//   /subscribe/indicator — subscribe an indicator family, returns the key
//   /candle              — synchronous historical snapshot
//
// Contract errors surface as 500 with the diagnostic string in the body;
// transport-level recovery never reaches this layer.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::exchange::SnapshotCandle;
use crate::manager::Manager;
use crate::market_data::SERIES_CAPACITY;
use crate::types::{DataType, Exchange, IndicatorKind, Interval, Market};

/// Build the REST router with CORS middleware and the shared manager handle.
pub fn router(manager: Arc<Manager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/subscribe/market", post(subscribe_market))
        .route("/subscribe/indicator", post(subscribe_indicator))
        .route("/candle", post(candle))
        .layer(cors)
        .with_state(manager)
}

// =============================================================================
// Request / response schemas
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct MarketSubscriptionRequest {
    pub exchange: Exchange,
    pub market: Market,
    pub data_type: DataType,
    /// Required when `data_type` is `candle`; rejected otherwise.
    #[serde(default)]
    pub timeframe: Option<Interval>,
}

/// Discriminated by `indicator`.
#[derive(Debug, Deserialize)]
#[serde(tag = "indicator", rename_all = "lowercase")]
pub enum IndicatorSubscriptionRequest {
    Rsi {
        exchange: Exchange,
        market: Market,
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default = "default_timeframe")]
        timeframe: Interval,
    },
    Macd {
        exchange: Exchange,
        market: Market,
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default = "default_timeframe")]
        timeframe: Interval,
    },
    Sma {
        exchange: Exchange,
        market: Market,
        #[serde(default = "default_period")]
        period: usize,
        #[serde(default = "default_timeframe")]
        timeframe: Interval,
    },
}

fn default_period() -> usize {
    14
}

fn default_timeframe() -> Interval {
    Interval::OneMinute
}

#[derive(Debug, Deserialize)]
pub struct CandleRequest {
    pub exchange: Exchange,
    pub market: Market,
    #[serde(default = "default_timeframe")]
    pub timeframe: Interval,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub channel: String,
}

#[derive(Debug, Serialize)]
pub struct CandleResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub response: Vec<SnapshotCandle>,
}

// =============================================================================
// Handlers
// =============================================================================

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "API error");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}"))
}

async fn subscribe_market(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<MarketSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    match (req.data_type, req.timeframe) {
        (DataType::Candle, None) => {
            return Err(internal("timeframe is required for candle subscriptions"));
        }
        (DataType::Candle, Some(tf))
            if !matches!(tf, Interval::OneMinute | Interval::FiveMinutes) =>
        {
            return Err(internal(format!(
                "unsupported candle timeframe {tf}; expected 1m or 5m"
            )));
        }
        (dt, Some(_)) if dt != DataType::Candle => {
            return Err(internal("timeframe only applies to candle subscriptions"));
        }
        _ => {}
    }

    let channel = manager
        .subscribe_market(req.exchange, req.market, req.data_type, req.timeframe)
        .await
        .map_err(internal)?;
    Ok(Json(SubscriptionResponse { channel }))
}

async fn subscribe_indicator(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<IndicatorSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let (exchange, market, indicator, period, timeframe) = match req {
        IndicatorSubscriptionRequest::Rsi {
            exchange,
            market,
            period,
            timeframe,
        } => {
            if ![5, 10, 14].contains(&period) {
                return Err(internal(format!(
                    "unsupported rsi period {period}; expected 5, 10 or 14"
                )));
            }
            if !matches!(timeframe, Interval::OneMinute | Interval::FiveMinutes) {
                return Err(internal(format!(
                    "unsupported rsi timeframe {timeframe}; expected 1m or 5m"
                )));
            }
            (exchange, market, IndicatorKind::Rsi, period, timeframe)
        }
        IndicatorSubscriptionRequest::Macd {
            exchange,
            market,
            period,
            timeframe,
        } => (exchange, market, IndicatorKind::Macd, period, timeframe),
        IndicatorSubscriptionRequest::Sma {
            exchange,
            market,
            period,
            timeframe,
        } => (exchange, market, IndicatorKind::Sma, period, timeframe),
    };

    let channel = manager
        .subscribe_indicator(exchange, market, indicator, period, timeframe)
        .await
        .map_err(internal)?;
    Ok(Json(SubscriptionResponse { channel }))
}

async fn candle(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<CandleRequest>,
) -> Result<Json<CandleResponse>, ApiError> {
    let info = manager.snapshot_client(req.exchange).map_err(internal)?;

    let span = req.timeframe.as_millis();
    let end = req.timeframe.align(chrono::Utc::now().timestamp_millis());
    let start = end - SERIES_CAPACITY as i64 * span;

    let candles = info
        .candle_snapshot(req.market, req.timeframe, start, end)
        .await
        .map_err(internal)?;

    Ok(Json(CandleResponse {
        kind: DataType::Candle.as_str().to_string(),
        response: candles,
    }))
}

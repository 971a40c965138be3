// =============================================================================
// Error taxonomy
// =============================================================================
//
// Contract-level errors that cross component boundaries get typed variants so
// callers can branch on them; everything else travels as `anyhow::Error` with
// context attached at the failure site.
//
// Policy: transport errors are recovered locally with back-off and never
// reach the HTTP handler; protocol errors are logged and skipped; contract
// errors surface to the caller as a 5xx with the diagnostic string.
// =============================================================================

use thiserror::Error;

/// Fatal configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown {field} value: {value}")]
    UnknownEnumValue { field: &'static str, value: String },

    #[error("invalid {field} value {value}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Contract errors surfaced to subscribers.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no exchange worker implemented for {0}")]
    UnsupportedExchange(crate::types::Exchange),

    #[error("no indicator engine for {indicator} on {exchange}")]
    UnsupportedIndicator {
        exchange: crate::types::Exchange,
        indicator: crate::types::IndicatorKind,
    },

    #[error("connector for {0} is not connected")]
    NotConnected(String),

    #[error("{exchange}_{market} is marked dead after repeated restart failures; operator intervention required")]
    MarketDead {
        exchange: crate::types::Exchange,
        market: crate::types::Market,
    },
}

/// Numerical kernel failures.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum IndicatorError {
    #[error("insufficient data: need at least {needed} values, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("period must be non-zero")]
    ZeroPeriod,
}

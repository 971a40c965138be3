// =============================================================================
// Settings — environment-driven engine configuration
// =============================================================================
//
// Every tunable lives here and is read once at startup. Unknown enum values
// and unparsable numbers are configuration errors and abort the process with
// exit code 1; nothing in this module is hot-reloadable.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::{Exchange, Interval, Market};

/// Which venue network to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Main,
    Test,
}

impl std::str::FromStr for Network {
    type Err = crate::errors::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "main" => Ok(Self::Main),
            "test" => Ok(Self::Test),
            other => Err(crate::errors::ConfigError::UnknownEnumValue {
                field: "EXCHANGE_NETWORK",
                value: other.to_string(),
            }),
        }
    }
}

/// Engine configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub exchange: Exchange,
    pub markets: Vec<Market>,
    pub intervals: Vec<Interval>,
    pub indicator_periods: Vec<usize>,
    /// Inner watchdog: soft reset after this much silence.
    pub soft_reset_threshold: Duration,
    /// Inner watchdog: hard reset after this much silence.
    pub hard_reset_threshold: Duration,
    /// Outer watcher cadence and supervisor restart threshold.
    pub restart_threshold: Duration,
    pub log_level: String,
    pub network: Network,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exchange: Exchange::Hyperliquid,
            markets: vec![Market::BtcusdPerp],
            intervals: vec![Interval::OneMinute, Interval::FiveMinutes],
            indicator_periods: vec![14],
            soft_reset_threshold: Duration::from_secs(20),
            hard_reset_threshold: Duration::from_secs(30),
            restart_threshold: Duration::from_secs(10),
            log_level: "info".to_string(),
            network: Network::Main,
            bind_addr: "0.0.0.0:3001".to_string(),
        }
    }
}

impl Settings {
    /// Read configuration from the process environment, falling back to the
    /// defaults above for unset variables.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(raw) = std::env::var("EXCHANGE") {
            settings.exchange = raw.parse()?;
        }
        if let Ok(raw) = std::env::var("MARKETS") {
            settings.markets = parse_list(&raw, "MARKETS")?;
        }
        if let Ok(raw) = std::env::var("INTERVALS") {
            settings.intervals = parse_list(&raw, "INTERVALS")?;
        }
        if let Ok(raw) = std::env::var("INDICATORS_PERIODS") {
            settings.indicator_periods = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<usize>()
                        .with_context(|| format!("INDICATORS_PERIODS entry {s:?} is not an integer"))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Ok(raw) = std::env::var("RESET_TIME_THRESHOLD") {
            settings.soft_reset_threshold = parse_seconds(&raw, "RESET_TIME_THRESHOLD")?;
        }
        if let Ok(raw) = std::env::var("HARD_RESET_TIME_THRESHOLD") {
            settings.hard_reset_threshold = parse_seconds(&raw, "HARD_RESET_TIME_THRESHOLD")?;
        }
        if let Ok(raw) = std::env::var("RESTART_TIME_THRESHOLD") {
            settings.restart_threshold = parse_seconds(&raw, "RESTART_TIME_THRESHOLD")?;
        }
        if let Ok(raw) = std::env::var("LOG_LEVEL") {
            settings.log_level = raw;
        }
        if let Ok(raw) = std::env::var("EXCHANGE_NETWORK") {
            settings.network = raw.parse()?;
        }
        if let Ok(raw) = std::env::var("BIND_ADDR") {
            settings.bind_addr = raw;
        }

        if settings.markets.is_empty() {
            anyhow::bail!("MARKETS resolved to an empty list");
        }
        if settings.intervals.is_empty() {
            anyhow::bail!("INTERVALS resolved to an empty list");
        }

        Ok(settings)
    }
}

fn parse_list<T>(raw: &str, field: &'static str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<T>()
                .with_context(|| format!("bad {field} entry {s:?}"))
        })
        .collect()
}

fn parse_seconds(raw: &str, field: &'static str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{field} value {raw:?} is not a number"))?;
    if !secs.is_finite() || secs <= 0.0 {
        anyhow::bail!("{field} must be a positive number of seconds, got {raw:?}");
    }
    Ok(Duration::from_secs_f64(secs))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_sane() {
        let s = Settings::default();
        assert_eq!(s.exchange, Exchange::Hyperliquid);
        assert_eq!(s.markets, vec![Market::BtcusdPerp]);
        assert_eq!(s.soft_reset_threshold, Duration::from_secs(20));
        assert_eq!(s.hard_reset_threshold, Duration::from_secs(30));
        assert_eq!(s.restart_threshold, Duration::from_secs(10));
        assert_eq!(s.network, Network::Main);
    }

    #[test]
    fn parse_market_list() {
        let markets: Vec<Market> = parse_list("btcusd, ethusd_perp", "MARKETS").unwrap();
        assert_eq!(markets, vec![Market::Btcusd, Market::EthusdPerp]);
    }

    #[test]
    fn parse_list_rejects_unknown() {
        let err = parse_list::<Market>("btcusd,plutonium", "MARKETS").unwrap_err();
        assert!(err.to_string().contains("MARKETS"));
    }

    #[test]
    fn parse_interval_list() {
        let intervals: Vec<Interval> = parse_list("1m,5m,1h", "INTERVALS").unwrap();
        assert_eq!(
            intervals,
            vec![
                Interval::OneMinute,
                Interval::FiveMinutes,
                Interval::OneHour
            ]
        );
    }

    #[test]
    fn parse_seconds_accepts_fractions() {
        assert_eq!(
            parse_seconds("0.5", "RESET_TIME_THRESHOLD").unwrap(),
            Duration::from_millis(500)
        );
        assert!(parse_seconds("-3", "RESET_TIME_THRESHOLD").is_err());
        assert!(parse_seconds("soon", "RESET_TIME_THRESHOLD").is_err());
    }

    #[test]
    fn network_parse() {
        assert_eq!("main".parse::<Network>().unwrap(), Network::Main);
        assert_eq!("TEST".parse::<Network>().unwrap(), Network::Test);
        assert!("staging".parse::<Network>().is_err());
    }
}

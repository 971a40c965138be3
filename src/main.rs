// =============================================================================
// Market Monitor — Main Entry Point
// =============================================================================
//
// Startup order: configuration, logging, manager + outer watcher, one market
// stream per configured market, then the HTTP API. Exit codes: 0 clean,
// 1 configuration error, 2 unrecoverable startup failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod engine;
mod errors;
mod exchange;
mod indicators;
mod manager;
mod market_data;
mod publish;
mod settings;
mod types;
mod worker;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::manager::Manager;
use crate::settings::Settings;
use crate::types::DataType;

#[tokio::main]
async fn main() {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    info!(
        exchange = %settings.exchange,
        markets = ?settings.markets.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        intervals = ?settings.intervals.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
        "market monitor starting"
    );

    // ── 2. Manager + outer watcher ───────────────────────────────────────
    let manager = Manager::new(settings.clone());
    manager.clone().start_watcher().await;

    // ── 3. Market streams for every configured market ────────────────────
    let mut started = 0usize;
    for &market in &settings.markets {
        match manager
            .subscribe_market(settings.exchange, market, DataType::Trades, None)
            .await
        {
            Ok(channel) => {
                info!(channel = %channel, "market stream subscribed");
                started += 1;
            }
            Err(e) => {
                error!(market = %market, error = %e, "failed to start market stream");
            }
        }
    }
    if started == 0 {
        error!("no market stream could be started");
        manager.stop().await;
        std::process::exit(2);
    }

    // ── 4. HTTP API ──────────────────────────────────────────────────────
    let listener = match tokio::net::TcpListener::bind(&settings.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %settings.bind_addr, error = %e, "failed to bind API server");
            manager.stop().await;
            std::process::exit(2);
        }
    };
    info!(addr = %settings.bind_addr, "API server listening");

    let app = api::router(manager.clone());

    // ── 5. Run until shutdown signal ─────────────────────────────────────
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "API server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
        }
    }

    manager.stop().await;
    info!("market monitor shut down complete");
}

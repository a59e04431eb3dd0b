use anyhow::Result;

mod alerts;
mod config;
mod executor;
mod gap_guard;
mod metrics;
mod protection;
mod scheduler;
mod strategy;
mod types;

use config::EngineConfig;
use scheduler::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting autonomous trading engine");

    let config = EngineConfig::from_env()?;
    tracing::info!(
        profile = ?config.risk_profile,
        max_trade_risk_pct = config.max_trade_risk_pct,
        circuit_breaker_pct = config.circuit_breaker_pct,
        scan_interval_minutes = config.scan_interval_minutes,
        confidence_threshold = config.ai_confidence_threshold,
        "configuration loaded"
    );

    let mut engine = Engine::new(config)?;

    // Paper by default; live trading requires an explicit second switch.
    if !engine.gateway().is_paper() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "PAPER_TRADING=false but LIVE_TRADING_APPROVED is not 'yes'; refusing to start \
                 against the live endpoint"
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE - real money at risk");
    } else {
        tracing::info!("paper trading mode");
    }

    engine.run().await?;

    tracing::info!("trading engine shut down");
    Ok(())
}

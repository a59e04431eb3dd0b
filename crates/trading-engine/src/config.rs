use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use broker_gateway::GatewayConfig;
use risk_engine::{RiskConfig, RiskProfile, SizingMode};

/// Engine configuration, read once at startup. Credentials are mandatory;
/// everything else falls back to conservative defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Broker
    pub api_key_id: String,
    pub api_secret_key: String,
    pub paper_trading: bool,
    pub rate_limit_per_minute: usize,
    pub rate_limit_utilization: f64,
    pub stale_quote_max_minutes: i64,

    // Risk
    pub risk_profile: RiskProfile,
    pub max_position_pct: f64,
    pub max_trade_risk_pct: f64,
    pub max_portfolio_risk_pct: f64,
    pub circuit_breaker_pct: f64,
    pub max_concurrent_positions: usize,
    pub sizing_mode: SizingMode,
    /// Default target multiple on risk; the 1.5 gate minimum is separate.
    pub reward_multiple: f64,

    // Signals
    pub ai_confidence_threshold: f64,
    pub oracle_url: Option<String>,

    // Cadence
    pub scan_interval_minutes: u64,
    pub extended_scan_interval_minutes: u64,
    pub intelligence_refresh_minutes: u64,

    // Sessions / overnight
    pub enable_extended_hours: bool,
    pub max_overnight_positions: usize,
    pub max_overnight_days: i64,

    // Lifecycle
    pub order_timeout_seconds: u64,
    pub emergency_stop_pct: f64,
    pub liquidation_concurrency: usize,
    pub liquidate_on_shutdown: bool,

    // Ambient
    pub alert_webhook_url: Option<String>,
    pub state_dir: PathBuf,
    pub metrics_log_interval_cycles: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let api_key_id =
            env::var("APCA_API_KEY_ID").context("APCA_API_KEY_ID not set — refusing to start")?;
        let api_secret_key = env::var("APCA_API_SECRET_KEY")
            .context("APCA_API_SECRET_KEY not set — refusing to start")?;

        let risk_profile = match env::var("RISK_PROFILE")
            .unwrap_or_else(|_| "standard".to_string())
            .to_lowercase()
            .as_str()
        {
            "conservative" => RiskProfile::Conservative,
            "aggressive" => RiskProfile::Aggressive,
            "standard" => RiskProfile::Standard,
            other => bail!("RISK_PROFILE must be conservative|standard|aggressive, got '{}'", other),
        };
        let profile_defaults = RiskConfig::for_profile(risk_profile);

        let sizing_mode = match env::var("POSITION_SIZING_MODE")
            .unwrap_or_else(|_| "fixed".to_string())
            .to_lowercase()
            .as_str()
        {
            "fixed" => SizingMode::Fixed,
            "volatility_adjusted" => SizingMode::VolatilityAdjusted,
            other => bail!(
                "POSITION_SIZING_MODE must be fixed|volatility_adjusted, got '{}'",
                other
            ),
        };

        let config = Self {
            api_key_id,
            api_secret_key,
            paper_trading: env_parse("PAPER_TRADING", "true")?,
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", "200")?,
            rate_limit_utilization: env_parse("RATE_LIMIT_UTILIZATION", "0.8")?,
            stale_quote_max_minutes: env_parse("STALE_QUOTE_MAX_MINUTES", "15")?,

            risk_profile,
            max_position_pct: env_parse(
                "MAX_POSITION_PCT",
                &profile_defaults.max_position_pct.to_string(),
            )?,
            max_trade_risk_pct: env_parse(
                "MAX_TRADE_RISK_PCT",
                &profile_defaults.max_trade_risk_pct.to_string(),
            )?,
            max_portfolio_risk_pct: env_parse(
                "MAX_PORTFOLIO_RISK_PCT",
                &profile_defaults.max_portfolio_risk_pct.to_string(),
            )?,
            circuit_breaker_pct: env_parse(
                "CIRCUIT_BREAKER_PCT",
                &profile_defaults.circuit_breaker_pct.to_string(),
            )?,
            max_concurrent_positions: env_parse(
                "MAX_CONCURRENT_POSITIONS",
                &profile_defaults.max_concurrent_positions.to_string(),
            )?,
            sizing_mode,
            reward_multiple: env_parse("REWARD_MULTIPLE", "2.0")?,

            ai_confidence_threshold: env_parse("AI_CONFIDENCE_THRESHOLD", "0.65")?,
            oracle_url: env::var("ORACLE_URL").ok().filter(|s| !s.is_empty()),

            scan_interval_minutes: env_parse("SCAN_INTERVAL_MINUTES", "15")?,
            extended_scan_interval_minutes: env_parse("EXTENDED_SCAN_INTERVAL_MINUTES", "5")?,
            intelligence_refresh_minutes: env_parse("INTELLIGENCE_REFRESH_MINUTES", "30")?,

            enable_extended_hours: env_parse("ENABLE_EXTENDED_HOURS", "false")?,
            max_overnight_positions: env_parse("MAX_OVERNIGHT_POSITIONS", "3")?,
            max_overnight_days: env_parse("MAX_OVERNIGHT_DAYS", "3")?,

            order_timeout_seconds: env_parse("ORDER_TIMEOUT_SECONDS", "30")?,
            emergency_stop_pct: env_parse("EMERGENCY_STOP_PCT", "0.03")?,
            liquidation_concurrency: env_parse("LIQUIDATION_CONCURRENCY", "4")?,
            liquidate_on_shutdown: env_parse("LIQUIDATE_ON_SHUTDOWN", "false")?,

            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            state_dir: PathBuf::from(env::var("STATE_DIR").unwrap_or_else(|_| "state".to_string())),
            metrics_log_interval_cycles: env_parse("METRICS_LOG_INTERVAL_CYCLES", "12")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key_id.is_empty() || self.api_secret_key.is_empty() {
            bail!("broker credentials are empty");
        }
        if !(0.0..=1.0).contains(&self.ai_confidence_threshold) {
            bail!(
                "AI_CONFIDENCE_THRESHOLD must be 0.0-1.0, got {}",
                self.ai_confidence_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.rate_limit_utilization) {
            bail!(
                "RATE_LIMIT_UTILIZATION must be 0.0-1.0, got {}",
                self.rate_limit_utilization
            );
        }
        if self.rate_limit_per_minute == 0 {
            bail!("RATE_LIMIT_PER_MINUTE must be > 0");
        }
        for (key, value) in [
            ("MAX_POSITION_PCT", self.max_position_pct),
            ("MAX_TRADE_RISK_PCT", self.max_trade_risk_pct),
            ("MAX_PORTFOLIO_RISK_PCT", self.max_portfolio_risk_pct),
            ("CIRCUIT_BREAKER_PCT", self.circuit_breaker_pct),
            ("EMERGENCY_STOP_PCT", self.emergency_stop_pct),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be a fraction in 0.0-1.0, got {}", key, value);
            }
        }
        if self.reward_multiple < 1.5 {
            bail!(
                "REWARD_MULTIPLE must be at least the 1.5 gate minimum, got {}",
                self.reward_multiple
            );
        }
        if self.scan_interval_minutes == 0 || self.order_timeout_seconds == 0 {
            bail!("intervals must be > 0");
        }
        if self.liquidation_concurrency == 0 {
            bail!("LIQUIDATION_CONCURRENCY must be > 0");
        }
        if self.stale_quote_max_minutes <= 0 {
            bail!("STALE_QUOTE_MAX_MINUTES must be > 0");
        }
        Ok(())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            key_id: self.api_key_id.clone(),
            secret_key: self.api_secret_key.clone(),
            paper_trading: self.paper_trading,
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_utilization: self.rate_limit_utilization,
            emergency_reserve: 10,
            stale_quote_max_minutes: self.stale_quote_max_minutes,
            request_timeout_secs: 30,
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        let base = RiskConfig::for_profile(self.risk_profile);
        RiskConfig {
            max_position_pct: self.max_position_pct,
            max_trade_risk_pct: self.max_trade_risk_pct,
            max_portfolio_risk_pct: self.max_portfolio_risk_pct,
            circuit_breaker_pct: self.circuit_breaker_pct,
            max_concurrent_positions: self.max_concurrent_positions,
            sizing_mode: self.sizing_mode,
            ..base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            api_key_id: "key".to_string(),
            api_secret_key: "secret".to_string(),
            paper_trading: true,
            rate_limit_per_minute: 200,
            rate_limit_utilization: 0.8,
            stale_quote_max_minutes: 15,
            risk_profile: RiskProfile::Standard,
            max_position_pct: 0.10,
            max_trade_risk_pct: 0.02,
            max_portfolio_risk_pct: 0.12,
            circuit_breaker_pct: 0.05,
            max_concurrent_positions: 8,
            sizing_mode: SizingMode::Fixed,
            reward_multiple: 2.0,
            ai_confidence_threshold: 0.65,
            oracle_url: None,
            scan_interval_minutes: 15,
            extended_scan_interval_minutes: 5,
            intelligence_refresh_minutes: 30,
            enable_extended_hours: false,
            max_overnight_positions: 3,
            max_overnight_days: 3,
            order_timeout_seconds: 30,
            emergency_stop_pct: 0.03,
            liquidation_concurrency: 4,
            liquidate_on_shutdown: false,
            alert_webhook_url: None,
            state_dir: PathBuf::from("state"),
            metrics_log_interval_cycles: 12,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn empty_credentials_rejected() {
        let mut config = valid();
        config.api_key_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reward_multiple_below_gate_minimum_rejected() {
        let mut config = valid();
        config.reward_multiple = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn percent_fields_must_be_fractions() {
        let mut config = valid();
        config.circuit_breaker_pct = 5.0; // five hundred percent
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_config_carries_rate_budget() {
        let gw = valid().gateway_config();
        assert_eq!(gw.rate_limit_per_minute, 200);
        assert!((gw.rate_limit_utilization - 0.8).abs() < 1e-9);
        assert!(gw.paper_trading);
    }
}

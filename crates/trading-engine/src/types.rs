use anyhow::{bail, Result};
use broker_gateway::OrderSide;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Momentum,
    MeanReversion,
    Breakout,
    Defensive,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Breakout => "breakout",
            StrategyKind::Defensive => "defensive",
        }
    }
}

/// An actionable decision for one symbol, produced by the strategy evaluator
/// and consumed by the order lifecycle exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    /// Filled in by risk sizing; zero until then.
    pub qty: i64,
    pub confidence: f64,
    pub strategy: StrategyKind,
    pub horizon_days: u32,
    pub rationale: String,
    pub volume_ratio: f64,
    pub atr: f64,
    pub sigma_20: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl TradeSignal {
    pub fn risk_per_share(&self) -> f64 {
        (self.entry_price - self.stop_price).abs()
    }

    pub fn reward_risk(&self) -> f64 {
        let risk = self.risk_per_share();
        if risk <= 0.0 {
            return 0.0;
        }
        (self.target_price - self.entry_price).abs() / risk
    }

    /// Price-ordering invariants: long means stop < entry < target, short
    /// means target < entry < stop, and risk per share is strictly positive.
    pub fn validate(&self) -> Result<()> {
        if self.risk_per_share() <= 0.0 {
            bail!("{}: zero risk per share", self.symbol);
        }
        match self.side {
            OrderSide::Buy => {
                if !(self.stop_price < self.entry_price && self.entry_price < self.target_price) {
                    bail!(
                        "{}: long ordering violated (stop {} entry {} target {})",
                        self.symbol,
                        self.stop_price,
                        self.entry_price,
                        self.target_price
                    );
                }
            }
            OrderSide::Sell => {
                if !(self.target_price < self.entry_price && self.entry_price < self.stop_price) {
                    bail!(
                        "{}: short ordering violated (target {} entry {} stop {})",
                        self.symbol,
                        self.target_price,
                        self.entry_price,
                        self.stop_price
                    );
                }
            }
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("{}: confidence {} outside [0,1]", self.symbol, self.confidence);
        }
        Ok(())
    }
}

/// Result of a completed entry submission.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub symbol: String,
    pub side: OrderSide,
    pub requested_qty: i64,
    pub filled_qty: i64,
    pub fill_price: f64,
    pub parent_order_id: String,
    /// True when both protective children were confirmed open.
    pub protected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(side: OrderSide, entry: f64, stop: f64, target: f64) -> TradeSignal {
        TradeSignal {
            symbol: "AAPL".to_string(),
            side,
            entry_price: entry,
            stop_price: stop,
            target_price: target,
            qty: 5,
            confidence: 0.7,
            strategy: StrategyKind::Momentum,
            horizon_days: 3,
            rationale: String::new(),
            volume_ratio: 2.0,
            atr: 2.0,
            sigma_20: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn long_ordering_enforced() {
        assert!(signal(OrderSide::Buy, 180.0, 176.0, 188.0).validate().is_ok());
        assert!(signal(OrderSide::Buy, 180.0, 182.0, 188.0).validate().is_err());
        assert!(signal(OrderSide::Buy, 180.0, 176.0, 179.0).validate().is_err());
    }

    #[test]
    fn short_ordering_enforced() {
        assert!(signal(OrderSide::Sell, 180.0, 184.0, 172.0).validate().is_ok());
        assert!(signal(OrderSide::Sell, 180.0, 176.0, 172.0).validate().is_err());
    }

    #[test]
    fn reward_risk_math() {
        let s = signal(OrderSide::Buy, 180.0, 176.0, 188.0);
        assert!((s.reward_risk() - 2.0).abs() < 1e-9);
        assert!((s.risk_per_share() - 4.0).abs() < 1e-9);
    }
}

//! Concentric risk gates: per-trade, portfolio, and daily. A signal must
//! pass all three before the order lifecycle may touch it.

mod sector;
mod sizing;

pub use sector::symbol_to_sector;
pub use sizing::{SizedPosition, SizingMode};

use chrono::NaiveDate;
use market_intel::MarketRegime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    Standard,
    Aggressive,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Per-position notional cap as a fraction of equity.
    pub max_position_pct: f64,
    /// Reduced notional cap outside the regular session.
    pub extended_hours_position_pct: f64,
    /// Per-trade equity-at-risk cap.
    pub max_trade_risk_pct: f64,
    /// Cap on summed per-position risk.
    pub max_portfolio_risk_pct: f64,
    pub max_concurrent_positions: usize,
    pub max_sector_concentration_pct: f64,
    /// Daily drawdown that halts the system.
    pub circuit_breaker_pct: f64,
    /// Hard minimum reward:risk at the gate.
    pub min_reward_risk: f64,
    /// Equities below this price are rejected outright.
    pub min_price: f64,
    pub sizing_mode: SizingMode,
}

impl RiskConfig {
    pub fn for_profile(profile: RiskProfile) -> Self {
        let standard = Self {
            max_position_pct: 0.10,
            extended_hours_position_pct: 0.03,
            max_trade_risk_pct: 0.02,
            max_portfolio_risk_pct: 0.12,
            max_concurrent_positions: 8,
            max_sector_concentration_pct: 0.25,
            circuit_breaker_pct: 0.05,
            min_reward_risk: 1.5,
            min_price: 10.0,
            sizing_mode: SizingMode::Fixed,
        };
        match profile {
            RiskProfile::Standard => standard,
            RiskProfile::Conservative => Self {
                max_position_pct: 0.05,
                max_concurrent_positions: 3,
                ..standard
            },
            RiskProfile::Aggressive => Self {
                max_concurrent_positions: 12,
                ..standard
            },
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self::for_profile(RiskProfile::Standard)
    }
}

/// Gate verdict with a human-readable reason for the log line.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub approved: bool,
    pub reason: String,
}

impl RiskCheck {
    fn pass() -> Self {
        Self {
            approved: true,
            reason: "all risk criteria met".to_string(),
        }
    }
    fn fail(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Everything the per-trade gate needs, captured from one equity snapshot.
#[derive(Debug, Clone)]
pub struct TradeRiskRequest {
    pub symbol: String,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub qty: i64,
    pub volume_ratio: f64,
    pub equity: f64,
    pub extended_hours: bool,
}

/// Risk contribution of one open position, for the portfolio gate.
#[derive(Debug, Clone)]
pub struct PositionRisk {
    pub symbol: String,
    pub sector: &'static str,
    pub market_value: f64,
    pub risk_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Clear,
    /// First trip: the emergency protocol must run exactly once.
    Tripped,
    /// Already halted from an earlier trip this session.
    AlreadyHalted,
}

#[derive(Debug, Clone)]
struct DailyState {
    session: NaiveDate,
    initial_equity: f64,
    halted: bool,
}

pub struct RiskEngine {
    config: RiskConfig,
    daily: Option<DailyState>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            daily: None,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // -- Per-trade gate ------------------------------------------------------

    pub fn check_trade(&self, req: &TradeRiskRequest) -> RiskCheck {
        if req.entry_price < self.config.min_price {
            return RiskCheck::fail(format!(
                "{} price ${:.2} below ${:.2} floor",
                req.symbol, req.entry_price, self.config.min_price
            ));
        }
        // volume_ratio exactly 1.0 is acceptable; below it is not.
        if req.volume_ratio < 1.0 {
            return RiskCheck::fail(format!(
                "{} volume ratio {:.2} below 1.0",
                req.symbol, req.volume_ratio
            ));
        }

        let risk_per_share = (req.entry_price - req.stop_price).abs();
        if risk_per_share <= 0.0 {
            return RiskCheck::fail(format!("{} has zero risk per share", req.symbol));
        }

        let reward = (req.target_price - req.entry_price).abs();
        let reward_risk = reward / risk_per_share;
        if reward_risk < self.config.min_reward_risk {
            return RiskCheck::fail(format!(
                "{} reward:risk {:.2} below minimum {:.1}",
                req.symbol, reward_risk, self.config.min_reward_risk
            ));
        }

        let position_cap = if req.extended_hours {
            self.config.extended_hours_position_pct
        } else {
            self.config.max_position_pct
        };
        let notional = req.entry_price * req.qty as f64;
        if notional > position_cap * req.equity {
            return RiskCheck::fail(format!(
                "{} notional ${:.0} exceeds {:.0}% position cap",
                req.symbol,
                notional,
                position_cap * 100.0
            ));
        }

        let trade_risk = risk_per_share * req.qty as f64;
        if trade_risk > self.config.max_trade_risk_pct * req.equity {
            return RiskCheck::fail(format!(
                "{} equity at risk ${:.0} exceeds {:.1}% cap",
                req.symbol,
                trade_risk,
                self.config.max_trade_risk_pct * 100.0
            ));
        }

        RiskCheck::pass()
    }

    // -- Portfolio gate ------------------------------------------------------

    pub fn check_portfolio(
        &self,
        candidate: &TradeRiskRequest,
        open_positions: &[PositionRisk],
        equity: f64,
    ) -> RiskCheck {
        if open_positions.len() >= self.config.max_concurrent_positions {
            return RiskCheck::fail(format!(
                "position limit {} reached",
                self.config.max_concurrent_positions
            ));
        }

        let candidate_risk = (candidate.entry_price - candidate.stop_price).abs()
            * candidate.qty as f64;
        let total_risk: f64 =
            open_positions.iter().map(|p| p.risk_amount).sum::<f64>() + candidate_risk;
        if total_risk > self.config.max_portfolio_risk_pct * equity {
            return RiskCheck::fail(format!(
                "portfolio risk ${:.0} exceeds {:.0}% cap",
                total_risk,
                self.config.max_portfolio_risk_pct * 100.0
            ));
        }

        if equity > 0.0 {
            let sector = symbol_to_sector(&candidate.symbol);
            let candidate_value = candidate.entry_price * candidate.qty as f64;
            let sector_value: f64 = open_positions
                .iter()
                .filter(|p| p.sector == sector)
                .map(|p| p.market_value.abs())
                .sum::<f64>()
                + candidate_value;
            if sector_value / equity > self.config.max_sector_concentration_pct {
                return RiskCheck::fail(format!(
                    "sector '{}' concentration {:.1}% exceeds {:.0}% cap",
                    sector,
                    sector_value / equity * 100.0,
                    self.config.max_sector_concentration_pct * 100.0
                ));
            }
        }

        RiskCheck::pass()
    }

    // -- Daily gate / circuit breaker ---------------------------------------

    /// Capture the session-start equity on first entry each trading day.
    pub fn begin_session(&mut self, session: NaiveDate, equity: f64) {
        match &self.daily {
            Some(state) if state.session == session => {}
            _ => {
                tracing::info!(
                    session = %session,
                    initial_equity = equity,
                    "daily risk baseline captured"
                );
                self.daily = Some(DailyState {
                    session,
                    initial_equity: equity,
                    halted: false,
                });
            }
        }
    }

    pub fn initial_equity_today(&self) -> Option<f64> {
        self.daily.as_ref().map(|d| d.initial_equity)
    }

    pub fn drawdown_today(&self, current_equity: f64) -> f64 {
        match &self.daily {
            Some(d) if d.initial_equity > 0.0 => {
                (d.initial_equity - current_equity) / d.initial_equity
            }
            _ => 0.0,
        }
    }

    /// Evaluate the breaker. The transition to halted happens exactly once
    /// per session; later calls report `AlreadyHalted` so the emergency
    /// liquidation never runs twice.
    pub fn check_circuit_breaker(&mut self, current_equity: f64) -> CircuitBreakerState {
        let drawdown = self.drawdown_today(current_equity);
        let Some(daily) = self.daily.as_mut() else {
            return CircuitBreakerState::Clear;
        };

        if daily.halted {
            return CircuitBreakerState::AlreadyHalted;
        }
        if drawdown >= self.config.circuit_breaker_pct {
            daily.halted = true;
            tracing::error!(
                drawdown_pct = drawdown * 100.0,
                limit_pct = self.config.circuit_breaker_pct * 100.0,
                "circuit breaker tripped, halting"
            );
            return CircuitBreakerState::Tripped;
        }
        CircuitBreakerState::Clear
    }

    pub fn is_halted(&self) -> bool {
        self.daily.as_ref().map(|d| d.halted).unwrap_or(false)
    }

    /// External halt (operator or fatal lifecycle error). Returns true when
    /// this call performed the transition.
    pub fn halt(&mut self) -> bool {
        match self.daily.as_mut() {
            Some(daily) if !daily.halted => {
                daily.halted = true;
                true
            }
            _ => false,
        }
    }

    // -- Sizing --------------------------------------------------------------

    pub fn position_size(
        &self,
        equity: f64,
        entry_price: f64,
        stop_price: f64,
        regime: MarketRegime,
        sigma_20: Option<f64>,
    ) -> SizedPosition {
        sizing::position_size(
            &self.config,
            equity,
            entry_price,
            stop_price,
            regime.risk_multiplier(),
            sigma_20,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig::default())
    }

    fn request(qty: i64) -> TradeRiskRequest {
        TradeRiskRequest {
            symbol: "AAPL".to_string(),
            entry_price: 180.0,
            stop_price: 176.0,
            target_price: 188.0,
            qty,
            volume_ratio: 2.1,
            equity: 10_000.0,
            extended_hours: false,
        }
    }

    #[test]
    fn momentum_trade_passes_all_per_trade_checks() {
        let check = engine().check_trade(&request(5));
        assert!(check.approved, "{}", check.reason);
    }

    #[test]
    fn volume_ratio_boundary() {
        let mut req = request(5);
        req.volume_ratio = 1.0;
        assert!(engine().check_trade(&req).approved);
        req.volume_ratio = 0.99;
        assert!(!engine().check_trade(&req).approved);
    }

    #[test]
    fn reward_risk_below_minimum_rejected() {
        let mut req = request(5);
        req.target_price = 185.0; // 5 reward vs 4 risk = 1.25
        let check = engine().check_trade(&req);
        assert!(!check.approved);
        assert!(check.reason.contains("reward:risk"));
    }

    #[test]
    fn cheap_stock_rejected() {
        let mut req = request(5);
        req.entry_price = 8.0;
        req.stop_price = 7.5;
        req.target_price = 9.0;
        assert!(!engine().check_trade(&req).approved);
    }

    #[test]
    fn oversized_notional_rejected() {
        // 10 shares at $180 = $1800 > 10% of $10k? No, exactly 18% — rejected.
        let check = engine().check_trade(&request(10));
        assert!(!check.approved);
        assert!(check.reason.contains("position cap"));
    }

    #[test]
    fn extended_hours_shrinks_the_cap() {
        let mut req = request(3); // $540 notional, over the 3% ($300) cap
        req.extended_hours = true;
        assert!(!engine().check_trade(&req).approved);
        req.qty = 1;
        assert!(engine().check_trade(&req).approved);
    }

    #[test]
    fn portfolio_risk_cap_binds() {
        let eng = engine();
        let positions = vec![PositionRisk {
            symbol: "MSFT".to_string(),
            sector: "Technology",
            market_value: 900.0,
            risk_amount: 1_190.0,
        }];
        // Candidate adds $20 risk; 1190 + 20 > 12% of 10k.
        let check = eng.check_portfolio(&request(5), &positions, 10_000.0);
        assert!(!check.approved);
        assert!(check.reason.contains("portfolio risk"));
    }

    #[test]
    fn position_count_cap_binds() {
        let eng = engine();
        let positions: Vec<PositionRisk> = (0..8)
            .map(|i| PositionRisk {
                symbol: format!("S{}", i),
                sector: "Other",
                market_value: 100.0,
                risk_amount: 10.0,
            })
            .collect();
        assert!(!eng.check_portfolio(&request(1), &positions, 10_000.0).approved);
    }

    #[test]
    fn sector_concentration_cap_binds() {
        let eng = engine();
        // AAPL is Technology; existing tech exposure at 22% of equity.
        let positions = vec![PositionRisk {
            symbol: "MSFT".to_string(),
            sector: "Technology",
            market_value: 2_200.0,
            risk_amount: 40.0,
        }];
        // Candidate adds $900 tech → 31% > 25%.
        let check = eng.check_portfolio(&request(5), &positions, 10_000.0);
        assert!(!check.approved);
        assert!(check.reason.contains("Technology"));
    }

    #[test]
    fn circuit_breaker_trips_once() {
        let mut eng = engine();
        let session = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        eng.begin_session(session, 10_000.0);

        assert_eq!(eng.check_circuit_breaker(9_700.0), CircuitBreakerState::Clear);
        // 5.1% drawdown trips the breaker.
        assert_eq!(eng.check_circuit_breaker(9_490.0), CircuitBreakerState::Tripped);
        assert!(eng.is_halted());
        // Second evaluation must not trigger a second liquidation pass.
        assert_eq!(
            eng.check_circuit_breaker(9_400.0),
            CircuitBreakerState::AlreadyHalted
        );
    }

    #[test]
    fn begin_session_is_idempotent_within_a_day() {
        let mut eng = engine();
        let session = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        eng.begin_session(session, 10_000.0);
        eng.begin_session(session, 9_000.0);
        assert_eq!(eng.initial_equity_today(), Some(10_000.0));

        let next = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
        eng.begin_session(next, 9_500.0);
        assert_eq!(eng.initial_equity_today(), Some(9_500.0));
        assert!(!eng.is_halted());
    }
}

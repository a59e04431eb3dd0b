use serde::{Deserialize, Serialize};

use crate::RiskConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    Fixed,
    VolatilityAdjusted,
}

#[derive(Debug, Clone)]
pub struct SizedPosition {
    pub qty: i64,
    pub risk_budget: f64,
    pub risk_per_share: f64,
    pub notional: f64,
}

/// Risk-budgeted share count.
///
/// `risk_budget = min(max_trade_risk_pct × equity,
///                    max_position_pct × equity × stop_distance_pct)` and
/// `qty = floor(risk_budget / risk_per_share)`, scaled by the regime risk
/// multiplier. In volatility-adjusted mode the count is further divided by
/// `1 + σ`; the equity-at-risk cap is re-enforced after the adjustment.
pub fn position_size(
    config: &RiskConfig,
    equity: f64,
    entry_price: f64,
    stop_price: f64,
    regime_multiplier: f64,
    sigma_20: Option<f64>,
) -> SizedPosition {
    let risk_per_share = (entry_price - stop_price).abs();
    if risk_per_share <= 0.0 || entry_price <= 0.0 || equity <= 0.0 {
        return SizedPosition {
            qty: 0,
            risk_budget: 0.0,
            risk_per_share,
            notional: 0.0,
        };
    }

    let stop_distance_pct = risk_per_share / entry_price;
    let risk_budget = (config.max_trade_risk_pct * equity)
        .min(config.max_position_pct * equity * stop_distance_pct)
        * regime_multiplier.clamp(0.0, 1.5);

    let mut qty = (risk_budget / risk_per_share).floor() as i64;

    if config.sizing_mode == SizingMode::VolatilityAdjusted {
        if let Some(sigma) = sigma_20 {
            if sigma > 0.0 {
                qty = ((qty as f64) / (1.0 + sigma)).floor() as i64;
            }
        }
    }

    // The per-trade cap binds last, whatever the adjustment produced.
    let risk_cap = config.max_trade_risk_pct * equity;
    while qty > 0 && qty as f64 * risk_per_share > risk_cap {
        qty -= 1;
    }

    SizedPosition {
        qty: qty.max(0),
        risk_budget,
        risk_per_share,
        notional: qty.max(0) as f64 * entry_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: SizingMode) -> RiskConfig {
        RiskConfig {
            sizing_mode: mode,
            ..RiskConfig::default()
        }
    }

    #[test]
    fn happy_path_momentum_sizing() {
        // equity 10k, entry 180, stop 176:
        // budget = min(200, 10000 * 0.10 * (4/180)) = 22.2 → floor(22.2/4) = 5
        let sized = position_size(&config(SizingMode::Fixed), 10_000.0, 180.0, 176.0, 1.0, None);
        assert_eq!(sized.qty, 5);
        assert!((sized.notional - 900.0).abs() < 1e-9);
    }

    #[test]
    fn wide_stop_hits_the_trade_risk_cap() {
        // entry 50, stop 40: stop distance 20%, so the 2% equity cap binds:
        // budget = min(200, 10000*0.10*0.20=200) = 200 → qty = 20
        let sized = position_size(&config(SizingMode::Fixed), 10_000.0, 50.0, 40.0, 1.0, None);
        assert_eq!(sized.qty, 20);
        assert!(sized.qty as f64 * sized.risk_per_share <= 200.0);
    }

    #[test]
    fn volatility_adjustment_shrinks_qty_and_cap_still_holds() {
        let fixed = position_size(&config(SizingMode::Fixed), 10_000.0, 50.0, 40.0, 1.0, None);
        let adjusted = position_size(
            &config(SizingMode::VolatilityAdjusted),
            10_000.0,
            50.0,
            40.0,
            1.0,
            Some(0.5),
        );
        assert!(adjusted.qty < fixed.qty);
        assert_eq!(adjusted.qty, 13); // floor(20 / 1.5)
        assert!(adjusted.qty as f64 * adjusted.risk_per_share <= 0.02 * 10_000.0);
    }

    #[test]
    fn volatile_regime_multiplier_halves_the_budget() {
        let sized = position_size(&config(SizingMode::Fixed), 10_000.0, 50.0, 40.0, 0.5, None);
        assert_eq!(sized.qty, 10);
    }

    #[test]
    fn degenerate_inputs_size_to_zero() {
        let cfg = config(SizingMode::Fixed);
        assert_eq!(position_size(&cfg, 10_000.0, 180.0, 180.0, 1.0, None).qty, 0);
        assert_eq!(position_size(&cfg, 0.0, 180.0, 176.0, 1.0, None).qty, 0);
    }
}

use broker_gateway::OrderSide;
use chrono::Utc;
use market_intel::{MarketRegime, RegimeDetection};
use opportunity_funnel::{DeepAnalysis, Opportunity};

use crate::types::{StrategyKind, TradeSignal};

/// Regime-to-strategy selection table.
pub fn strategies_for(regime: MarketRegime) -> (StrategyKind, StrategyKind) {
    match regime {
        MarketRegime::BullTrending => (StrategyKind::Momentum, StrategyKind::Breakout),
        MarketRegime::BearTrending => (StrategyKind::Defensive, StrategyKind::MeanReversion),
        MarketRegime::Volatile => (StrategyKind::MeanReversion, StrategyKind::Defensive),
        MarketRegime::RangeBound => (StrategyKind::MeanReversion, StrategyKind::Breakout),
        MarketRegime::LowVolatility => (StrategyKind::Breakout, StrategyKind::Momentum),
        MarketRegime::Unknown => (StrategyKind::Defensive, StrategyKind::MeanReversion),
    }
}

fn horizon_days(strategy: StrategyKind) -> u32 {
    match strategy {
        StrategyKind::Momentum => 3,
        StrategyKind::MeanReversion => 5,
        StrategyKind::Breakout => 7,
        StrategyKind::Defensive => 10,
    }
}

/// Direction decision and fit from one strategy. `None` means the setup is
/// not there.
fn apply_strategy(
    strategy: StrategyKind,
    opp: &Opportunity,
    analysis: &DeepAnalysis,
) -> Option<(OrderSide, f64, String)> {
    match strategy {
        StrategyKind::Momentum => {
            // Ride confirmed strength, avoid the overbought edge.
            if opp.daily_change_pct > 0.0
                && analysis.rsi_14 > 50.0
                && analysis.rsi_14 < 75.0
                && analysis.macd_histogram > 0.0
            {
                let fit = ((analysis.rsi_14 - 50.0) / 25.0).min(1.0) * 0.6
                    + (opp.volume_ratio / 3.0).min(1.0) * 0.4;
                return Some((
                    OrderSide::Buy,
                    fit,
                    format!(
                        "momentum: +{:.1}% on {:.1}x volume, RSI {:.0}, MACD rising",
                        opp.daily_change_pct, opp.volume_ratio, analysis.rsi_14
                    ),
                ));
            }
            None
        }
        StrategyKind::MeanReversion => {
            if analysis.rsi_14 < 30.0 {
                let fit = ((30.0 - analysis.rsi_14) / 30.0).min(1.0);
                return Some((
                    OrderSide::Buy,
                    fit,
                    format!("mean reversion: oversold RSI {:.0}", analysis.rsi_14),
                ));
            }
            if analysis.rsi_14 > 70.0 {
                let fit = ((analysis.rsi_14 - 70.0) / 30.0).min(1.0);
                return Some((
                    OrderSide::Sell,
                    fit,
                    format!("mean reversion: overbought RSI {:.0}", analysis.rsi_14),
                ));
            }
            None
        }
        StrategyKind::Breakout => {
            // Volume-confirmed push with momentum turning up.
            if opp.volume_ratio >= 1.5
                && analysis.macd_histogram > 0.0
                && opp.daily_change_pct > 0.0
            {
                let fit = (opp.volume_ratio / 4.0).min(1.0) * 0.7
                    + (opp.daily_change_pct / 5.0).min(1.0) * 0.3;
                return Some((
                    OrderSide::Buy,
                    fit,
                    format!(
                        "breakout: {:.1}x volume expansion, +{:.1}% move",
                        opp.volume_ratio, opp.daily_change_pct
                    ),
                ));
            }
            None
        }
        StrategyKind::Defensive => {
            // Only defensive sectors, bought on weakness.
            let defensive_sector = matches!(
                opp.sector,
                "Consumer Staples" | "Healthcare" | "ETFs"
            );
            if defensive_sector && analysis.rsi_14 < 45.0 {
                let fit = 0.5 + ((45.0 - analysis.rsi_14) / 45.0) * 0.5;
                return Some((
                    OrderSide::Buy,
                    fit,
                    format!(
                        "defensive: {} at RSI {:.0}",
                        opp.sector, analysis.rsi_14
                    ),
                ));
            }
            None
        }
    }
}

pub struct StrategyEvaluator {
    reward_multiple: f64,
    confidence_threshold: f64,
}

impl StrategyEvaluator {
    pub fn new(reward_multiple: f64, confidence_threshold: f64) -> Self {
        Self {
            reward_multiple,
            confidence_threshold,
        }
    }

    /// Turn a deep-dived opportunity into a trade signal under the current
    /// regime, or nothing when neither the primary nor the fallback strategy
    /// sees a setup, or the blended confidence falls short.
    pub fn evaluate(
        &self,
        opp: &Opportunity,
        regime: &RegimeDetection,
    ) -> Option<TradeSignal> {
        let analysis = opp.analysis.as_ref()?;
        if analysis.atr_14 <= 0.0 {
            return None;
        }

        let (primary, fallback) = strategies_for(regime.regime);
        let (strategy, (side, fit, rationale)) = match apply_strategy(primary, opp, analysis) {
            Some(hit) => (primary, hit),
            None => (fallback, apply_strategy(fallback, opp, analysis)?),
        };

        // Entry at the touch: ask for buys, bid for sells, mid as fallback.
        let entry = match side {
            OrderSide::Buy if analysis.ask_price > 0.0 => analysis.ask_price,
            OrderSide::Sell if analysis.bid_price > 0.0 => analysis.bid_price,
            _ => opp.price,
        };
        if entry <= 0.0 {
            return None;
        }

        let stop_distance = 2.0 * analysis.atr_14;
        let (stop, target) = match side {
            OrderSide::Buy => (
                entry - stop_distance,
                entry + self.reward_multiple * stop_distance,
            ),
            OrderSide::Sell => (
                entry + stop_distance,
                entry - self.reward_multiple * stop_distance,
            ),
        };
        if stop <= 0.0 || target <= 0.0 {
            return None;
        }

        // Confidence blends the funnel score, strategy fit, and the regime
        // (oracle-influenced) confidence.
        let funnel_component = 1.0 / (1.0 + (-opp.score).exp());
        let confidence =
            (0.4 * funnel_component + 0.4 * fit + 0.2 * regime.confidence).clamp(0.0, 1.0);
        if confidence < self.confidence_threshold {
            tracing::debug!(
                symbol = %opp.symbol,
                confidence,
                threshold = self.confidence_threshold,
                "signal dropped below confidence threshold"
            );
            return None;
        }

        let signal = TradeSignal {
            symbol: opp.symbol.clone(),
            side,
            entry_price: entry,
            stop_price: stop,
            target_price: target,
            qty: 0,
            confidence,
            strategy,
            horizon_days: horizon_days(strategy),
            rationale,
            volume_ratio: opp.volume_ratio,
            atr: analysis.atr_14,
            sigma_20: analysis.sigma_20,
            created_at: Utc::now(),
        };

        match signal.validate() {
            Ok(()) => Some(signal),
            Err(e) => {
                tracing::warn!(symbol = %opp.symbol, "generated signal failed validation: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_intel::RegimeMetrics;
    use opportunity_funnel::DiscoverySource;

    fn detection(regime: MarketRegime, confidence: f64) -> RegimeDetection {
        RegimeDetection {
            regime,
            confidence,
            metrics: RegimeMetrics {
                atr_percent: 1.5,
                trend_strength: 0.02,
                volatility: 0.012,
                range_efficiency: 0.6,
                sample_size: 100,
            },
            detected_at: Utc::now(),
            reasoning: String::new(),
        }
    }

    fn aapl_momentum_opportunity() -> Opportunity {
        let mut opp = Opportunity::new("AAPL", DiscoverySource::TopMovers);
        opp.price = 180.0;
        opp.daily_change_pct = 3.2;
        opp.volume = 90_000_000.0;
        opp.avg_volume = 42_000_000.0;
        opp.volume_ratio = 2.1;
        opp.score = 1.2;
        opp.analysis = Some(DeepAnalysis {
            rsi_14: 58.0,
            macd_line: 1.1,
            macd_signal: 0.8,
            macd_histogram: 0.3,
            atr_14: 2.0,
            spread_pct: 0.05,
            bid_price: 179.95,
            ask_price: 180.0,
            sigma_20: Some(0.015),
        });
        opp
    }

    #[test]
    fn bull_regime_momentum_buy_with_atr_bracket() {
        let evaluator = StrategyEvaluator::new(2.0, 0.65);
        let regime = detection(MarketRegime::BullTrending, 0.8);
        let signal = evaluator.evaluate(&aapl_momentum_opportunity(), &regime).unwrap();

        assert_eq!(signal.side, OrderSide::Buy);
        assert_eq!(signal.strategy, StrategyKind::Momentum);
        assert!((signal.entry_price - 180.0).abs() < 1e-9);
        assert!((signal.stop_price - 176.0).abs() < 1e-9);
        assert!((signal.target_price - 188.0).abs() < 1e-9);
        assert!(signal.reward_risk() >= 1.5);
        assert!(signal.confidence >= 0.65);
    }

    #[test]
    fn oversold_name_triggers_mean_reversion() {
        let evaluator = StrategyEvaluator::new(2.0, 0.3);
        let regime = detection(MarketRegime::RangeBound, 0.7);
        let mut opp = aapl_momentum_opportunity();
        opp.daily_change_pct = -4.0;
        if let Some(a) = opp.analysis.as_mut() {
            a.rsi_14 = 24.0;
            a.macd_histogram = -0.2;
        }
        let signal = evaluator.evaluate(&opp, &regime).unwrap();
        assert_eq!(signal.strategy, StrategyKind::MeanReversion);
        assert_eq!(signal.side, OrderSide::Buy);
    }

    #[test]
    fn overbought_name_shorts_with_mirrored_bracket() {
        let evaluator = StrategyEvaluator::new(2.0, 0.3);
        let regime = detection(MarketRegime::Volatile, 0.7);
        let mut opp = aapl_momentum_opportunity();
        if let Some(a) = opp.analysis.as_mut() {
            a.rsi_14 = 81.0;
        }
        let signal = evaluator.evaluate(&opp, &regime).unwrap();
        assert_eq!(signal.side, OrderSide::Sell);
        assert!(signal.stop_price > signal.entry_price);
        assert!(signal.target_price < signal.entry_price);
    }

    #[test]
    fn low_confidence_is_dropped() {
        let evaluator = StrategyEvaluator::new(2.0, 0.95);
        let regime = detection(MarketRegime::BullTrending, 0.1);
        assert!(evaluator.evaluate(&aapl_momentum_opportunity(), &regime).is_none());
    }

    #[test]
    fn no_analysis_means_no_signal() {
        let evaluator = StrategyEvaluator::new(2.0, 0.5);
        let regime = detection(MarketRegime::BullTrending, 0.8);
        let mut opp = aapl_momentum_opportunity();
        opp.analysis = None;
        assert!(evaluator.evaluate(&opp, &regime).is_none());
    }

    #[test]
    fn strategy_table_matches_regimes() {
        assert_eq!(
            strategies_for(MarketRegime::BullTrending),
            (StrategyKind::Momentum, StrategyKind::Breakout)
        );
        assert_eq!(
            strategies_for(MarketRegime::BearTrending),
            (StrategyKind::Defensive, StrategyKind::MeanReversion)
        );
        assert_eq!(
            strategies_for(MarketRegime::LowVolatility),
            (StrategyKind::Breakout, StrategyKind::Momentum)
        );
    }
}

//! Stage-2 local scoring. Deterministic and broker-call-free: this is the
//! scorer that governs ranking when the oracle is silent.

use market_intel::MarketRegime;

use crate::models::Opportunity;

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub momentum: f64,
    pub volume: f64,
    pub sector: f64,
    pub risk: f64,
}

/// Regime-parameterized weights: trending regimes chase momentum, volatile
/// regimes penalize dispersion hardest.
pub fn weights_for(regime: MarketRegime) -> ScoreWeights {
    match regime {
        MarketRegime::BullTrending => ScoreWeights {
            momentum: 0.50,
            volume: 0.20,
            sector: 0.20,
            risk: 0.10,
        },
        MarketRegime::BearTrending => ScoreWeights {
            momentum: 0.20,
            volume: 0.20,
            sector: 0.30,
            risk: 0.30,
        },
        MarketRegime::Volatile => ScoreWeights {
            momentum: 0.20,
            volume: 0.20,
            sector: 0.10,
            risk: 0.50,
        },
        MarketRegime::RangeBound => ScoreWeights {
            momentum: 0.25,
            volume: 0.30,
            sector: 0.20,
            risk: 0.25,
        },
        MarketRegime::LowVolatility => ScoreWeights {
            momentum: 0.35,
            volume: 0.35,
            sector: 0.20,
            risk: 0.10,
        },
        MarketRegime::Unknown => ScoreWeights {
            momentum: 0.25,
            volume: 0.25,
            sector: 0.25,
            risk: 0.25,
        },
    }
}

/// Sector preference per regime, in [-1, 1].
pub fn sector_fit(regime: MarketRegime, sector: &str) -> f64 {
    match regime {
        MarketRegime::BullTrending => match sector {
            "Technology" | "Consumer Discretionary" | "Communication" => 1.0,
            "Consumer Staples" | "Healthcare" => -0.5,
            _ => 0.0,
        },
        MarketRegime::BearTrending => match sector {
            "Consumer Staples" | "Healthcare" => 1.0,
            "Technology" | "Consumer Discretionary" => -1.0,
            _ => 0.0,
        },
        MarketRegime::Volatile => match sector {
            "ETFs" | "Consumer Staples" => 0.5,
            _ => 0.0,
        },
        MarketRegime::RangeBound | MarketRegime::LowVolatility | MarketRegime::Unknown => 0.0,
    }
}

/// Mean and population standard deviation of daily changes across the
/// candidate set, for the momentum z-score.
pub fn change_distribution(candidates: &[Opportunity]) -> (f64, f64) {
    if candidates.is_empty() {
        return (0.0, 1.0);
    }
    let mean = candidates.iter().map(|c| c.daily_change_pct).sum::<f64>()
        / candidates.len() as f64;
    let variance = candidates
        .iter()
        .map(|c| (c.daily_change_pct - mean).powi(2))
        .sum::<f64>()
        / candidates.len() as f64;
    let std = variance.sqrt();
    (mean, if std > 0.0 { std } else { 1.0 })
}

/// `score = w_m·z(change) + w_v·ln(volume_ratio) + w_s·sector_fit − w_r·dispersion`
pub fn score(
    candidate: &Opportunity,
    regime: MarketRegime,
    change_mean: f64,
    change_std: f64,
) -> f64 {
    let w = weights_for(regime);

    let z = (candidate.daily_change_pct - change_mean) / change_std;
    // Bear regimes hunt oversold names: flip the momentum sign.
    let momentum = if regime == MarketRegime::BearTrending { -z } else { z };

    let volume = candidate.volume_ratio.max(0.1).ln();
    let sector = sector_fit(regime, candidate.sector);
    // Dispersion penalty: moves beyond ±5% daily are increasingly suspect.
    let dispersion = (candidate.daily_change_pct.abs() / 5.0).min(2.0);

    w.momentum * momentum + w.volume * volume + w.sector * sector - w.risk * dispersion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoverySource;

    fn candidate(symbol: &str, change: f64, ratio: f64) -> Opportunity {
        let mut opp = Opportunity::new(symbol, DiscoverySource::TopMovers);
        opp.daily_change_pct = change;
        opp.volume_ratio = ratio;
        opp.price = 100.0;
        opp
    }

    #[test]
    fn bull_regime_prefers_stronger_momentum() {
        let pool = vec![
            candidate("AAA", 2.0, 1.5),
            candidate("BBB", 6.0, 1.5),
            candidate("CCC", 3.0, 1.5),
        ];
        let (mean, std) = change_distribution(&pool);
        let weak = score(&pool[0], MarketRegime::BullTrending, mean, std);
        let strong = score(&pool[1], MarketRegime::BullTrending, mean, std);
        assert!(strong > weak);
    }

    #[test]
    fn bear_regime_flips_momentum_preference() {
        let pool = vec![candidate("UP", 4.0, 1.5), candidate("DOWN", -4.0, 1.5)];
        let (mean, std) = change_distribution(&pool);
        let up = score(&pool[0], MarketRegime::BearTrending, mean, std);
        let down = score(&pool[1], MarketRegime::BearTrending, mean, std);
        assert!(down > up);
    }

    #[test]
    fn higher_volume_ratio_scores_higher() {
        let pool = vec![candidate("LOW", 3.0, 1.0), candidate("HIGH", 3.0, 4.0)];
        let (mean, std) = change_distribution(&pool);
        assert!(
            score(&pool[1], MarketRegime::RangeBound, mean, std)
                > score(&pool[0], MarketRegime::RangeBound, mean, std)
        );
    }

    #[test]
    fn volatile_regime_penalizes_extreme_moves_harder() {
        let calm = candidate("CALM", 2.5, 1.5);
        let wild = candidate("WILD", 12.0, 1.5);
        let pool = vec![calm.clone(), wild.clone()];
        let (mean, std) = change_distribution(&pool);
        let calm_volatile = score(&calm, MarketRegime::Volatile, mean, std);
        let wild_volatile = score(&wild, MarketRegime::Volatile, mean, std);
        let calm_bull = score(&calm, MarketRegime::BullTrending, mean, std);
        let wild_bull = score(&wild, MarketRegime::BullTrending, mean, std);
        // In a bull tape the wild mover wins; in a volatile tape it loses.
        assert!(wild_bull > calm_bull);
        assert!(wild_volatile < calm_volatile);
    }

    #[test]
    fn distribution_of_empty_pool_is_safe() {
        let (mean, std) = change_distribution(&[]);
        assert_eq!(mean, 0.0);
        assert_eq!(std, 1.0);
    }
}

use broker_gateway::Bar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse market environment label. Parameterizes strategy selection and
/// risk multipliers everywhere downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    BullTrending,
    BearTrending,
    Volatile,
    RangeBound,
    LowVolatility,
    /// Insufficient data to classify.
    Unknown,
}

impl MarketRegime {
    pub fn as_tag(&self) -> &'static str {
        match self {
            MarketRegime::BullTrending => "bull_trending",
            MarketRegime::BearTrending => "bear_trending",
            MarketRegime::Volatile => "volatile",
            MarketRegime::RangeBound => "range_bound",
            MarketRegime::LowVolatility => "low_volatility",
            MarketRegime::Unknown => "unknown",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "bull_trending" => Some(MarketRegime::BullTrending),
            "bear_trending" => Some(MarketRegime::BearTrending),
            "volatile" => Some(MarketRegime::Volatile),
            "range_bound" => Some(MarketRegime::RangeBound),
            "low_volatility" => Some(MarketRegime::LowVolatility),
            _ => None,
        }
    }

    /// Risk multiplier applied to position sizing (1.0 = normal).
    pub fn risk_multiplier(&self) -> f64 {
        match self {
            MarketRegime::BullTrending | MarketRegime::BearTrending => 1.0,
            MarketRegime::RangeBound => 0.9,
            MarketRegime::Volatile => 0.5,
            MarketRegime::LowVolatility => 1.0,
            MarketRegime::Unknown => 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMetrics {
    /// ATR(14) as a percent of the latest close.
    pub atr_percent: f64,
    /// Regression slope of the last 20 closes, normalized by price.
    pub trend_strength: f64,
    /// Standard deviation of daily returns.
    pub volatility: f64,
    /// Net movement divided by total movement.
    pub range_efficiency: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeDetection {
    pub regime: MarketRegime,
    pub confidence: f64,
    pub metrics: RegimeMetrics,
    pub detected_at: DateTime<Utc>,
    pub reasoning: String,
}

impl RegimeDetection {
    /// One-line summary handed to the oracle as classification context.
    pub fn summary_text(&self) -> String {
        format!(
            "trend={:.4} volatility={:.4} efficiency={:.2} atr_pct={:.2} local_regime={}",
            self.metrics.trend_strength,
            self.metrics.volatility,
            self.metrics.range_efficiency,
            self.metrics.atr_percent,
            self.regime.as_tag()
        )
    }
}

/// Rule-based regime detector over daily index bars.
pub struct RegimeDetector {
    min_bars: usize,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self { min_bars: 50 }
    }

    pub fn detect(&self, bars: &[Bar]) -> RegimeDetection {
        if bars.len() < self.min_bars {
            return RegimeDetection {
                regime: MarketRegime::Unknown,
                confidence: 0.0,
                metrics: RegimeMetrics {
                    atr_percent: 0.0,
                    trend_strength: 0.0,
                    volatility: 0.0,
                    range_efficiency: 0.0,
                    sample_size: bars.len(),
                },
                detected_at: Utc::now(),
                reasoning: format!(
                    "insufficient data: {} bars (need {})",
                    bars.len(),
                    self.min_bars
                ),
            };
        }

        let metrics = RegimeMetrics {
            atr_percent: atr_percent(bars),
            trend_strength: trend_strength(bars),
            volatility: volatility(bars),
            range_efficiency: range_efficiency(bars),
            sample_size: bars.len(),
        };

        let (regime, confidence) = classify(&metrics);
        let reasoning = format!(
            "{} (trend: {:.4}, volatility: {:.2}%, efficiency: {:.2}, ATR: {:.2}%)",
            regime.as_tag(),
            metrics.trend_strength,
            metrics.volatility * 100.0,
            metrics.range_efficiency,
            metrics.atr_percent
        );

        RegimeDetection {
            regime,
            confidence,
            metrics,
            detected_at: Utc::now(),
            reasoning,
        }
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(metrics: &RegimeMetrics) -> (MarketRegime, f64) {
    let mut scores = [
        (MarketRegime::BullTrending, 0.0_f64),
        (MarketRegime::BearTrending, 0.0),
        (MarketRegime::RangeBound, 0.0),
        (MarketRegime::Volatile, 0.0),
        (MarketRegime::LowVolatility, 0.0),
    ];

    if metrics.volatility > 0.03 {
        scores[3].1 += 40.0;
    }
    if metrics.volatility < 0.01 {
        scores[4].1 += 30.0;
    }
    if metrics.trend_strength > 0.01 && metrics.range_efficiency > 0.5 {
        scores[0].1 += 50.0;
    }
    if metrics.trend_strength < -0.01 && metrics.range_efficiency > 0.5 {
        scores[1].1 += 50.0;
    }
    if metrics.range_efficiency < 0.3 && metrics.volatility < 0.025 {
        scores[2].1 += 40.0;
    }
    if metrics.atr_percent > 3.0 {
        scores[3].1 += 20.0;
    } else if metrics.atr_percent < 1.0 {
        scores[4].1 += 20.0;
    }

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let (regime, score) = scores[0];
    if score == 0.0 {
        return (MarketRegime::RangeBound, 0.25);
    }
    (regime, (score / 100.0).min(1.0))
}

fn atr_percent(bars: &[Bar]) -> f64 {
    if bars.len() < 15 {
        return 0.0;
    }
    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }
    let recent = &true_ranges[true_ranges.len().saturating_sub(14)..];
    let atr = recent.iter().sum::<f64>() / recent.len() as f64;
    let last_close = bars.last().map(|b| b.close).unwrap_or(0.0);
    if last_close <= 0.0 {
        return 0.0;
    }
    atr / last_close * 100.0
}

fn trend_strength(bars: &[Bar]) -> f64 {
    if bars.len() < 20 {
        return 0.0;
    }
    let recent = &bars[bars.len() - 20..];
    let n = 20.0;
    let sum_x: f64 = (0..20).sum::<usize>() as f64;
    let sum_y: f64 = recent.iter().map(|b| b.close).sum();
    let sum_xy: f64 = recent
        .iter()
        .enumerate()
        .map(|(i, b)| i as f64 * b.close)
        .sum();
    let sum_x2: f64 = (0..20).map(|i| (i * i) as f64).sum();

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return 0.0;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let avg_price = sum_y / n;
    if avg_price == 0.0 {
        return 0.0;
    }
    slope / avg_price
}

fn volatility(bars: &[Bar]) -> f64 {
    if bars.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = bars
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| (w[1].close - w[0].close) / w[0].close)
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt()
}

fn range_efficiency(bars: &[Bar]) -> f64 {
    if bars.len() < 2 {
        return 0.0;
    }
    let net = (bars.last().unwrap().close - bars.first().unwrap().close).abs();
    let total: f64 = bars.windows(2).map(|w| (w[1].close - w[0].close).abs()).sum();
    if total == 0.0 {
        return 0.0;
    }
    net / total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_with_trend(count: usize, step: f64) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let base = 100.0 + i as f64 * step;
                Bar {
                    timestamp: Utc::now(),
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base,
                    volume: 1_000_000.0,
                }
            })
            .collect()
    }

    #[test]
    fn steady_uptrend_reads_bull() {
        let detection = RegimeDetector::new().detect(&bars_with_trend(100, 0.5));
        assert_eq!(detection.regime, MarketRegime::BullTrending);
        assert!(detection.metrics.trend_strength > 0.0);
    }

    #[test]
    fn steady_downtrend_reads_bear() {
        let detection = RegimeDetector::new().detect(&bars_with_trend(100, -0.5));
        assert_eq!(detection.regime, MarketRegime::BearTrending);
        assert!(detection.metrics.trend_strength < 0.0);
    }

    #[test]
    fn short_history_is_unknown() {
        let detection = RegimeDetector::new().detect(&bars_with_trend(10, 0.0));
        assert_eq!(detection.regime, MarketRegime::Unknown);
        assert_eq!(detection.confidence, 0.0);
    }

    #[test]
    fn whipsaw_reads_volatile() {
        let bars: Vec<Bar> = (0..100)
            .map(|i| {
                let base = if i % 2 == 0 { 100.0 } else { 106.0 };
                Bar {
                    timestamp: Utc::now(),
                    open: base,
                    high: base + 4.0,
                    low: base - 4.0,
                    close: base,
                    volume: 1_000_000.0,
                }
            })
            .collect();
        let detection = RegimeDetector::new().detect(&bars);
        assert_eq!(detection.regime, MarketRegime::Volatile);
    }

    #[test]
    fn regime_tags_round_trip() {
        for regime in [
            MarketRegime::BullTrending,
            MarketRegime::BearTrending,
            MarketRegime::Volatile,
            MarketRegime::RangeBound,
            MarketRegime::LowVolatility,
        ] {
            assert_eq!(MarketRegime::from_tag(regime.as_tag()), Some(regime));
        }
        assert_eq!(MarketRegime::from_tag("sideways"), None);
    }
}

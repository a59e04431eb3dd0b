//! Market regime classification. A deterministic local detector governs
//! correctness; the optional intelligence oracle only adjusts ranking and
//! confidence at the margin and the system runs fine without it.

mod oracle;
mod regime;

pub use oracle::{HttpOracle, IntelligenceOracle, OracleVerdict, ORACLE_TIMEOUT};
pub use regime::{MarketRegime, RegimeDetection, RegimeDetector, RegimeMetrics};

use std::sync::Arc;

use broker_gateway::Bar;

/// Detector plus optional oracle, with graceful degradation: oracle failures
/// fall back to the local result and are never surfaced to callers.
pub struct MarketIntelligence {
    detector: RegimeDetector,
    oracle: Option<Arc<dyn IntelligenceOracle>>,
}

impl MarketIntelligence {
    pub fn new(oracle: Option<Arc<dyn IntelligenceOracle>>) -> Self {
        Self {
            detector: RegimeDetector::new(),
            oracle,
        }
    }

    pub fn oracle(&self) -> Option<Arc<dyn IntelligenceOracle>> {
        self.oracle.clone()
    }

    /// Classify the regime from index bars, letting the oracle refine the
    /// local verdict when it answers within its deadline.
    pub async fn assess(&self, bars: &[Bar]) -> RegimeDetection {
        let local = self.detector.detect(bars);

        let Some(oracle) = &self.oracle else {
            return local;
        };

        let summary = local.summary_text();
        match tokio::time::timeout(ORACLE_TIMEOUT, oracle.classify_regime(&summary)).await {
            Ok(Ok(verdict)) => {
                if let Some(regime) = MarketRegime::from_tag(&verdict.regime_tag) {
                    tracing::info!(
                        regime = regime.as_tag(),
                        score = verdict.score,
                        "oracle refined regime classification"
                    );
                    return RegimeDetection {
                        regime,
                        confidence: verdict.score.clamp(0.0, 1.0),
                        reasoning: format!("oracle: {}", verdict.reasoning),
                        ..local
                    };
                }
                tracing::warn!(tag = %verdict.regime_tag, "oracle returned unknown regime tag");
                local
            }
            Ok(Err(e)) => {
                tracing::warn!("oracle unavailable, using local regime: {}", e);
                local
            }
            Err(_) => {
                tracing::warn!("oracle timed out, using local regime");
                local
            }
        }
    }
}

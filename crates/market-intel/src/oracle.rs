use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Oracle calls that run past this deadline are abandoned and the local
/// scorer's answer stands.
pub const ORACLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub regime_tag: String,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Advisory natural-language intelligence service. Implementations must be
/// safe to lose: every consumer has a deterministic fallback.
#[async_trait]
pub trait IntelligenceOracle: Send + Sync {
    /// Classify the market regime from a metrics summary line.
    async fn classify_regime(&self, summary: &str) -> Result<OracleVerdict>;

    /// Re-rank candidate symbols for the given regime, best first. The
    /// returned list may be a subset; missing symbols keep local order.
    async fn rank_candidates(&self, regime_tag: &str, symbols: &[String]) -> Result<Vec<String>>;
}

/// HTTP-backed oracle client.
pub struct HttpOracle {
    http: Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(ORACLE_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    summary: &'a str,
}

#[derive(Serialize)]
struct RankRequest<'a> {
    regime: &'a str,
    symbols: &'a [String],
}

#[derive(Deserialize)]
struct RankResponse {
    #[serde(default)]
    symbols: Vec<String>,
}

#[async_trait]
impl IntelligenceOracle for HttpOracle {
    async fn classify_regime(&self, summary: &str) -> Result<OracleVerdict> {
        let url = format!("{}/v1/regime", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&ClassifyRequest { summary })
            .send()
            .await
            .map_err(|e| anyhow!("oracle request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("oracle returned HTTP {}", response.status()));
        }
        let verdict = response
            .json::<OracleVerdict>()
            .await
            .map_err(|e| anyhow!("oracle response decode failed: {}", e))?;
        Ok(verdict)
    }

    async fn rank_candidates(&self, regime_tag: &str, symbols: &[String]) -> Result<Vec<String>> {
        let url = format!("{}/v1/rank", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&RankRequest {
                regime: regime_tag,
                symbols,
            })
            .send()
            .await
            .map_err(|e| anyhow!("oracle request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("oracle returned HTTP {}", response.status()));
        }
        let ranked = response
            .json::<RankResponse>()
            .await
            .map_err(|e| anyhow!("oracle response decode failed: {}", e))?;
        Ok(ranked.symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parses_with_optional_reasoning() {
        let verdict: OracleVerdict =
            serde_json::from_str(r#"{"regime_tag":"bull_trending","score":0.82}"#).unwrap();
        assert_eq!(verdict.regime_tag, "bull_trending");
        assert!(verdict.reasoning.is_empty());
    }
}

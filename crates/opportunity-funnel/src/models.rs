use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    TopMovers,
    MostActive,
    UnusualVolume,
    NewsDriven,
    SectorRotation,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::TopMovers => "top_movers",
            DiscoverySource::MostActive => "most_active",
            DiscoverySource::UnusualVolume => "unusual_volume",
            DiscoverySource::NewsDriven => "news_driven",
            DiscoverySource::SectorRotation => "sector_rotation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketCapBucket {
    Large,
    Mid,
    Small,
    Unknown,
}

/// Deep-dive analysis attached to an opportunity that survived stage 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysis {
    pub rsi_14: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub atr_14: f64,
    pub spread_pct: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    /// Standard deviation of daily returns over the fetched history.
    pub sigma_20: Option<f64>,
}

/// A candidate symbol somewhere in the funnel. Created by a stage-1 source,
/// pruned by the strategic filter, or promoted with analysis attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub source: DiscoverySource,
    pub discovered_at: DateTime<Utc>,
    pub price: f64,
    pub daily_change_pct: f64,
    pub volume: f64,
    /// 20-session average volume; zero until the deep dive fills it in.
    pub avg_volume: f64,
    pub volume_ratio: f64,
    pub market_cap: MarketCapBucket,
    pub sector: &'static str,
    pub score: f64,
    pub analysis: Option<DeepAnalysis>,
}

impl Opportunity {
    pub fn new(symbol: impl Into<String>, source: DiscoverySource) -> Self {
        let symbol = symbol.into();
        let sector = risk_engine::symbol_to_sector(&symbol);
        Self {
            symbol,
            source,
            discovered_at: Utc::now(),
            price: 0.0,
            daily_change_pct: 0.0,
            volume: 0.0,
            avg_volume: 0.0,
            volume_ratio: 1.0,
            market_cap: MarketCapBucket::Unknown,
            sector,
            score: 0.0,
            analysis: None,
        }
    }
}

/// Per-cycle funnel accounting, logged at the end of each run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunnelStats {
    pub broad_candidates: usize,
    pub after_hard_filters: usize,
    pub after_strategic_filter: usize,
    pub deep_dives_completed: usize,
    pub deep_dives_aborted: usize,
    pub dropped_stale: usize,
    pub dropped_spread: usize,
    pub api_calls_used: usize,
    pub emitted: usize,
}

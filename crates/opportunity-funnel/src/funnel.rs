use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use broker_gateway::{BrokerGateway, ErrorKind, MoverKind};
use market_intel::{IntelligenceOracle, MarketRegime, ORACLE_TIMEOUT};
use tokio::time::Instant;

use crate::indicators;
use crate::models::{DeepAnalysis, DiscoverySource, FunnelStats, MarketCapBucket, Opportunity};
use crate::scoring;

#[derive(Debug, Clone)]
pub struct FunnelConfig {
    pub min_price: f64,
    pub max_price: f64,
    pub min_avg_volume: f64,
    pub min_abs_change_pct: f64,
    /// Survivors of the strategic filter.
    pub strategic_top_n: usize,
    /// Hard cap on broker calls across all stage-3 dives.
    pub deep_dive_api_budget: usize,
    /// Wall-clock budget for a whole funnel cycle.
    pub cycle_wall_budget: Duration,
    pub max_spread_pct: f64,
    /// Final emitted list size.
    pub max_output: usize,
    pub movers_top: usize,
    pub actives_top: usize,
    pub news_limit: usize,
    /// Liquid names screened for volume spikes each cycle.
    pub unusual_volume_watchlist: Vec<String>,
    /// Volume spike multiple that flags a symbol.
    pub unusual_volume_ratio: f64,
    /// Scan stops after this many hits to bound the bar fetches.
    pub unusual_volume_max_hits: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            min_price: 10.0,
            max_price: 500.0,
            min_avg_volume: 1_000_000.0,
            min_abs_change_pct: 2.0,
            strategic_top_n: 30,
            deep_dive_api_budget: 20,
            cycle_wall_budget: Duration::from_secs(60),
            max_spread_pct: 1.0,
            max_output: 10,
            movers_top: 50,
            actives_top: 50,
            news_limit: 50,
            unusual_volume_watchlist: [
                "SPY", "QQQ", "IWM", "AAPL", "MSFT", "GOOGL", "AMZN", "TSLA", "NVDA", "AMD",
                "META", "NFLX", "CRM", "ROKU", "SNAP", "UBER", "LYFT", "PLTR", "SHOP", "COIN",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            unusual_volume_ratio: 3.0,
            unusual_volume_max_hits: 5,
        }
    }
}

/// Three-stage reducer: broad scan → strategic filter → deep dive. Each
/// cycle spends a bounded number of broker calls and a bounded wall clock,
/// whatever the universe looks like.
pub struct OpportunityFunnel {
    gateway: Arc<BrokerGateway>,
    config: FunnelConfig,
    oracle: Option<Arc<dyn IntelligenceOracle>>,
}

impl OpportunityFunnel {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        config: FunnelConfig,
        oracle: Option<Arc<dyn IntelligenceOracle>>,
    ) -> Self {
        Self {
            gateway,
            config,
            oracle,
        }
    }

    pub async fn run(&self, regime: MarketRegime) -> Result<(Vec<Opportunity>, FunnelStats)> {
        let started = Instant::now();
        let mut stats = FunnelStats::default();

        let candidates = self.broad_scan(&mut stats).await;
        stats.broad_candidates = candidates.len();

        let filtered: Vec<Opportunity> = candidates
            .into_iter()
            .filter(|c| passes_hard_filters(c, &self.config))
            .collect();
        stats.after_hard_filters = filtered.len();

        let survivors = self.strategic_filter(filtered, regime).await;
        stats.after_strategic_filter = survivors.len();

        let mut deep = self.deep_dive(survivors, started, &mut stats).await;

        deep.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        deep.truncate(self.config.max_output);
        stats.emitted = deep.len();

        tracing::info!(
            broad = stats.broad_candidates,
            filtered = stats.after_hard_filters,
            strategic = stats.after_strategic_filter,
            emitted = stats.emitted,
            api_calls = stats.api_calls_used,
            stale = stats.dropped_stale,
            wide_spread = stats.dropped_spread,
            "funnel cycle complete"
        );
        Ok((deep, stats))
    }

    // -- Stage 1: broad scan (screeners plus a bounded volume screen) --------

    async fn broad_scan(&self, stats: &mut FunnelStats) -> Vec<Opportunity> {
        let mut candidates: Vec<Opportunity> = Vec::new();

        for kind in [MoverKind::Gainers, MoverKind::Losers] {
            stats.api_calls_used += 1;
            let resp = self.gateway.get_market_movers(kind, self.config.movers_top).await;
            match resp.data {
                Some(movers) if resp.success => {
                    for mover in movers {
                        let mut opp = Opportunity::new(&mover.symbol, DiscoverySource::TopMovers);
                        opp.price = mover.price;
                        opp.daily_change_pct = mover.percent_change;
                        candidates.push(opp);
                    }
                }
                _ => tracing::warn!(
                    kind = %resp.error_kind,
                    "movers scan failed: {}",
                    resp.error_text()
                ),
            }
        }

        stats.api_calls_used += 1;
        let actives = self.gateway.get_most_active(self.config.actives_top).await;
        match actives.data {
            Some(list) if actives.success => {
                for active in list {
                    let mut opp = Opportunity::new(&active.symbol, DiscoverySource::MostActive);
                    opp.volume = active.volume;
                    candidates.push(opp);
                }
            }
            _ => tracing::warn!(
                kind = %actives.error_kind,
                "most-active scan failed: {}",
                actives.error_text()
            ),
        }

        stats.api_calls_used += 1;
        let news = self.gateway.get_news(&[], self.config.news_limit).await;
        match news.data {
            Some(articles) if news.success => {
                for article in articles {
                    for symbol in article.symbols {
                        candidates.push(Opportunity::new(symbol, DiscoverySource::NewsDriven));
                    }
                }
            }
            _ => tracing::warn!(
                kind = %news.error_kind,
                "news scan failed: {}",
                news.error_text()
            ),
        }

        candidates.extend(self.unusual_volume_scan(stats).await);

        merge_candidates(candidates)
    }

    /// Screen a fixed set of liquid names for volume spikes: trailing-bar
    /// average versus today's volume, flagged at the configured multiple.
    async fn unusual_volume_scan(&self, stats: &mut FunnelStats) -> Vec<Opportunity> {
        let mut hits = Vec::new();

        for symbol in &self.config.unusual_volume_watchlist {
            if hits.len() >= self.config.unusual_volume_max_hits {
                break;
            }

            stats.api_calls_used += 1;
            let resp = self.gateway.get_bars(symbol, "1Day", 10).await;
            let Some(bars) = resp.data.filter(|_| resp.success) else {
                continue;
            };
            if bars.len() < 5 {
                continue;
            }

            // Average from the historical bars, excluding today's.
            let history = &bars[..bars.len() - 1];
            let avg_volume =
                history.iter().map(|b| b.volume).sum::<f64>() / history.len() as f64;
            let latest = bars.last().expect("non-empty bars");
            if avg_volume <= 0.0 || latest.volume <= 0.0 {
                continue;
            }

            let volume_ratio = latest.volume / avg_volume;
            if volume_ratio < self.config.unusual_volume_ratio {
                continue;
            }
            if latest.close < self.config.min_price {
                continue;
            }

            let prev_close = bars[bars.len() - 2].close;
            let mut opp = Opportunity::new(symbol.as_str(), DiscoverySource::UnusualVolume);
            opp.price = latest.close;
            opp.daily_change_pct = if prev_close > 0.0 {
                (latest.close - prev_close) / prev_close * 100.0
            } else {
                0.0
            };
            opp.volume = latest.volume;
            opp.avg_volume = avg_volume;
            opp.volume_ratio = volume_ratio;

            tracing::info!(
                symbol = %opp.symbol,
                volume_ratio,
                "unusual volume detected"
            );
            hits.push(opp);
        }

        if hits.is_empty() {
            tracing::debug!("no unusual volume patterns detected");
        }
        hits
    }

    // -- Stage 2: strategic filter (0 broker calls) --------------------------

    async fn strategic_filter(
        &self,
        mut candidates: Vec<Opportunity>,
        regime: MarketRegime,
    ) -> Vec<Opportunity> {
        let (mean, std) = scoring::change_distribution(&candidates);
        for candidate in candidates.iter_mut() {
            candidate.score = scoring::score(candidate, regime, mean, std);
        }
        candidates
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.config.strategic_top_n);

        // The oracle is advisory: a timeout or error leaves local order.
        if let Some(oracle) = &self.oracle {
            let symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();
            match tokio::time::timeout(
                ORACLE_TIMEOUT,
                oracle.rank_candidates(regime.as_tag(), &symbols),
            )
            .await
            {
                Ok(Ok(ranked)) if !ranked.is_empty() => {
                    candidates = reorder_with_oracle(candidates, &ranked);
                    tracing::debug!(ranked = ranked.len(), "oracle re-ranked candidates");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("oracle ranking unavailable, using local score: {}", e),
                Err(_) => tracing::warn!("oracle ranking timed out, using local score"),
            }
        }

        candidates
    }

    // -- Stage 3: deep dive (strict API budget) ------------------------------

    async fn deep_dive(
        &self,
        survivors: Vec<Opportunity>,
        started: Instant,
        stats: &mut FunnelStats,
    ) -> Vec<Opportunity> {
        const CALLS_PER_SYMBOL: usize = 3;
        let budget_ceiling = stats.api_calls_used + self.config.deep_dive_api_budget;
        let mut promoted = Vec::new();

        for candidate in survivors {
            if stats.api_calls_used + CALLS_PER_SYMBOL > budget_ceiling {
                stats.deep_dives_aborted += 1;
                continue;
            }
            if started.elapsed() > self.config.cycle_wall_budget {
                stats.deep_dives_aborted += 1;
                continue;
            }

            match self.dive_symbol(candidate, stats).await {
                Some(opportunity) => {
                    stats.deep_dives_completed += 1;
                    promoted.push(opportunity);
                }
                None => {}
            }
        }
        promoted
    }

    async fn dive_symbol(
        &self,
        mut candidate: Opportunity,
        stats: &mut FunnelStats,
    ) -> Option<Opportunity> {
        let symbol = candidate.symbol.clone();

        // Quote first: the cheapest rejection (stale or unquotable).
        stats.api_calls_used += 1;
        let quote_resp = self.gateway.get_latest_quote(&symbol).await;
        let quote = match quote_resp.data {
            Some(q) if quote_resp.success => q,
            _ => {
                if quote_resp.error_kind == ErrorKind::StaleData {
                    stats.dropped_stale += 1;
                    tracing::warn!(symbol, "dropped from cycle: stale quote");
                } else {
                    tracing::warn!(
                        symbol,
                        kind = %quote_resp.error_kind,
                        "dropped from cycle: {}",
                        quote_resp.error_text()
                    );
                }
                return None;
            }
        };

        let spread_pct = quote.spread_pct();
        if spread_pct > self.config.max_spread_pct {
            stats.dropped_spread += 1;
            tracing::debug!(symbol, spread_pct, "dropped from cycle: spread too wide");
            return None;
        }

        stats.api_calls_used += 1;
        let daily_resp = self.gateway.get_bars(&symbol, "1Day", 60).await;
        let daily = match daily_resp.data {
            Some(bars) if daily_resp.success && bars.len() >= 21 => bars,
            _ => {
                tracing::debug!(symbol, "dropped from cycle: insufficient daily history");
                return None;
            }
        };

        stats.api_calls_used += 1;
        let intraday_resp = self.gateway.get_bars(&symbol, "5Min", 50).await;
        let intraday = intraday_resp.data.filter(|_| intraday_resp.success);

        // Fill the fields the screeners could not provide.
        let closes: Vec<f64> = daily.iter().map(|b| b.close).collect();
        let last = daily.last().expect("non-empty daily bars");
        let prior = &daily[daily.len() - 2];

        candidate.price = if quote.mid() > 0.0 {
            quote.mid()
        } else {
            intraday
                .as_ref()
                .and_then(|bars| bars.last().map(|b| b.close))
                .unwrap_or(last.close)
        };
        if candidate.daily_change_pct == 0.0 && prior.close > 0.0 {
            candidate.daily_change_pct = (last.close - prior.close) / prior.close * 100.0;
        }
        candidate.volume = last.volume;
        candidate.avg_volume = avg_volume_20(&daily);
        candidate.volume_ratio = if candidate.avg_volume > 0.0 {
            candidate.volume / candidate.avg_volume
        } else {
            0.0
        };
        candidate.market_cap = estimate_cap_bucket(candidate.price, candidate.avg_volume);

        // Screener rows with no price data deferred the bounds to here.
        if candidate.price < self.config.min_price
            || candidate.price > self.config.max_price
            || candidate.avg_volume < self.config.min_avg_volume
        {
            tracing::debug!(
                symbol,
                price = candidate.price,
                avg_volume = candidate.avg_volume,
                "dropped from cycle: out of bounds after deep dive"
            );
            return None;
        }

        let rsi_14 = indicators::rsi(&closes, 14)?;
        let macd = indicators::macd(&closes, 12, 26, 9);
        let atr_14 = indicators::atr(&daily, 14)?;

        candidate.analysis = Some(DeepAnalysis {
            rsi_14,
            macd_line: macd.map(|m| m.line).unwrap_or(0.0),
            macd_signal: macd.map(|m| m.signal).unwrap_or(0.0),
            macd_histogram: macd.map(|m| m.histogram).unwrap_or(0.0),
            atr_14,
            spread_pct,
            bid_price: quote.bid_price,
            ask_price: quote.ask_price,
            sigma_20: indicators::return_sigma(&closes),
        });
        Some(candidate)
    }
}

/// Deduplicate by symbol, skipping non-standard tickers. When the unusual-
/// volume screen and another source surface the same symbol, the unusual-
/// volume record wins: it carries real trailing-average volume data.
pub fn merge_candidates(raw: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut seen: HashMap<String, Opportunity> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for candidate in raw {
        let symbol = candidate.symbol.clone();
        if symbol.is_empty() || symbol.contains('.') || symbol.contains('-') || symbol.len() > 5 {
            continue;
        }
        match seen.get_mut(&symbol) {
            None => {
                order.push(symbol.clone());
                seen.insert(symbol, candidate);
            }
            Some(existing) => {
                if candidate.source == DiscoverySource::UnusualVolume
                    && existing.source != DiscoverySource::UnusualVolume
                {
                    existing.source = DiscoverySource::UnusualVolume;
                    existing.volume = candidate.volume;
                    existing.avg_volume = candidate.avg_volume;
                    existing.volume_ratio = candidate.volume_ratio;
                }
                if existing.price == 0.0 {
                    existing.price = candidate.price;
                }
                if existing.daily_change_pct == 0.0 {
                    existing.daily_change_pct = candidate.daily_change_pct;
                }
                if existing.volume == 0.0 {
                    existing.volume = candidate.volume;
                }
            }
        }
    }

    order.into_iter().filter_map(|s| seen.remove(&s)).collect()
}

/// Hard stage-1 filters on whatever the screeners reported. Rows without a
/// price yet (news, actives) pass through; the deep dive re-checks bounds
/// once real data arrives.
pub fn passes_hard_filters(candidate: &Opportunity, config: &FunnelConfig) -> bool {
    if candidate.price > 0.0
        && (candidate.price < config.min_price || candidate.price > config.max_price)
    {
        return false;
    }
    let change_known = matches!(
        candidate.source,
        DiscoverySource::TopMovers | DiscoverySource::UnusualVolume
    );
    if change_known && candidate.daily_change_pct.abs() < config.min_abs_change_pct {
        return false;
    }
    if candidate.source == DiscoverySource::MostActive
        && candidate.volume > 0.0
        && candidate.volume < config.min_avg_volume
    {
        return false;
    }
    true
}

/// Apply an oracle ranking: listed symbols first in oracle order, the rest
/// keep their local order.
pub fn reorder_with_oracle(candidates: Vec<Opportunity>, ranked: &[String]) -> Vec<Opportunity> {
    let position: HashMap<&str, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();
    let mut indexed: Vec<(usize, usize, Opportunity)> = candidates
        .into_iter()
        .enumerate()
        .map(|(local, c)| {
            let oracle_rank = position.get(c.symbol.as_str()).copied().unwrap_or(usize::MAX);
            (oracle_rank, local, c)
        })
        .collect();
    indexed.sort_by_key(|(oracle_rank, local, _)| (*oracle_rank, *local));
    indexed.into_iter().map(|(_, _, c)| c).collect()
}

/// 20-session average volume, excluding the most recent (possibly partial)
/// bar.
fn avg_volume_20(daily: &[broker_gateway::Bar]) -> f64 {
    if daily.len() < 2 {
        return 0.0;
    }
    let end = daily.len() - 1;
    let history = &daily[end.saturating_sub(20)..end];
    history.iter().map(|b| b.volume).sum::<f64>() / history.len() as f64
}

fn estimate_cap_bucket(price: f64, avg_volume: f64) -> MarketCapBucket {
    // Rough dollar-volume proxy in lieu of shares outstanding.
    let dollar_volume = price * avg_volume;
    if dollar_volume >= 500_000_000.0 {
        MarketCapBucket::Large
    } else if dollar_volume >= 50_000_000.0 {
        MarketCapBucket::Mid
    } else if dollar_volume > 0.0 {
        MarketCapBucket::Small
    } else {
        MarketCapBucket::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mover(symbol: &str, price: f64, change: f64) -> Opportunity {
        let mut opp = Opportunity::new(symbol, DiscoverySource::TopMovers);
        opp.price = price;
        opp.daily_change_pct = change;
        opp
    }

    #[test]
    fn hard_filters_enforce_price_band_and_move_size() {
        let config = FunnelConfig::default();
        assert!(passes_hard_filters(&mover("AAPL", 180.0, 3.2), &config));
        assert!(!passes_hard_filters(&mover("PENNY", 4.0, 8.0), &config));
        assert!(!passes_hard_filters(&mover("BRK", 900.0, 3.0), &config));
        assert!(!passes_hard_filters(&mover("FLAT", 50.0, 1.5), &config));
        // Loser side counts by absolute change.
        assert!(passes_hard_filters(&mover("DOWN", 50.0, -4.0), &config));
    }

    #[test]
    fn news_rows_without_price_pass_stage_one() {
        let config = FunnelConfig::default();
        let newsy = Opportunity::new("NWSY", DiscoverySource::NewsDriven);
        assert!(passes_hard_filters(&newsy, &config));
    }

    #[test]
    fn merge_dedups_and_fills_missing_fields() {
        let mut active = Opportunity::new("AAPL", DiscoverySource::MostActive);
        active.volume = 90_000_000.0;
        let raw = vec![mover("AAPL", 180.0, 3.2), active, mover("TSLA", 250.0, -2.5)];
        let merged = merge_candidates(raw);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].symbol, "AAPL");
        // First-seen source wins; fields from both records survive.
        assert_eq!(merged[0].source, DiscoverySource::TopMovers);
        assert_eq!(merged[0].price, 180.0);
        assert_eq!(merged[0].volume, 90_000_000.0);
    }

    #[test]
    fn merge_prefers_the_unusual_volume_record() {
        let mut spike = Opportunity::new("AAPL", DiscoverySource::UnusualVolume);
        spike.price = 180.0;
        spike.daily_change_pct = 3.2;
        spike.volume = 150_000_000.0;
        spike.avg_volume = 42_000_000.0;
        spike.volume_ratio = 3.57;

        let merged = merge_candidates(vec![mover("AAPL", 180.0, 3.2), spike]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, DiscoverySource::UnusualVolume);
        // The screen's trailing-average data rides along.
        assert_eq!(merged[0].avg_volume, 42_000_000.0);
        assert!((merged[0].volume_ratio - 3.57).abs() < 1e-9);
    }

    #[test]
    fn merge_skips_non_standard_tickers() {
        let raw = vec![
            mover("BRK.B", 400.0, 2.5),
            mover("TLRY-W", 20.0, 5.0),
            mover("TOOLONGG", 20.0, 5.0),
            mover("OK", 20.0, 5.0),
        ];
        let merged = merge_candidates(raw);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].symbol, "OK");
    }

    #[test]
    fn oracle_reorder_respects_partial_rankings() {
        let candidates = vec![
            mover("AAA", 50.0, 2.0),
            mover("BBB", 50.0, 3.0),
            mover("CCC", 50.0, 4.0),
        ];
        let ranked = vec!["CCC".to_string(), "AAA".to_string()];
        let reordered = reorder_with_oracle(candidates, &ranked);
        let symbols: Vec<&str> = reordered.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["CCC", "AAA", "BBB"]);
    }

    #[test]
    fn avg_volume_spans_exactly_twenty_sessions() {
        use chrono::Utc;
        // 40 bars: the first 19 carry a huge volume that must not leak into
        // the average; the 20 sessions before today carry 1M each.
        let bars: Vec<broker_gateway::Bar> = (0..40)
            .map(|i| broker_gateway::Bar {
                timestamp: Utc::now(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: if i < 19 { 9_000_000.0 } else { 1_000_000.0 },
            })
            .collect();
        assert!((avg_volume_20(&bars) - 1_000_000.0).abs() < 1e-6);

        // Shorter histories average whatever precedes the latest bar.
        let short: Vec<broker_gateway::Bar> = bars[..5].to_vec();
        assert!((avg_volume_20(&short) - 9_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn cap_bucket_from_dollar_volume() {
        assert_eq!(estimate_cap_bucket(200.0, 10_000_000.0), MarketCapBucket::Large);
        assert_eq!(estimate_cap_bucket(20.0, 5_000_000.0), MarketCapBucket::Mid);
        assert_eq!(estimate_cap_bucket(12.0, 1_200_000.0), MarketCapBucket::Small);
        assert_eq!(estimate_cap_bucket(0.0, 0.0), MarketCapBucket::Unknown);
    }
}

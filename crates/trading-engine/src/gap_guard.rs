use std::collections::{HashMap, HashSet};

use broker_gateway::Position;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapSeverity {
    Low,
    Moderate,
    High,
    Extreme,
}

/// Bucket an overnight gap by magnitude.
pub fn bucket_gap(gap_pct: f64) -> GapSeverity {
    let magnitude = gap_pct.abs();
    if magnitude >= 5.0 {
        GapSeverity::Extreme
    } else if magnitude >= 2.0 {
        GapSeverity::High
    } else if magnitude >= 1.0 {
        GapSeverity::Moderate
    } else {
        GapSeverity::Low
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GapAlert {
    pub symbol: String,
    pub gap_pct: f64,
    pub current_price: f64,
    pub previous_close: f64,
    pub position_impact: f64,
    pub severity: GapSeverity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CloseMark {
    close_price: f64,
    qty: f64,
}

/// Overnight and extended-hours exposure guard: snapshots closing prices,
/// raises gap alerts on the next pre-market, and rotates aged positions
/// out.
pub struct GapGuard {
    close_marks: HashMap<String, CloseMark>,
    alerts_sent: HashSet<String>,
    held_since: HashMap<String, NaiveDate>,
    max_overnight_days: i64,
    max_overnight_positions: usize,
}

impl GapGuard {
    pub fn new(max_overnight_days: i64, max_overnight_positions: usize) -> Self {
        Self {
            close_marks: HashMap::new(),
            alerts_sent: HashSet::new(),
            held_since: HashMap::new(),
            max_overnight_days,
            max_overnight_positions,
        }
    }

    /// Snapshot `(symbol, close_price, qty)` for every open position at
    /// session close.
    pub fn record_session_close(&mut self, positions: &[Position]) {
        self.close_marks.clear();
        for position in positions {
            let qty = position.qty_f64();
            if qty == 0.0 {
                continue;
            }
            let close_price = position.market_value_f64().abs() / qty.abs();
            self.close_marks.insert(
                position.symbol.clone(),
                CloseMark { close_price, qty },
            );
        }
        if !self.close_marks.is_empty() {
            tracing::info!(
                positions = self.close_marks.len(),
                "recorded session-close marks for gap monitoring"
            );
        }
    }

    /// New trading session: clear alert suppression.
    pub fn reset_session(&mut self) {
        self.alerts_sent.clear();
    }

    /// Track how long each symbol has been held; new symbols start today,
    /// closed ones drop out.
    pub fn update_holdings(&mut self, positions: &[Position], today: NaiveDate) {
        let current: HashSet<&str> = positions
            .iter()
            .filter(|p| p.qty_f64() != 0.0)
            .map(|p| p.symbol.as_str())
            .collect();
        self.held_since.retain(|symbol, _| current.contains(symbol.as_str()));
        for symbol in current {
            self.held_since.entry(symbol.to_string()).or_insert(today);
        }
    }

    /// Compare current prices against the close marks. Emits one alert per
    /// symbol and severity level, at `Moderate` and above.
    pub fn check_gaps(&mut self, current_prices: &[(String, f64)]) -> Vec<GapAlert> {
        let mut alerts = Vec::new();
        for (symbol, price) in current_prices {
            let Some(mark) = self.close_marks.get(symbol) else {
                continue;
            };
            if mark.close_price <= 0.0 || *price <= 0.0 {
                continue;
            }
            let gap_pct = (price - mark.close_price) / mark.close_price * 100.0;
            let severity = bucket_gap(gap_pct);
            if severity < GapSeverity::Moderate {
                continue;
            }
            let key = format!("{}:{:?}", symbol, severity);
            if !self.alerts_sent.insert(key) {
                continue;
            }
            alerts.push(GapAlert {
                symbol: symbol.clone(),
                gap_pct,
                current_price: *price,
                previous_close: mark.close_price,
                position_impact: (price - mark.close_price) * mark.qty.abs(),
                severity,
                timestamp: Utc::now(),
            });
        }
        alerts
    }

    /// Positions held past the overnight age limit, due for preferential
    /// closure in the next regular session.
    pub fn rotation_candidates(&self, today: NaiveDate) -> Vec<String> {
        self.held_since
            .iter()
            .filter(|(_, since)| (today - **since).num_days() > self.max_overnight_days)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Positions beyond the overnight cap, worst unrealized loss first —
    /// the order in which they should be liquidated before close.
    pub fn overnight_excess(&self, positions: &[Position]) -> Vec<String> {
        let mut open: Vec<&Position> =
            positions.iter().filter(|p| p.qty_f64() != 0.0).collect();
        if open.len() <= self.max_overnight_positions {
            return Vec::new();
        }
        open.sort_by(|a, b| {
            a.unrealized_pl_f64()
                .partial_cmp(&b.unrealized_pl_f64())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let excess = open.len() - self.max_overnight_positions;
        open.iter()
            .take(excess)
            .map(|p| p.symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, qty: f64, price: f64, unrealized: f64) -> Position {
        serde_json::from_value(serde_json::json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": "long",
            "avg_entry_price": price.to_string(),
            "current_price": price.to_string(),
            "market_value": (qty * price).to_string(),
            "cost_basis": (qty * price).to_string(),
            "unrealized_pl": unrealized.to_string(),
            "unrealized_plpc": "0"
        }))
        .unwrap()
    }

    #[test]
    fn gap_buckets_at_spec_boundaries() {
        assert_eq!(bucket_gap(0.9), GapSeverity::Low);
        assert_eq!(bucket_gap(1.0), GapSeverity::Moderate);
        assert_eq!(bucket_gap(1.9), GapSeverity::Moderate);
        assert_eq!(bucket_gap(2.0), GapSeverity::High);
        assert_eq!(bucket_gap(4.9), GapSeverity::High);
        assert_eq!(bucket_gap(5.0), GapSeverity::Extreme);
        assert_eq!(bucket_gap(-3.0), GapSeverity::High);
    }

    #[test]
    fn gap_alerts_fire_at_moderate_and_dedup() {
        let mut guard = GapGuard::new(3, 3);
        guard.record_session_close(&[position("AAPL", 10.0, 100.0, 0.0)]);

        // 0.5% gap: below the alert floor.
        assert!(guard.check_gaps(&[("AAPL".to_string(), 100.5)]).is_empty());

        // 1.5% gap: moderate alert.
        let alerts = guard.check_gaps(&[("AAPL".to_string(), 101.5)]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, GapSeverity::Moderate);
        assert!((alerts[0].gap_pct - 1.5).abs() < 1e-9);
        assert!((alerts[0].position_impact - 15.0).abs() < 1e-9);

        // Same severity again: suppressed.
        assert!(guard.check_gaps(&[("AAPL".to_string(), 101.6)]).is_empty());

        // Escalation to a new severity still alerts.
        let alerts = guard.check_gaps(&[("AAPL".to_string(), 106.0)]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, GapSeverity::Extreme);
    }

    #[test]
    fn aged_positions_rotate() {
        let mut guard = GapGuard::new(3, 3);
        let day1 = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let day6 = NaiveDate::from_ymd_opt(2025, 6, 6).unwrap();

        guard.update_holdings(&[position("OLD", 10.0, 50.0, 0.0)], day1);
        guard.update_holdings(
            &[position("OLD", 10.0, 50.0, 0.0), position("NEW", 5.0, 20.0, 0.0)],
            day6,
        );

        let rotation = guard.rotation_candidates(day6);
        assert_eq!(rotation, vec!["OLD".to_string()]);
    }

    #[test]
    fn closed_positions_stop_aging() {
        let mut guard = GapGuard::new(3, 3);
        let day1 = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let day8 = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();

        guard.update_holdings(&[position("GONE", 10.0, 50.0, 0.0)], day1);
        guard.update_holdings(&[], day8);
        assert!(guard.rotation_candidates(day8).is_empty());
    }

    #[test]
    fn overnight_excess_liquidates_worst_losers_first() {
        let guard = GapGuard::new(3, 3);
        let positions = vec![
            position("WIN", 10.0, 50.0, 120.0),
            position("FLAT", 10.0, 50.0, 0.0),
            position("LOSS1", 10.0, 50.0, -80.0),
            position("LOSS2", 10.0, 50.0, -200.0),
            position("SMALL", 10.0, 50.0, -10.0),
        ];
        // Cap 3 → shed 2, largest loss first.
        let excess = guard.overnight_excess(&positions);
        assert_eq!(excess, vec!["LOSS2".to_string(), "LOSS1".to_string()]);
    }

    #[test]
    fn under_cap_keeps_everything() {
        let guard = GapGuard::new(3, 3);
        let positions = vec![position("A", 10.0, 50.0, 0.0)];
        assert!(guard.overnight_excess(&positions).is_empty());
    }
}

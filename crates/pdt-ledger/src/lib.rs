//! Pattern-day-trade accounting over a rolling five-session window, with a
//! hard block list for symbols the broker has already rejected under PDT
//! rules.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const PDT_EQUITY_THRESHOLD: f64 = 25_000.0;
pub const PDT_MAX_DAY_TRADES: usize = 3;
const ROLLING_SESSIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// The side that would close a position opened with `self`.
    pub fn closing_side(self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

/// A completed round trip: opened and closed in the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayTrade {
    pub symbol: String,
    pub session: NaiveDate,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// An entry opened during the current session that has not yet been closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenLot {
    pub side: TradeSide,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdtDecision {
    Allowed,
    /// Equity below threshold, count at the limit, and the order closes a
    /// same-session open.
    WouldViolate,
}

pub struct PdtLedger {
    current_session: NaiveDate,
    /// Trading sessions seen, newest last, capped at the rolling window.
    recent_sessions: VecDeque<NaiveDate>,
    day_trades: Vec<DayTrade>,
    opened_this_session: HashMap<String, OpenLot>,
    blocked: HashSet<String>,
}

impl PdtLedger {
    pub fn new(session: NaiveDate) -> Self {
        let mut recent_sessions = VecDeque::with_capacity(ROLLING_SESSIONS);
        recent_sessions.push_back(session);
        Self {
            current_session: session,
            recent_sessions,
            day_trades: Vec::new(),
            opened_this_session: HashMap::new(),
            blocked: HashSet::new(),
        }
    }

    pub fn current_session(&self) -> NaiveDate {
        self.current_session
    }

    /// Advance to a new trading session: same-session tracking and broker
    /// blocks reset, the day-trade history prunes to the rolling window.
    pub fn roll_to_session(&mut self, session: NaiveDate) {
        if session == self.current_session {
            return;
        }
        let blocked = self.blocked.len();
        self.opened_this_session.clear();
        self.blocked.clear();
        self.current_session = session;

        self.recent_sessions.push_back(session);
        while self.recent_sessions.len() > ROLLING_SESSIONS {
            self.recent_sessions.pop_front();
        }
        let oldest = *self.recent_sessions.front().expect("non-empty sessions");
        self.day_trades.retain(|dt| dt.session >= oldest);

        tracing::info!(
            session = %session,
            cleared_blocks = blocked,
            day_trades_in_window = self.day_trades.len(),
            "PDT ledger rolled to new session"
        );
    }

    /// Record a position entry fill.
    pub fn record_open(&mut self, symbol: &str, side: TradeSide, at: DateTime<Utc>) {
        self.opened_this_session
            .entry(symbol.to_string())
            .or_insert(OpenLot { side, opened_at: at });
    }

    /// Record a position exit fill. Closing a same-session open books a day
    /// trade.
    pub fn record_close(&mut self, symbol: &str, at: DateTime<Utc>) {
        if let Some(lot) = self.opened_this_session.remove(symbol) {
            self.day_trades.push(DayTrade {
                symbol: symbol.to_string(),
                session: self.current_session,
                opened_at: lot.opened_at,
                closed_at: at,
            });
            tracing::info!(
                symbol,
                count = self.day_trade_count(),
                "day trade recorded"
            );
        }
    }

    /// True iff the symbol was opened this session and `side` would close it.
    pub fn would_be_day_trade(&self, symbol: &str, side: TradeSide) -> bool {
        self.opened_this_session
            .get(symbol)
            .map(|lot| lot.side.closing_side() == side)
            .unwrap_or(false)
    }

    pub fn day_trade_count(&self) -> usize {
        self.day_trades.len()
    }

    /// Hard-block a symbol the broker rejected with a PDT code. Cleared at
    /// session rollover.
    pub fn block(&mut self, symbol: &str) {
        if self.blocked.insert(symbol.to_string()) {
            tracing::warn!(symbol, "symbol PDT-blocked until session rollover");
        }
    }

    pub fn is_blocked(&self, symbol: &str) -> bool {
        self.blocked.contains(symbol)
    }

    /// The submission gate: small accounts at the day-trade limit may not
    /// close a same-session open.
    pub fn check_order(&self, equity: f64, symbol: &str, side: TradeSide) -> PdtDecision {
        if equity < PDT_EQUITY_THRESHOLD
            && self.day_trade_count() >= PDT_MAX_DAY_TRADES
            && self.would_be_day_trade(symbol, side)
        {
            return PdtDecision::WouldViolate;
        }
        PdtDecision::Allowed
    }

    // -- Persistence ---------------------------------------------------------

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            current_session: self.current_session,
            recent_sessions: self.recent_sessions.iter().copied().collect(),
            day_trades: self.day_trades.clone(),
            opened_this_session: self.opened_this_session.clone(),
            blocked: self.blocked.iter().cloned().collect(),
            saved_at: Utc::now(),
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            current_session: snapshot.current_session,
            recent_sessions: snapshot.recent_sessions.into_iter().collect(),
            day_trades: snapshot.day_trades,
            opened_this_session: snapshot.opened_this_session,
            blocked: snapshot.blocked.into_iter().collect(),
        }
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)
            .with_context(|| format!("writing PDT ledger snapshot to {}", path.display()))?;
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading PDT ledger snapshot from {}", path.display()))?;
        let snapshot: LedgerSnapshot = serde_json::from_str(&json)?;
        Ok(Self::from_snapshot(snapshot))
    }
}

/// On-disk form of the ledger; timestamps serialize as ISO-8601 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub current_session: NaiveDate,
    pub recent_sessions: Vec<NaiveDate>,
    pub day_trades: Vec<DayTrade>,
    pub opened_this_session: HashMap<String, OpenLot>,
    pub blocked: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, n).unwrap()
    }

    #[test]
    fn same_session_round_trip_is_a_day_trade() {
        let mut ledger = PdtLedger::new(day(2));
        ledger.record_open("AAPL", TradeSide::Buy, Utc::now());
        assert!(ledger.would_be_day_trade("AAPL", TradeSide::Sell));
        assert!(!ledger.would_be_day_trade("AAPL", TradeSide::Buy));

        ledger.record_close("AAPL", Utc::now());
        assert_eq!(ledger.day_trade_count(), 1);
        assert!(!ledger.would_be_day_trade("AAPL", TradeSide::Sell));
    }

    #[test]
    fn short_entry_closes_with_buy() {
        let mut ledger = PdtLedger::new(day(2));
        ledger.record_open("TSLA", TradeSide::Sell, Utc::now());
        assert!(ledger.would_be_day_trade("TSLA", TradeSide::Buy));
        assert!(!ledger.would_be_day_trade("TSLA", TradeSide::Sell));
    }

    #[test]
    fn position_from_prior_session_is_not_a_day_trade() {
        let mut ledger = PdtLedger::new(day(2));
        ledger.record_open("MSFT", TradeSide::Buy, Utc::now());
        ledger.roll_to_session(day(3));
        assert!(!ledger.would_be_day_trade("MSFT", TradeSide::Sell));
        ledger.record_close("MSFT", Utc::now());
        assert_eq!(ledger.day_trade_count(), 0);
    }

    #[test]
    fn gate_blocks_fourth_day_trade_under_threshold() {
        let mut ledger = PdtLedger::new(day(2));
        for symbol in ["A", "B", "C"] {
            ledger.record_open(symbol, TradeSide::Buy, Utc::now());
            ledger.record_close(symbol, Utc::now());
        }
        assert_eq!(ledger.day_trade_count(), 3);

        // Same-session open in SYMBOL_Y; a sell would be day trade #4.
        ledger.record_open("SYMBOL_Y", TradeSide::Buy, Utc::now());
        assert_eq!(
            ledger.check_order(8_000.0, "SYMBOL_Y", TradeSide::Sell),
            PdtDecision::WouldViolate
        );
        // Above the equity threshold the same order is fine.
        assert_eq!(
            ledger.check_order(30_000.0, "SYMBOL_Y", TradeSide::Sell),
            PdtDecision::Allowed
        );
        // Closing a position not opened today is fine too.
        assert_eq!(
            ledger.check_order(8_000.0, "OTHER", TradeSide::Sell),
            PdtDecision::Allowed
        );
    }

    #[test]
    fn rolling_window_expires_old_day_trades() {
        let mut ledger = PdtLedger::new(day(2));
        ledger.record_open("A", TradeSide::Buy, Utc::now());
        ledger.record_close("A", Utc::now());
        assert_eq!(ledger.day_trade_count(), 1);

        // Five further sessions push day 2 out of the window.
        for d in [3, 4, 5, 6, 9] {
            ledger.roll_to_session(day(d));
        }
        assert_eq!(ledger.day_trade_count(), 0);
    }

    #[test]
    fn blocks_clear_on_rollover() {
        let mut ledger = PdtLedger::new(day(2));
        ledger.block("GME");
        assert!(ledger.is_blocked("GME"));
        ledger.roll_to_session(day(3));
        assert!(!ledger.is_blocked("GME"));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut ledger = PdtLedger::new(day(2));
        ledger.record_open("AAPL", TradeSide::Buy, Utc::now());
        ledger.record_close("AAPL", Utc::now());
        ledger.record_open("NVDA", TradeSide::Buy, Utc::now());
        ledger.block("GME");

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let restored = PdtLedger::from_snapshot(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.day_trade_count(), 1);
        assert!(restored.would_be_day_trade("NVDA", TradeSide::Sell));
        assert!(restored.is_blocked("GME"));
        assert_eq!(restored.current_session(), day(2));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

/// Account snapshot. Alpaca sends monetary fields as strings; the typed
/// accessors parse defensively so a malformed field reads as zero, never a
/// crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub equity: String,
    #[serde(default)]
    pub last_equity: String,
    #[serde(default)]
    pub cash: String,
    #[serde(default)]
    pub buying_power: String,
    #[serde(default)]
    pub daytrade_count: i32,
    #[serde(default)]
    pub pattern_day_trader: bool,
    #[serde(default)]
    pub trading_blocked: bool,
    #[serde(default)]
    pub account_blocked: bool,
}

impl Account {
    pub fn equity_f64(&self) -> f64 {
        parse_f64(&self.equity)
    }
    pub fn last_equity_f64(&self) -> f64 {
        parse_f64(&self.last_equity)
    }
    pub fn cash_f64(&self) -> f64 {
        parse_f64(&self.cash)
    }
    pub fn buying_power_f64(&self) -> f64 {
        parse_f64(&self.buying_power)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub avg_entry_price: String,
    #[serde(default)]
    pub current_price: String,
    #[serde(default)]
    pub market_value: String,
    #[serde(default)]
    pub cost_basis: String,
    #[serde(default)]
    pub unrealized_pl: String,
    #[serde(default)]
    pub unrealized_plpc: String,
}

impl Position {
    /// Signed quantity: long positive, short negative.
    pub fn qty_f64(&self) -> f64 {
        parse_f64(&self.qty)
    }
    pub fn is_long(&self) -> bool {
        self.qty_f64() > 0.0
    }
    pub fn avg_entry_price_f64(&self) -> f64 {
        parse_f64(&self.avg_entry_price)
    }
    pub fn current_price_f64(&self) -> f64 {
        parse_f64(&self.current_price)
    }
    pub fn market_value_f64(&self) -> f64 {
        parse_f64(&self.market_value)
    }
    pub fn unrealized_pl_f64(&self) -> f64 {
        parse_f64(&self.unrealized_pl)
    }
    pub fn unrealized_plpc_f64(&self) -> f64 {
        parse_f64(&self.unrealized_plpc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

/// Protective take-profit leg of a bracket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitSpec {
    pub limit_price: String,
}

/// Protective stop-loss leg of a bracket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossSpec {
    pub stop_price: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<TakeProfitSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<StopLossSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub extended_hours: bool,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, qty: i64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty: qty.to_string(),
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            order_class: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
            extended_hours: false,
        }
    }

    pub fn limit(symbol: impl Into<String>, qty: i64, side: OrderSide, limit_price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(format!("{:.2}", limit_price)),
            ..Self::market(symbol, qty, side)
        }
    }

    /// Opposite-side protective stop for an existing position.
    pub fn protective_stop(
        symbol: impl Into<String>,
        qty: i64,
        side: OrderSide,
        stop_price: f64,
    ) -> Self {
        Self {
            order_type: OrderType::Stop,
            stop_price: Some(format!("{:.2}", stop_price)),
            time_in_force: TimeInForce::Gtc,
            ..Self::market(symbol, qty, side)
        }
    }

    /// Native bracket: entry plus OCO stop-loss / take-profit children.
    pub fn bracket(
        symbol: impl Into<String>,
        qty: i64,
        side: OrderSide,
        stop_price: f64,
        target_price: f64,
    ) -> Self {
        Self {
            order_class: Some("bracket".to_string()),
            stop_loss: Some(StopLossSpec {
                stop_price: format!("{:.2}", stop_price),
            }),
            take_profit: Some(TakeProfitSpec {
                limit_price: format!("{:.2}", target_price),
            }),
            ..Self::market(symbol, qty, side)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub symbol: String,
    #[serde(default)]
    pub qty: Option<String>,
    #[serde(default)]
    pub filled_qty: Option<String>,
    #[serde(default)]
    pub filled_avg_price: Option<String>,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub order_class: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub time_in_force: String,
    #[serde(default)]
    pub limit_price: Option<String>,
    #[serde(default)]
    pub stop_price: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canceled_at: Option<DateTime<Utc>>,
    /// Bracket children ride along on the parent in Alpaca's nested format.
    #[serde(default)]
    pub legs: Option<Vec<Order>>,
}

impl Order {
    pub fn qty_f64(&self) -> f64 {
        self.qty.as_deref().map(parse_f64).unwrap_or(0.0)
    }
    pub fn filled_qty_f64(&self) -> f64 {
        self.filled_qty.as_deref().map(parse_f64).unwrap_or(0.0)
    }
    pub fn filled_avg_price_f64(&self) -> Option<f64> {
        self.filled_avg_price.as_deref().map(parse_f64)
    }

    /// Terminal statuses are absorbing: no further transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "filled" | "canceled" | "expired" | "rejected" | "done_for_day"
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status.as_str(),
            "new" | "accepted" | "pending_new" | "partially_filled" | "accepted_for_bidding"
        )
    }
}

/// Latest quote in Alpaca's terse wire format. Every field defaults: a
/// missing `ap` is zero, not a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    #[serde(rename = "bp", default)]
    pub bid_price: f64,
    #[serde(rename = "bs", default)]
    pub bid_size: f64,
    #[serde(rename = "ap", default)]
    pub ask_price: f64,
    #[serde(rename = "as", default)]
    pub ask_size: f64,
    #[serde(rename = "t", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        if self.bid_price > 0.0 && self.ask_price > 0.0 {
            (self.bid_price + self.ask_price) / 2.0
        } else {
            self.ask_price.max(self.bid_price)
        }
    }

    /// Bid-ask spread as a percent of the mid price; zero when unpriceable.
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 || self.ask_price <= 0.0 || self.bid_price <= 0.0 {
            return 0.0;
        }
        (self.ask_price - self.bid_price) / mid * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o", default)]
    pub open: f64,
    #[serde(rename = "h", default)]
    pub high: f64,
    #[serde(rename = "l", default)]
    pub low: f64,
    #[serde(rename = "c", default)]
    pub close: f64,
    #[serde(rename = "v", default)]
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverKind {
    Gainers,
    Losers,
}

/// One row from the movers screener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMover {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub change: f64,
    #[serde(default)]
    pub percent_change: f64,
}

/// One row from the most-actives screener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveStock {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub trade_count: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_defaults_missing_fields_to_zero() {
        let quote: Quote = serde_json::from_str(r#"{"bp": 99.5}"#).unwrap();
        assert_eq!(quote.bid_price, 99.5);
        assert_eq!(quote.ask_price, 0.0);
        assert!(quote.timestamp.is_none());
    }

    #[test]
    fn quote_spread_pct() {
        let quote = Quote {
            bid_price: 99.95,
            bid_size: 100.0,
            ask_price: 100.05,
            ask_size: 100.0,
            timestamp: None,
        };
        assert!((quote.spread_pct() - 0.1).abs() < 1e-9);
        assert!((quote.mid() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn account_parses_string_money_fields() {
        let account: Account = serde_json::from_str(
            r#"{"id":"a1","status":"ACTIVE","equity":"10000.50","cash":"4000","buying_power":"8000","last_equity":"10100","daytrade_count":2,"pattern_day_trader":false}"#,
        )
        .unwrap();
        assert!((account.equity_f64() - 10000.50).abs() < 1e-9);
        assert_eq!(account.daytrade_count, 2);
    }

    #[test]
    fn order_terminal_states_absorb() {
        let mut order: Order = serde_json::from_str(
            r#"{"id":"o1","symbol":"AAPL","status":"partially_filled","qty":"10","filled_qty":"4"}"#,
        )
        .unwrap();
        assert!(order.is_open());
        assert!(!order.is_terminal());
        assert!(order.filled_qty_f64() <= order.qty_f64());

        order.status = "filled".to_string();
        assert!(order.is_terminal());
        order.status = "canceled".to_string();
        assert!(order.is_terminal());
    }

    #[test]
    fn bracket_request_serializes_nested_legs() {
        let req = OrderRequest::bracket("AAPL", 5, OrderSide::Buy, 176.0, 188.0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["order_class"], "bracket");
        assert_eq!(json["stop_loss"]["stop_price"], "176.00");
        assert_eq!(json["take_profit"]["limit_price"], "188.00");
        assert_eq!(json["type"], "market");
        // extended_hours is elided when false
        assert!(json.get("extended_hours").is_none());
    }

    #[test]
    fn protective_stop_is_gtc() {
        let req = OrderRequest::protective_stop("SYMZ", 10, OrderSide::Sell, 48.5);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["time_in_force"], "gtc");
        assert_eq!(json["stop_price"], "48.50");
    }
}

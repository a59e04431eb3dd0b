use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use broker_gateway::{
    ApiResponse, BrokerGateway, ErrorKind, Order, OrderRequest, OrderSide, Position,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::alerts::Notifier;

/// Quantity slack allowed between a position and its protective orders
/// before we call the coverage wrong (partial fills land here briefly).
const QTY_TOLERANCE: f64 = 1.0;

const EMERGENCY_ROUNDS: u32 = 3;
const EMERGENCY_BACKOFF_BASE_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionStatus {
    /// At least one opposite-side protective order covers the quantity.
    Protected,
    /// No protective order at all.
    Naked,
    /// More than one stop competing for the same shares.
    Conflicting { stop_order_ids: Vec<String> },
    /// Protection exists but covers the wrong quantity.
    WrongQty { covered: f64, required: f64 },
}

/// The side a protective order must have: sell for longs, buy for shorts.
pub fn required_protective_side(position_qty: f64) -> OrderSide {
    if position_qty > 0.0 {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn is_protective(order: &Order, side: OrderSide) -> bool {
    order.is_open() && order.side == side.as_str()
}

fn is_stop(order: &Order) -> bool {
    order.stop_price.is_some() || order.order_type.contains("stop")
}

/// Classify a position against the open-order book.
pub fn protection_status(position: &Position, open_orders: &[Order]) -> ProtectionStatus {
    let required_qty = position.qty_f64().abs();
    let side = required_protective_side(position.qty_f64());

    let protective: Vec<&Order> = open_orders
        .iter()
        .filter(|o| o.symbol == position.symbol && is_protective(o, side))
        .collect();

    if protective.is_empty() {
        return ProtectionStatus::Naked;
    }

    let stops: Vec<&Order> = protective.iter().copied().filter(|o| is_stop(o)).collect();
    if stops.len() > 1 {
        return ProtectionStatus::Conflicting {
            stop_order_ids: stops.iter().map(|o| o.id.clone()).collect(),
        };
    }

    // Unfilled remainder of a protective order still covers its full qty.
    let covered = protective
        .iter()
        .map(|o| o.qty_f64() - o.filled_qty_f64())
        .fold(0.0_f64, f64::max);
    if covered + QTY_TOLERANCE < required_qty {
        return ProtectionStatus::WrongQty {
            covered,
            required: required_qty,
        };
    }
    ProtectionStatus::Protected
}

/// Emergency stop price when no protection exists: a few percent beyond the
/// current mark, mirrored for shorts.
pub fn emergency_stop_price(position_qty: f64, current_price: f64, stop_pct: f64) -> f64 {
    if position_qty > 0.0 {
        current_price * (1.0 - stop_pct)
    } else {
        current_price * (1.0 + stop_pct)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub positions_checked: usize,
    pub already_protected: usize,
    pub remediated: usize,
    pub conflicts_resolved: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub qty: f64,
    pub side: String,
    pub orders_canceled: usize,
    pub flattened: bool,
    pub filled_qty: f64,
    pub fill_price: Option<f64>,
    pub error: Option<String>,
}

/// Structured record of one emergency liquidation pass. Serialized to JSON
/// with ISO-8601 timestamps and parseable back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub positions_attempted: usize,
    pub positions_flattened: usize,
    /// Absolute market value left un-flattened.
    pub residual_exposure: f64,
    pub outcomes: Vec<SymbolOutcome>,
}

impl ShutdownReport {
    pub fn save(&self, dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state dir {}", dir.display()))?;
        let filename = format!(
            "shutdown-report-{}.json",
            self.triggered_at.format("%Y%m%dT%H%M%SZ")
        );
        let path = dir.join(filename);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing shutdown report to {}", path.display()))?;
        Ok(path)
    }
}

/// Keeps the protection invariant: every open position has a live
/// opposite-side protective order, from startup to liquidation.
pub struct ProtectionReconciler {
    gateway: Arc<BrokerGateway>,
    notifier: Arc<Notifier>,
    emergency_stop_pct: f64,
    liquidation_concurrency: usize,
}

impl ProtectionReconciler {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        notifier: Arc<Notifier>,
        emergency_stop_pct: f64,
        liquidation_concurrency: usize,
    ) -> Self {
        Self {
            gateway,
            notifier,
            emergency_stop_pct,
            liquidation_concurrency,
        }
    }

    /// Walk every position and restore the protection invariant. Running it
    /// twice back-to-back leaves the order book unchanged.
    pub async fn audit_protections(&self) -> Result<ReconcileSummary> {
        let positions = expect_data(self.gateway.get_positions().await, "positions")?;
        let open_orders = expect_data(self.gateway.get_orders("open").await, "open orders")?;

        let mut summary = ReconcileSummary::default();
        for position in positions.iter().filter(|p| p.qty_f64() != 0.0) {
            summary.positions_checked += 1;
            match protection_status(position, &open_orders) {
                ProtectionStatus::Protected => {
                    summary.already_protected += 1;
                    tracing::debug!(
                        symbol = %position.symbol,
                        "protection present, skipping"
                    );
                }
                ProtectionStatus::Naked => {
                    if self.remediate_naked(position).await {
                        summary.remediated += 1;
                    } else {
                        summary.failures += 1;
                    }
                }
                ProtectionStatus::Conflicting { stop_order_ids } => {
                    if self
                        .resolve_conflict(position, &open_orders, stop_order_ids)
                        .await
                    {
                        summary.conflicts_resolved += 1;
                    } else {
                        summary.failures += 1;
                    }
                }
                ProtectionStatus::WrongQty { covered, required } => {
                    tracing::warn!(
                        symbol = %position.symbol,
                        covered,
                        required,
                        "protection quantity mismatch, rebuilding"
                    );
                    let stop_ids: Vec<String> = open_orders
                        .iter()
                        .filter(|o| {
                            o.symbol == position.symbol
                                && is_protective(o, required_protective_side(position.qty_f64()))
                        })
                        .map(|o| o.id.clone())
                        .collect();
                    if self.resolve_conflict(position, &open_orders, stop_ids).await {
                        summary.remediated += 1;
                    } else {
                        summary.failures += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    async fn remediate_naked(&self, position: &Position) -> bool {
        let qty = position.qty_f64();
        let current = position.current_price_f64();
        if current <= 0.0 {
            tracing::error!(symbol = %position.symbol, "cannot remediate: no current price");
            return false;
        }
        let stop_price = emergency_stop_price(qty, current, self.emergency_stop_pct);
        let request = OrderRequest::protective_stop(
            &position.symbol,
            qty.abs() as i64,
            required_protective_side(qty),
            stop_price,
        );

        let resp = self.gateway.submit_order(&request).await;
        if resp.success {
            tracing::error!(
                symbol = %position.symbol,
                qty,
                stop_price,
                alert = "unprotected_position_remediated",
                "CRITICAL: naked position found, emergency stop submitted"
            );
            self.notifier
                .send_critical(
                    "unprotected_position_remediated",
                    &format!(
                        "{}: {} shares had no protective order; emergency stop at {:.2}",
                        position.symbol, qty, stop_price
                    ),
                )
                .await;
            true
        } else {
            tracing::error!(
                symbol = %position.symbol,
                kind = %resp.error_kind,
                "failed to remediate naked position: {}",
                resp.error_text()
            );
            false
        }
    }

    /// Cancel every competing protective order, wait for terminal acks, and
    /// resubmit one correct stop. Cancels strictly precede the resubmission.
    async fn resolve_conflict(
        &self,
        position: &Position,
        open_orders: &[Order],
        order_ids: Vec<String>,
    ) -> bool {
        tracing::warn!(
            symbol = %position.symbol,
            conflicting = order_ids.len(),
            "conflicting protections, canceling and rebuilding"
        );

        // Keep the tightest surviving stop price for the rebuilt order.
        let side = required_protective_side(position.qty_f64());
        let existing_stop = open_orders
            .iter()
            .filter(|o| order_ids.contains(&o.id))
            .filter_map(|o| o.stop_price.as_deref().and_then(|p| p.parse::<f64>().ok()))
            .fold(None::<f64>, |acc, p| {
                Some(match (acc, side) {
                    (None, _) => p,
                    (Some(best), OrderSide::Sell) => best.max(p),
                    (Some(best), OrderSide::Buy) => best.min(p),
                })
            });

        for order_id in &order_ids {
            let ack = self.gateway.cancel_order(order_id).await;
            if !ack.success {
                tracing::error!(
                    symbol = %position.symbol,
                    order_id = %order_id,
                    "cancel failed during conflict resolution: {}",
                    ack.error_text()
                );
                return false;
            }
            if !self.await_terminal(order_id).await {
                return false;
            }
        }

        let qty = position.qty_f64();
        let stop_price = existing_stop.unwrap_or_else(|| {
            emergency_stop_price(qty, position.current_price_f64(), self.emergency_stop_pct)
        });
        let request =
            OrderRequest::protective_stop(&position.symbol, qty.abs() as i64, side, stop_price);
        let resp = self.gateway.submit_order(&request).await;
        if !resp.success {
            tracing::error!(
                symbol = %position.symbol,
                "failed to resubmit protection after conflict: {}",
                resp.error_text()
            );
            return false;
        }
        true
    }

    /// Poll an order until it reaches an absorbing status.
    async fn await_terminal(&self, order_id: &str) -> bool {
        for _ in 0..10 {
            let resp = self.gateway.get_order(order_id).await;
            match resp.data {
                Some(order) if resp.success => {
                    if order.is_terminal() {
                        return true;
                    }
                }
                // A canceled order can drop out of queries entirely.
                _ if resp.status_code == 404 => return true,
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tracing::error!(order_id, "order never reached terminal state");
        false
    }

    // -- Emergency stop (cancel-then-liquidate) ------------------------------

    /// Flatten every position: per symbol, cancel all open orders, wait for
    /// terminal acks, then market-flatten; `qty_held` restarts the cancel
    /// round with backoff, up to three rounds. Parallel across symbols with
    /// bounded concurrency, strictly sequential within a symbol.
    pub async fn emergency_stop(&self, reason: &str, state_dir: &Path) -> Result<ShutdownReport> {
        let started = Instant::now();
        let triggered_at = Utc::now();
        tracing::error!(reason, alert = "emergency_stop", "CRITICAL: emergency liquidation initiated");

        let positions = expect_data(self.gateway.get_positions().await, "positions")?;
        let targets: Vec<Position> =
            positions.into_iter().filter(|p| p.qty_f64() != 0.0).collect();

        let semaphore = Arc::new(Semaphore::new(self.liquidation_concurrency));
        let mut handles = Vec::new();
        for position in targets.iter().cloned() {
            let gateway = Arc::clone(&self.gateway);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                liquidate_symbol(gateway, position).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!("liquidation task panicked: {}", e),
            }
        }

        let positions_flattened = outcomes.iter().filter(|o| o.flattened).count();
        let residual_exposure = outcomes
            .iter()
            .filter(|o| !o.flattened)
            .map(|o| {
                targets
                    .iter()
                    .find(|p| p.symbol == o.symbol)
                    .map(|p| p.market_value_f64().abs())
                    .unwrap_or(0.0)
            })
            .sum();

        let report = ShutdownReport {
            reason: reason.to_string(),
            triggered_at,
            completed_at: Utc::now(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            positions_attempted: targets.len(),
            positions_flattened,
            residual_exposure,
            outcomes,
        };

        match report.save(state_dir) {
            Ok(path) => tracing::info!(path = %path.display(), "shutdown report persisted"),
            Err(e) => tracing::error!("failed to persist shutdown report: {}", e),
        }

        self.notifier
            .send_critical(
                "emergency_liquidation",
                &format!(
                    "{}: {}/{} positions flattened, residual exposure ${:.2}, {:.1}s",
                    report.reason,
                    report.positions_flattened,
                    report.positions_attempted,
                    report.residual_exposure,
                    report.elapsed_seconds
                ),
            )
            .await;

        Ok(report)
    }
}

/// One symbol's cancel → confirm → flatten sequence.
async fn liquidate_symbol(gateway: Arc<BrokerGateway>, position: Position) -> SymbolOutcome {
    let symbol = position.symbol.clone();
    let qty = position.qty_f64();
    let flatten_side = required_protective_side(qty);
    let mut outcome = SymbolOutcome {
        symbol: symbol.clone(),
        qty,
        side: flatten_side.as_str().to_string(),
        orders_canceled: 0,
        flattened: false,
        filled_qty: 0.0,
        fill_price: None,
        error: None,
    };

    for round in 0..EMERGENCY_ROUNDS {
        // 1. Enumerate and cancel everything open on this symbol.
        let canceled = gateway.cancel_all_for(&symbol).await;
        if let Some(orders) = &canceled.data {
            outcome.orders_canceled += orders.len();
            for order in orders {
                if !await_terminal_order(&gateway, &order.id).await {
                    tracing::warn!(symbol = %symbol, order_id = %order.id, "cancel ack timed out");
                }
            }
        }

        // 2. Re-check quantity; a protective fill during cancellation may
        //    have already flattened us.
        let remaining = match gateway.get_positions().await.data {
            Some(positions) => positions
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.qty_f64())
                .unwrap_or(0.0),
            None => qty,
        };
        if remaining == 0.0 {
            outcome.flattened = true;
            outcome.filled_qty = qty.abs();
            return outcome;
        }

        // 3. Market-flatten the remainder.
        let request = OrderRequest::market(&symbol, remaining.abs() as i64, flatten_side);
        let resp = gateway.submit_order_emergency(&request).await;
        if resp.success {
            if let Some(order) = resp.data {
                let (filled, price) = await_fill(&gateway, &order.id).await;
                outcome.filled_qty = filled;
                outcome.fill_price = price;
                outcome.flattened = filled + 0.5 >= remaining.abs();
                if outcome.flattened {
                    tracing::error!(
                        symbol = %symbol,
                        qty = remaining,
                        "CRITICAL: emergency liquidation executed"
                    );
                    return outcome;
                }
            }
        } else if resp.error_kind == ErrorKind::QtyHeld {
            // Shares still held by an order we have not seen yet: re-enumerate
            // and re-cancel after backoff.
            let backoff = Duration::from_secs(EMERGENCY_BACKOFF_BASE_SECS << round);
            tracing::warn!(
                symbol = %symbol,
                round = round + 1,
                backoff_secs = backoff.as_secs(),
                "quantity held by existing orders, repeating cancel round"
            );
            tokio::time::sleep(backoff).await;
            continue;
        } else {
            outcome.error = Some(format!("{}: {}", resp.error_kind, resp.error_text()));
            return outcome;
        }
    }

    outcome.error = Some(format!(
        "liquidation failed after {} rounds, manual intervention required",
        EMERGENCY_ROUNDS
    ));
    tracing::error!(symbol = %symbol, "CRITICAL: emergency liquidation exhausted all retries");
    outcome
}

async fn await_terminal_order(gateway: &BrokerGateway, order_id: &str) -> bool {
    for _ in 0..10 {
        let resp = gateway.get_order(order_id).await;
        match resp.data {
            Some(order) if resp.success => {
                if order.is_terminal() {
                    return true;
                }
            }
            _ if resp.status_code == 404 => return true,
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

async fn await_fill(gateway: &BrokerGateway, order_id: &str) -> (f64, Option<f64>) {
    for _ in 0..20 {
        let resp = gateway.get_order(order_id).await;
        if let Some(order) = resp.data.filter(|_| resp.success) {
            if order.status == "filled" {
                return (order.filled_qty_f64(), order.filled_avg_price_f64());
            }
            if order.is_terminal() {
                return (order.filled_qty_f64(), order.filled_avg_price_f64());
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    (0.0, None)
}

fn expect_data<T>(resp: ApiResponse<T>, what: &str) -> Result<T> {
    match resp.data {
        Some(data) if resp.success => Ok(data),
        _ => Err(anyhow!(
            "failed to fetch {} ({}): {}",
            what,
            resp.error_kind,
            resp.error_text()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, qty: f64, price: f64) -> Position {
        serde_json::from_value(serde_json::json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": if qty > 0.0 { "long" } else { "short" },
            "avg_entry_price": price.to_string(),
            "current_price": price.to_string(),
            "market_value": (qty * price).to_string(),
            "cost_basis": (qty * price).to_string(),
            "unrealized_pl": "0",
            "unrealized_plpc": "0"
        }))
        .unwrap()
    }

    fn order(symbol: &str, side: &str, qty: f64, stop: Option<f64>, limit: Option<f64>) -> Order {
        serde_json::from_value(serde_json::json!({
            "id": format!("{}-{}-{:?}", symbol, side, stop),
            "client_order_id": "",
            "symbol": symbol,
            "qty": qty.to_string(),
            "filled_qty": "0",
            "order_type": if stop.is_some() { "stop" } else { "limit" },
            "side": side,
            "status": "new",
            "time_in_force": "gtc",
            "stop_price": stop.map(|p| p.to_string()),
            "limit_price": limit.map(|p| p.to_string())
        }))
        .unwrap()
    }

    #[test]
    fn long_requires_sell_protection() {
        assert_eq!(required_protective_side(10.0), OrderSide::Sell);
        assert_eq!(required_protective_side(-10.0), OrderSide::Buy);
    }

    #[test]
    fn naked_position_detected() {
        let pos = position("SYMBOL_Z", 10.0, 50.0);
        assert_eq!(protection_status(&pos, &[]), ProtectionStatus::Naked);

        // A same-side order is not protection.
        let buy = order("SYMBOL_Z", "buy", 10.0, None, Some(48.0));
        assert_eq!(protection_status(&pos, &[buy]), ProtectionStatus::Naked);
    }

    #[test]
    fn single_covering_stop_is_protected() {
        let pos = position("AAPL", 5.0, 180.0);
        let stop = order("AAPL", "sell", 5.0, Some(176.0), None);
        assert_eq!(protection_status(&pos, &[stop]), ProtectionStatus::Protected);
    }

    #[test]
    fn take_profit_alone_satisfies_the_invariant() {
        let pos = position("AAPL", 5.0, 180.0);
        let tp = order("AAPL", "sell", 5.0, None, Some(188.0));
        assert_eq!(protection_status(&pos, &[tp]), ProtectionStatus::Protected);
    }

    #[test]
    fn duplicate_stops_are_conflicting() {
        let pos = position("AAPL", 5.0, 180.0);
        let orders = vec![
            order("AAPL", "sell", 5.0, Some(176.0), None),
            order("AAPL", "sell", 5.0, Some(174.0), None),
        ];
        match protection_status(&pos, &orders) {
            ProtectionStatus::Conflicting { stop_order_ids } => {
                assert_eq!(stop_order_ids.len(), 2)
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn undersized_stop_is_wrong_qty() {
        let pos = position("AAPL", 10.0, 180.0);
        let stop = order("AAPL", "sell", 5.0, Some(176.0), None);
        match protection_status(&pos, &[stop]) {
            ProtectionStatus::WrongQty { covered, required } => {
                assert_eq!(covered, 5.0);
                assert_eq!(required, 10.0);
            }
            other => panic!("expected wrong qty, got {:?}", other),
        }
    }

    #[test]
    fn partial_fill_tolerance_absorbs_one_share() {
        let pos = position("AAPL", 6.0, 180.0);
        let stop = order("AAPL", "sell", 5.0, Some(176.0), None);
        assert_eq!(protection_status(&pos, &[stop]), ProtectionStatus::Protected);
    }

    #[test]
    fn short_position_protected_by_buy_stop() {
        let pos = position("TSLA", -8.0, 250.0);
        let stop = order("TSLA", "buy", 8.0, Some(257.5), None);
        assert_eq!(protection_status(&pos, &[stop]), ProtectionStatus::Protected);
    }

    #[test]
    fn emergency_stop_price_mirrors_for_shorts() {
        assert!((emergency_stop_price(10.0, 100.0, 0.03) - 97.0).abs() < 1e-9);
        assert!((emergency_stop_price(-10.0, 100.0, 0.03) - 103.0).abs() < 1e-9);
    }

    #[test]
    fn shutdown_report_json_round_trips() {
        let report = ShutdownReport {
            reason: "circuit_breaker".to_string(),
            triggered_at: Utc::now(),
            completed_at: Utc::now(),
            elapsed_seconds: 12.5,
            positions_attempted: 3,
            positions_flattened: 3,
            residual_exposure: 0.0,
            outcomes: vec![SymbolOutcome {
                symbol: "SYMBOL_X".to_string(),
                qty: 10.0,
                side: "sell".to_string(),
                orders_canceled: 2,
                flattened: true,
                filled_qty: 10.0,
                fill_price: Some(49.12),
                error: None,
            }],
        };

        let json = serde_json::to_string(&report).unwrap();
        // ISO-8601 timestamps on the wire.
        assert!(json.contains("triggered_at"));
        let parsed: ShutdownReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.positions_attempted, 3);
        assert_eq!(parsed.outcomes[0].symbol, "SYMBOL_X");
        assert_eq!(parsed.triggered_at, report.triggered_at);
        assert_eq!(parsed.residual_exposure, 0.0);
    }
}

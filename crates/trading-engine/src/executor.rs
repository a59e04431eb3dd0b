use std::sync::Arc;
use std::time::Duration;

use broker_gateway::{
    BrokerGateway, ErrorKind, Order, OrderRequest, OrderSide, TimeInForce,
};
use thiserror::Error;

use crate::types::{ExecutionReport, TradeSignal};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{symbol}: broker rejected order under PDT rules")]
    PdtViolation { symbol: String },
    #[error("{symbol}: shares held by existing orders after cancel attempt")]
    QtyHeld { symbol: String },
    #[error("{symbol}: prior order still open, entry serialized")]
    OrderInFlight { symbol: String },
    #[error("{symbol}: order {order_id} ended {status} without filling")]
    NotFilled {
        symbol: String,
        order_id: String,
        status: String,
    },
    #[error("{symbol}: {message}")]
    Rejected { symbol: String, message: String },
    #[error("gateway failure: {0}")]
    Gateway(String),
}

/// Builds and supervises entry orders with their protective brackets.
pub struct TradeExecutor {
    gateway: Arc<BrokerGateway>,
    order_timeout_seconds: u64,
}

impl TradeExecutor {
    pub fn new(gateway: Arc<BrokerGateway>, order_timeout_seconds: u64) -> Self {
        Self {
            gateway,
            order_timeout_seconds,
        }
    }

    /// Submit an approved signal as a bracket. Regular session uses the
    /// broker's native bracket; extended hours submits a limit entry and
    /// attaches children after the fill (brackets are not accepted there).
    pub async fn execute_signal(
        &self,
        signal: &TradeSignal,
        extended_hours: bool,
    ) -> Result<ExecutionReport, ExecutionError> {
        let symbol = signal.symbol.clone();

        // One in-flight order per symbol: entries are serialized.
        let open = self.gateway.get_orders("open").await;
        let open_orders = match open.data {
            Some(orders) if open.success => orders,
            _ => return Err(ExecutionError::Gateway(open.error_text().to_string())),
        };
        if open_orders.iter().any(|o| o.symbol == symbol) {
            return Err(ExecutionError::OrderInFlight { symbol });
        }

        let request = build_entry_request(signal, extended_hours);
        let order = self.submit_entry(&symbol, &request).await?;

        let (fill_price, filled_qty) = self
            .wait_for_fill(&symbol, &order.id, signal.entry_price, signal.qty)
            .await?;

        // Native bracket legs ride along on the parent; the emulated path
        // (and any partial fill) needs children attached to the real qty.
        let native_legs = order
            .legs
            .as_ref()
            .map(|legs| !legs.is_empty())
            .unwrap_or(false);
        let protected = if native_legs && filled_qty == signal.qty {
            true
        } else {
            self.attach_children(signal, filled_qty).await
        };

        tracing::info!(
            symbol = %signal.symbol,
            side = signal.side.as_str(),
            filled_qty,
            fill_price,
            protected,
            strategy = signal.strategy.as_str(),
            "entry executed"
        );

        Ok(ExecutionReport {
            symbol: signal.symbol.clone(),
            side: signal.side,
            requested_qty: signal.qty,
            filled_qty,
            fill_price,
            parent_order_id: order.id,
            protected,
        })
    }

    async fn submit_entry(
        &self,
        symbol: &str,
        request: &OrderRequest,
    ) -> Result<Order, ExecutionError> {
        let resp = self.gateway.submit_order(request).await;
        if resp.success {
            return resp.data.ok_or_else(|| {
                ExecutionError::Gateway("order accepted but no body returned".to_string())
            });
        }

        match resp.error_kind {
            ErrorKind::PdtViolation => Err(ExecutionError::PdtViolation {
                symbol: symbol.to_string(),
            }),
            ErrorKind::QtyHeld => {
                // Competing orders hold the shares: cancel them and try once
                // more before escalating.
                tracing::warn!(symbol, "entry rejected with held quantity, clearing orders");
                self.gateway.cancel_all_for(symbol).await;
                let retry = self.gateway.submit_order(request).await;
                match retry.data {
                    Some(order) if retry.success => Ok(order),
                    _ => Err(ExecutionError::QtyHeld {
                        symbol: symbol.to_string(),
                    }),
                }
            }
            _ => Err(ExecutionError::Rejected {
                symbol: symbol.to_string(),
                message: resp.error_text().to_string(),
            }),
        }
    }

    /// Poll with a backoff schedule until filled or timeout. A timeout
    /// cancels the order; an accepted partial cancels the remainder and
    /// reports the filled quantity.
    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        fallback_price: f64,
        requested_qty: i64,
    ) -> Result<(f64, i64), ExecutionError> {
        let delays: &[u64] = if self.order_timeout_seconds <= 10 {
            &[2, 3, 5]
        } else if self.order_timeout_seconds <= 30 {
            &[1, 2, 4, 8, 15]
        } else {
            &[1, 2, 4, 8, 15, 15, 15]
        };

        for delay in delays {
            tokio::time::sleep(Duration::from_secs(*delay)).await;

            let resp = self.gateway.get_order(order_id).await;
            let Some(order) = resp.data.filter(|_| resp.success) else {
                continue;
            };

            match order.status.as_str() {
                "filled" => {
                    let price = order.filled_avg_price_f64().unwrap_or(fallback_price);
                    let qty = order.filled_qty_f64() as i64;
                    return Ok((price, if qty > 0 { qty } else { requested_qty }));
                }
                "partially_filled" => {
                    tracing::debug!(symbol, order_id, "partial fill, waiting for remainder");
                }
                "canceled" | "expired" | "rejected" => {
                    return Err(ExecutionError::NotFilled {
                        symbol: symbol.to_string(),
                        order_id: order_id.to_string(),
                        status: order.status,
                    });
                }
                _ => {}
            }
        }

        // Timed out: take whatever filled and cancel the rest.
        let resp = self.gateway.get_order(order_id).await;
        if let Some(order) = resp.data.filter(|_| resp.success) {
            if order.status == "filled" {
                let price = order.filled_avg_price_f64().unwrap_or(fallback_price);
                return Ok((price, order.filled_qty_f64() as i64));
            }
            if order.status == "partially_filled" && order.filled_qty_f64() > 0.0 {
                let price = order.filled_avg_price_f64().unwrap_or(fallback_price);
                let qty = order.filled_qty_f64() as i64;
                tracing::warn!(
                    symbol,
                    order_id,
                    filled = qty,
                    requested = requested_qty,
                    "accepting partial fill, canceling remainder"
                );
                let ack = self.gateway.cancel_order(order_id).await;
                if !ack.success {
                    tracing::error!(symbol, order_id, "failed to cancel partial remainder");
                }
                return Ok((price, qty));
            }
        }

        tracing::warn!(
            symbol,
            order_id,
            timeout_secs = self.order_timeout_seconds,
            "entry not filled in time, canceling"
        );
        let ack = self.gateway.cancel_order(order_id).await;
        if !ack.success {
            tracing::error!(
                symbol,
                order_id,
                "failed to cancel timed-out order, it may still fill"
            );
        }
        Err(ExecutionError::NotFilled {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            status: "timeout".to_string(),
        })
    }

    /// Emulated bracket children: a GTC stop and a GTC take-profit limit
    /// sized to the actually-filled quantity.
    async fn attach_children(&self, signal: &TradeSignal, filled_qty: i64) -> bool {
        if filled_qty <= 0 {
            return false;
        }
        let child_side = signal.side.opposite();

        let stop = OrderRequest::protective_stop(
            &signal.symbol,
            filled_qty,
            child_side,
            signal.stop_price,
        );
        let stop_ok = {
            let resp = self.gateway.submit_order(&stop).await;
            if !resp.success {
                tracing::error!(
                    symbol = %signal.symbol,
                    "failed to attach stop child: {}",
                    resp.error_text()
                );
            }
            resp.success
        };

        let mut take_profit = OrderRequest::limit(
            &signal.symbol,
            filled_qty,
            child_side,
            signal.target_price,
        );
        take_profit.time_in_force = TimeInForce::Gtc;
        let tp_ok = {
            let resp = self.gateway.submit_order(&take_profit).await;
            if !resp.success {
                tracing::error!(
                    symbol = %signal.symbol,
                    "failed to attach take-profit child: {}",
                    resp.error_text()
                );
            }
            resp.success
        };

        stop_ok && tp_ok
    }

    /// Close out a position at market after clearing its open orders. Used
    /// by the overnight rotation and aging paths.
    pub async fn flatten_position(
        &self,
        symbol: &str,
        qty: f64,
    ) -> Result<Order, ExecutionError> {
        self.gateway.cancel_all_for(symbol).await;
        let side = if qty > 0.0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let request = OrderRequest::market(symbol, qty.abs() as i64, side);
        let resp = self.gateway.submit_order(&request).await;
        match resp.data {
            Some(order) if resp.success => Ok(order),
            _ => Err(ExecutionError::Rejected {
                symbol: symbol.to_string(),
                message: resp.error_text().to_string(),
            }),
        }
    }
}

/// Entry request shape: native bracket in the regular session, buffered
/// limit (children attached post-fill) in extended hours.
pub fn build_entry_request(signal: &TradeSignal, extended_hours: bool) -> OrderRequest {
    if extended_hours {
        let buffer = match signal.side {
            OrderSide::Buy => 1.005,
            OrderSide::Sell => 0.995,
        };
        let mut request = OrderRequest::limit(
            &signal.symbol,
            signal.qty,
            signal.side,
            signal.entry_price * buffer,
        );
        request.extended_hours = true;
        request
    } else {
        OrderRequest::bracket(
            &signal.symbol,
            signal.qty,
            signal.side,
            signal.stop_price,
            signal.target_price,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyKind;
    use chrono::Utc;

    fn signal() -> TradeSignal {
        TradeSignal {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            entry_price: 180.0,
            stop_price: 176.0,
            target_price: 188.0,
            qty: 5,
            confidence: 0.7,
            strategy: StrategyKind::Momentum,
            horizon_days: 3,
            rationale: String::new(),
            volume_ratio: 2.1,
            atr: 2.0,
            sigma_20: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn regular_session_builds_native_bracket() {
        let request = build_entry_request(&signal(), false);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["order_class"], "bracket");
        assert_eq!(json["type"], "market");
        assert_eq!(json["stop_loss"]["stop_price"], "176.00");
        assert_eq!(json["take_profit"]["limit_price"], "188.00");
    }

    #[test]
    fn extended_hours_builds_buffered_limit() {
        let request = build_entry_request(&signal(), true);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "limit");
        assert_eq!(json["extended_hours"], true);
        assert!(json.get("order_class").is_none());
        // 0.5% buffer over the ask for fill probability.
        assert_eq!(json["limit_price"], "180.90");
    }

    #[test]
    fn extended_hours_sell_buffers_downward() {
        let mut s = signal();
        s.side = OrderSide::Sell;
        s.stop_price = 184.0;
        s.target_price = 172.0;
        let request = build_entry_request(&s, true);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["limit_price"], "179.10");
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use broker_gateway::{Account, BrokerGateway, Order, OrderSide, Position};
use chrono::Utc;
use market_clock::{MarketClock, Session};
use market_intel::{
    HttpOracle, IntelligenceOracle, MarketIntelligence, RegimeDetection, RegimeDetector,
};
use opportunity_funnel::{FunnelConfig, FunnelStats, Opportunity, OpportunityFunnel};
use pdt_ledger::{PdtDecision, PdtLedger, TradeSide};
use risk_engine::{
    symbol_to_sector, CircuitBreakerState, PositionRisk, RiskEngine, TradeRiskRequest,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::alerts::Notifier;
use crate::config::EngineConfig;
use crate::executor::{ExecutionError, TradeExecutor};
use crate::gap_guard::GapGuard;
use crate::metrics::EngineMetrics;
use crate::protection::ProtectionReconciler;
use crate::strategy::StrategyEvaluator;
use crate::types::TradeSignal;

const MONITOR_TICK: Duration = Duration::from_secs(10);
const AUDIT_INTERVAL: Duration = Duration::from_secs(60);
const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(5);
/// Overnight-cap enforcement window before the regular close.
const CLOSE_WINDOW_MINUTES: i64 = 15;

/// The single decision authority. Workers (funnel task, liquidation tasks)
/// perform broker I/O and return data; all state mutation happens here.
pub struct Engine {
    config: Arc<EngineConfig>,
    gateway: Arc<BrokerGateway>,
    clock: MarketClock,
    intel: MarketIntelligence,
    funnel: Arc<OpportunityFunnel>,
    evaluator: StrategyEvaluator,
    executor: TradeExecutor,
    reconciler: ProtectionReconciler,
    notifier: Arc<Notifier>,

    risk: RiskEngine,
    ledger: PdtLedger,
    guard: GapGuard,
    metrics: EngineMetrics,

    regime: RegimeDetection,
    account_cache: Option<(Instant, Account)>,
    held_symbols: HashSet<String>,
    last_session: Session,
    last_intel: Option<Instant>,
    last_scan: Option<Instant>,
    last_audit: Option<Instant>,
    funnel_task: Option<JoinHandle<Result<(Vec<Opportunity>, FunnelStats)>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let config = Arc::new(config);
        let gateway = Arc::new(BrokerGateway::new(config.gateway_config())?);

        let oracle: Option<Arc<dyn IntelligenceOracle>> = match &config.oracle_url {
            Some(url) => Some(Arc::new(HttpOracle::new(url.clone())?)),
            None => None,
        };
        let intel = MarketIntelligence::new(oracle.clone());
        let funnel = Arc::new(OpportunityFunnel::new(
            Arc::clone(&gateway),
            FunnelConfig::default(),
            oracle,
        ));
        let notifier = Arc::new(Notifier::new(config.alert_webhook_url.clone()));
        let evaluator =
            StrategyEvaluator::new(config.reward_multiple, config.ai_confidence_threshold);
        let executor = TradeExecutor::new(Arc::clone(&gateway), config.order_timeout_seconds);
        let reconciler = ProtectionReconciler::new(
            Arc::clone(&gateway),
            Arc::clone(&notifier),
            config.emergency_stop_pct,
            config.liquidation_concurrency,
        );
        let risk = RiskEngine::new(config.risk_config());

        let clock = MarketClock::new();
        let today = clock.trading_date(Utc::now());
        let ledger_path = config.state_dir.join("pdt-ledger.json");
        let mut ledger = match PdtLedger::load_snapshot(&ledger_path) {
            Ok(ledger) => {
                tracing::info!(path = %ledger_path.display(), "PDT ledger restored from snapshot");
                ledger
            }
            Err(_) => PdtLedger::new(today),
        };
        ledger.roll_to_session(today);

        let guard = GapGuard::new(config.max_overnight_days, config.max_overnight_positions);
        let metrics = EngineMetrics::new(config.metrics_log_interval_cycles);

        Ok(Self {
            regime: RegimeDetector::new().detect(&[]),
            evaluator,
            executor,
            reconciler,
            intel,
            funnel,
            notifier,
            risk,
            ledger,
            guard,
            metrics,
            clock,
            account_cache: None,
            held_symbols: HashSet::new(),
            last_session: Session::Closed,
            last_intel: None,
            last_scan: None,
            last_audit: None,
            funnel_task: None,
            gateway,
            config,
        })
    }

    pub fn gateway(&self) -> Arc<BrokerGateway> {
        Arc::clone(&self.gateway)
    }

    /// Startup: verify the gateway, reconcile protections, capture the daily
    /// risk baseline, then hand off to the loop.
    pub async fn startup(&mut self) -> Result<()> {
        let account = self.gateway.initialize().await?;
        tracing::info!(
            equity = account.equity_f64(),
            buying_power = account.buying_power_f64(),
            day_trades = account.daytrade_count,
            pattern_day_trader = account.pattern_day_trader,
            "account connected"
        );

        let summary = self.reconciler.audit_protections().await?;
        if summary.remediated > 0 || summary.conflicts_resolved > 0 {
            self.metrics.protections_remediated +=
                (summary.remediated + summary.conflicts_resolved) as u64;
        }
        tracing::info!(
            checked = summary.positions_checked,
            protected = summary.already_protected,
            remediated = summary.remediated,
            conflicts = summary.conflicts_resolved,
            "startup protection reconciliation complete"
        );

        let today = self.clock.trading_date(Utc::now());
        self.risk.begin_session(today, account.equity_f64());

        if let Some(positions) = self.gateway.get_positions().await.data {
            self.held_symbols = positions
                .iter()
                .filter(|p| p.qty_f64() != 0.0)
                .map(|p| p.symbol.clone())
                .collect();
            self.guard.update_holdings(&positions, today);
        }

        self.notifier
            .send_message(&format!(
                "**Trading engine started**\nEquity: ${:.2}\nProfile: {:?}\nPaper: {}",
                account.equity_f64(),
                self.config.risk_profile,
                self.config.paper_trading
            ))
            .await;
        Ok(())
    }

    /// Run until a shutdown signal arrives. Every branch of the loop is a
    /// cancellation point, so ctrl-c aborts rate-limited and in-flight work
    /// cleanly.
    pub async fn run(&mut self) -> Result<()> {
        self.startup().await?;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                _ = self.tick() => {}
            }
        }

        self.shutdown().await
    }

    async fn tick(&mut self) {
        tokio::time::sleep(MONITOR_TICK).await;
        if let Err(e) = self.tick_inner().await {
            tracing::error!("tick failed: {:#}", e);
        }
    }

    async fn tick_inner(&mut self) -> Result<()> {
        let now = Utc::now();
        let session = self.clock.current_session();

        if session == Session::Closed {
            if self.last_session != Session::Closed {
                self.on_market_close().await;
                self.last_session = Session::Closed;
            }
            self.clock.wait_until_next_open().await;
            return Ok(());
        }

        if session != self.last_session {
            if self.last_session == Session::Regular && session == Session::AfterHours {
                self.on_market_close().await;
            }
            self.last_session = session;
        }

        // Keep the per-session state current (new trading day rolls the
        // ledger and captures the equity baseline).
        let today = self.clock.trading_date(now);
        if self.ledger.current_session() != today {
            self.ledger.roll_to_session(today);
            self.guard.reset_session();
        }
        let account = self.account_snapshot().await?;
        self.risk.begin_session(today, account.equity_f64());

        // Circuit breaker on every tick, before anything else acts.
        match self.risk.check_circuit_breaker(account.equity_f64()) {
            CircuitBreakerState::Tripped => {
                let report = self
                    .reconciler
                    .emergency_stop("circuit_breaker", &self.config.state_dir)
                    .await?;
                tracing::error!(
                    flattened = report.positions_flattened,
                    residual = report.residual_exposure,
                    "circuit breaker liquidation complete, monitoring only"
                );
                return Ok(());
            }
            CircuitBreakerState::AlreadyHalted => {
                self.monitor_positions(session, today).await?;
                return Ok(());
            }
            CircuitBreakerState::Clear => {}
        }

        // Harvest a finished funnel cycle before starting anything new.
        if self
            .funnel_task
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(false)
        {
            let handle = self.funnel_task.take().expect("checked above");
            match handle.await {
                Ok(Ok((opportunities, _stats))) => {
                    self.process_opportunities(opportunities, session).await;
                }
                Ok(Err(e)) => tracing::warn!("funnel cycle failed: {:#}", e),
                Err(e) => tracing::error!("funnel task panicked: {}", e),
            }
            self.metrics.finish_cycle();
        }

        self.monitor_positions(session, today).await?;

        if due(&mut self.last_audit, AUDIT_INTERVAL) {
            self.audit_and_rotate(session, today).await;
        }

        if due(
            &mut self.last_intel,
            Duration::from_secs(self.config.intelligence_refresh_minutes * 60),
        ) {
            self.refresh_intelligence().await;
        }

        let trading_session = session == Session::Regular
            || (session.is_extended() && self.config.enable_extended_hours);
        let scan_interval = if session.is_extended() {
            Duration::from_secs(self.config.extended_scan_interval_minutes * 60)
        } else {
            Duration::from_secs(self.config.scan_interval_minutes * 60)
        };
        if trading_session && self.funnel_task.is_none() && due(&mut self.last_scan, scan_interval)
        {
            let funnel = Arc::clone(&self.funnel);
            let regime = self.regime.regime;
            tracing::info!(regime = regime.as_tag(), "starting funnel cycle");
            self.funnel_task = Some(tokio::spawn(async move { funnel.run(regime).await }));
        }

        Ok(())
    }

    // -- Periodic work -------------------------------------------------------

    async fn refresh_intelligence(&mut self) {
        let bars = self.gateway.get_bars("SPY", "1Day", 100).await;
        match bars.data {
            Some(bars) if bars.len() >= 2 => {
                self.regime = self.intel.assess(&bars).await;
                tracing::info!(
                    regime = self.regime.regime.as_tag(),
                    confidence = self.regime.confidence,
                    "market intelligence refreshed: {}",
                    self.regime.reasoning
                );
            }
            _ => tracing::warn!("intelligence refresh failed, keeping previous regime"),
        }
    }

    /// The 10-second monitor: positions and open orders, PDT close
    /// detection, holdings aging, and pre-market gap alerts.
    async fn monitor_positions(
        &mut self,
        session: Session,
        today: chrono::NaiveDate,
    ) -> Result<()> {
        let positions = match self.gateway.get_positions().await.data {
            Some(positions) => positions,
            None => return Ok(()),
        };

        let open_now: HashSet<String> = positions
            .iter()
            .filter(|p| p.qty_f64() != 0.0)
            .map(|p| p.symbol.clone())
            .collect();

        // A symbol that left the book closed; feed the PDT ledger.
        for symbol in self.held_symbols.difference(&open_now) {
            self.ledger.record_close(symbol, Utc::now());
        }
        self.held_symbols = open_now;
        self.guard.update_holdings(&positions, today);

        if session == Session::PreMarket {
            let prices: Vec<(String, f64)> = positions
                .iter()
                .map(|p| (p.symbol.clone(), p.current_price_f64()))
                .collect();
            for alert in self.guard.check_gaps(&prices) {
                self.metrics.gap_alerts += 1;
                tracing::warn!(
                    symbol = %alert.symbol,
                    gap_pct = alert.gap_pct,
                    severity = ?alert.severity,
                    impact = alert.position_impact,
                    "overnight gap alert"
                );
                self.notifier
                    .send_message(&format!(
                        "**Gap alert** {}: {:+.2}% vs close ({:?}), impact ${:.2}",
                        alert.symbol, alert.gap_pct, alert.severity, alert.position_impact
                    ))
                    .await;
            }
        }

        // Inside the closing window, shed positions beyond the overnight cap
        // (largest unrealized loss first).
        if session == Session::Regular {
            if let Some(minutes) = self.clock.minutes_until_regular_close(Utc::now()) {
                if minutes <= CLOSE_WINDOW_MINUTES {
                    for symbol in self.guard.overnight_excess(&positions) {
                        let qty = positions
                            .iter()
                            .find(|p| p.symbol == symbol)
                            .map(|p| p.qty_f64())
                            .unwrap_or(0.0);
                        if qty == 0.0 {
                            continue;
                        }
                        tracing::warn!(symbol = %symbol, "over overnight cap, flattening before close");
                        if let Err(e) = self.executor.flatten_position(&symbol, qty).await {
                            tracing::error!("overnight-cap flatten failed: {}", e);
                        } else {
                            self.ledger.record_close(&symbol, Utc::now());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// The 1-minute slot: protection audit plus aged-position rotation.
    async fn audit_and_rotate(&mut self, session: Session, today: chrono::NaiveDate) {
        match self.reconciler.audit_protections().await {
            Ok(summary) => {
                if summary.remediated > 0 || summary.conflicts_resolved > 0 {
                    self.metrics.protections_remediated +=
                        (summary.remediated + summary.conflicts_resolved) as u64;
                }
            }
            Err(e) => tracing::warn!("protection audit failed: {:#}", e),
        }

        // Aged positions are rotated out during the regular session.
        if session == Session::Regular {
            for symbol in self.guard.rotation_candidates(today) {
                if !self.held_symbols.contains(&symbol) {
                    continue;
                }
                let qty = match self.gateway.get_positions().await.data {
                    Some(positions) => positions
                        .iter()
                        .find(|p| p.symbol == symbol)
                        .map(|p| p.qty_f64())
                        .unwrap_or(0.0),
                    None => 0.0,
                };
                if qty == 0.0 {
                    continue;
                }
                tracing::info!(symbol = %symbol, "rotating aged position");
                match self.executor.flatten_position(&symbol, qty).await {
                    Ok(_) => self.ledger.record_close(&symbol, Utc::now()),
                    Err(e) => tracing::warn!("rotation flatten failed: {}", e),
                }
            }
        }
    }

    // -- Signal path ---------------------------------------------------------

    async fn process_opportunities(&mut self, opportunities: Vec<Opportunity>, session: Session) {
        self.metrics.opportunities_found += opportunities.len() as u64;
        if opportunities.is_empty() {
            return;
        }

        let account = match self.account_snapshot().await {
            Ok(account) => account,
            Err(e) => {
                tracing::warn!("skipping signal pass, no account snapshot: {:#}", e);
                return;
            }
        };
        let equity = account.equity_f64();

        let positions = self.gateway.get_positions().await.data.unwrap_or_default();
        let open_orders = self.gateway.get_orders("open").await.data.unwrap_or_default();
        let mut position_risks =
            build_position_risks(&positions, &open_orders, self.config.emergency_stop_pct);

        for opportunity in &opportunities {
            let symbol = opportunity.symbol.clone();
            if self.held_symbols.contains(&symbol) {
                continue;
            }
            if self.ledger.is_blocked(&symbol) {
                tracing::debug!(symbol = %symbol, "skipping PDT-blocked symbol");
                continue;
            }

            let Some(mut signal) = self.evaluator.evaluate(opportunity, &self.regime) else {
                self.metrics.signals_dropped_confidence += 1;
                continue;
            };
            self.metrics.signals_generated += 1;

            let sized = self.risk.position_size(
                equity,
                signal.entry_price,
                signal.stop_price,
                self.regime.regime,
                signal.sigma_20,
            );
            if sized.qty < 1 {
                tracing::debug!(symbol = %symbol, "position sized to zero shares");
                continue;
            }
            signal.qty = sized.qty;

            // PDT gate before any broker call.
            let trade_side = to_trade_side(signal.side);
            if self.ledger.check_order(equity, &symbol, trade_side) == PdtDecision::WouldViolate {
                // Expected under PDT rules for small accounts.
                tracing::info!(
                    symbol = %symbol,
                    day_trades = self.ledger.day_trade_count(),
                    "signal dropped: closing would be a day trade (pdt_would_violate)"
                );
                self.metrics.signals_dropped_pdt += 1;
                continue;
            }

            let request = TradeRiskRequest {
                symbol: symbol.clone(),
                entry_price: signal.entry_price,
                stop_price: signal.stop_price,
                target_price: signal.target_price,
                qty: signal.qty,
                volume_ratio: signal.volume_ratio,
                equity,
                extended_hours: session.is_extended(),
            };
            let trade_check = self.risk.check_trade(&request);
            if !trade_check.approved {
                tracing::info!(symbol = %symbol, "per-trade gate rejected: {}", trade_check.reason);
                self.metrics.signals_dropped_risk += 1;
                continue;
            }
            let portfolio_check = self.risk.check_portfolio(&request, &position_risks, equity);
            if !portfolio_check.approved {
                tracing::info!(
                    symbol = %symbol,
                    "portfolio gate rejected: {}",
                    portfolio_check.reason
                );
                self.metrics.signals_dropped_risk += 1;
                continue;
            }

            self.submit_signal(&signal, session, &mut position_risks).await;
        }
    }

    async fn submit_signal(
        &mut self,
        signal: &TradeSignal,
        session: Session,
        position_risks: &mut Vec<PositionRisk>,
    ) {
        match self
            .executor
            .execute_signal(signal, session.is_extended())
            .await
        {
            Ok(report) => {
                self.metrics.trades_executed += 1;
                self.held_symbols.insert(report.symbol.clone());
                self.ledger
                    .record_open(&report.symbol, to_trade_side(report.side), Utc::now());
                // Count the new exposure against the rest of this pass.
                position_risks.push(PositionRisk {
                    symbol: report.symbol.clone(),
                    sector: symbol_to_sector(&report.symbol),
                    market_value: report.fill_price * report.filled_qty as f64,
                    risk_amount: signal.risk_per_share() * report.filled_qty as f64,
                });
                self.notifier
                    .send_message(&format!(
                        "**{} {}** {} shares @ ${:.2}\nstop ${:.2} / target ${:.2}\n{} ({:.0}% confidence)",
                        signal.side.as_str().to_uppercase(),
                        report.symbol,
                        report.filled_qty,
                        report.fill_price,
                        signal.stop_price,
                        signal.target_price,
                        signal.rationale,
                        signal.confidence * 100.0
                    ))
                    .await;
            }
            Err(ExecutionError::PdtViolation { symbol }) => {
                tracing::warn!(
                    symbol = %symbol,
                    "broker rejected under PDT rules, blocking symbol for the session"
                );
                self.ledger.block(&symbol);
                self.metrics.signals_dropped_pdt += 1;
            }
            Err(ExecutionError::OrderInFlight { symbol }) => {
                tracing::debug!(symbol = %symbol, "entry skipped, prior order still open");
            }
            Err(e) => {
                tracing::warn!("execution failed: {}", e);
                self.metrics.trades_failed += 1;
            }
        }
    }

    // -- Session edges / shutdown -------------------------------------------

    async fn on_market_close(&mut self) {
        if let Some(positions) = self.gateway.get_positions().await.data {
            self.guard.record_session_close(&positions);
        }
        self.persist_ledger();
        self.metrics.log_summary();
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.config.liquidate_on_shutdown && !self.held_symbols.is_empty() {
            self.risk.halt();
            let report = self
                .reconciler
                .emergency_stop("operator_shutdown", &self.config.state_dir)
                .await?;
            tracing::info!(
                flattened = report.positions_flattened,
                residual = report.residual_exposure,
                "shutdown liquidation complete"
            );
        }
        self.persist_ledger();
        self.notifier
            .send_message("**Trading engine stopped** — graceful shutdown")
            .await;
        Ok(())
    }

    fn persist_ledger(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.config.state_dir) {
            tracing::warn!("cannot create state dir: {}", e);
            return;
        }
        let path = self.config.state_dir.join("pdt-ledger.json");
        if let Err(e) = self.ledger.save_snapshot(&path) {
            tracing::warn!("failed to persist PDT ledger: {:#}", e);
        }
    }

    /// Account snapshot with a short cache; every risk gate reads through
    /// this so one tick sees one consistent equity value.
    async fn account_snapshot(&mut self) -> Result<Account> {
        if let Some((at, account)) = &self.account_cache {
            if at.elapsed() < ACCOUNT_CACHE_TTL {
                return Ok(account.clone());
            }
        }
        let resp = self.gateway.get_account().await;
        match resp.data {
            Some(account) if resp.success => {
                self.account_cache = Some((Instant::now(), account.clone()));
                Ok(account)
            }
            _ => Err(anyhow!(
                "account snapshot failed ({}): {}",
                resp.error_kind,
                resp.error_text()
            )),
        }
    }
}

fn to_trade_side(side: OrderSide) -> TradeSide {
    match side {
        OrderSide::Buy => TradeSide::Buy,
        OrderSide::Sell => TradeSide::Sell,
    }
}

fn due(last: &mut Option<Instant>, interval: Duration) -> bool {
    let now = Instant::now();
    match last {
        Some(at) if now.duration_since(*at) < interval => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

/// Per-position risk contributions for the portfolio gate. The risk amount
/// comes from the live protective stop when one exists, else from the
/// emergency stop distance.
fn build_position_risks(
    positions: &[Position],
    open_orders: &[Order],
    fallback_stop_pct: f64,
) -> Vec<PositionRisk> {
    positions
        .iter()
        .filter(|p| p.qty_f64() != 0.0)
        .map(|position| {
            let qty = position.qty_f64();
            let current = position.current_price_f64();
            let protective_side = if qty > 0.0 { "sell" } else { "buy" };
            let stop_price = open_orders
                .iter()
                .filter(|o| {
                    o.symbol == position.symbol
                        && o.side == protective_side
                        && o.is_open()
                        && o.stop_price.is_some()
                })
                .filter_map(|o| o.stop_price.as_deref().and_then(|p| p.parse::<f64>().ok()))
                .next();
            let risk_per_share = match stop_price {
                Some(stop) => (current - stop).abs(),
                None => current * fallback_stop_pct,
            };
            PositionRisk {
                symbol: position.symbol.clone(),
                sector: symbol_to_sector(&position.symbol),
                market_value: position.market_value_f64(),
                risk_amount: risk_per_share * qty.abs(),
            }
        })
        .collect()
}

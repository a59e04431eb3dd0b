use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::envelope::{classify_failure, is_success_status, ApiResponse, ErrorKind};
use crate::models::*;
use crate::rate_limit::{Priority, RateLimiter};

const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_SECS: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub key_id: String,
    pub secret_key: String,
    pub paper_trading: bool,
    pub rate_limit_per_minute: usize,
    pub rate_limit_utilization: f64,
    pub emergency_reserve: usize,
    pub stale_quote_max_minutes: i64,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            secret_key: String::new(),
            paper_trading: true,
            rate_limit_per_minute: 200,
            rate_limit_utilization: 0.8,
            emergency_reserve: 10,
            stale_quote_max_minutes: 15,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    pub last_successful_request: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ConnectionHealth {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < 5
    }
}

/// Single choke point for all broker traffic: authentication, rate limits,
/// bounded retries, and uniform response classification live here and
/// nowhere else.
#[derive(Debug)]
pub struct BrokerGateway {
    http: Client,
    trading_url: String,
    data_url: String,
    limiter: RateLimiter,
    stale_quote_max: chrono::Duration,
    health: Mutex<ConnectionHealth>,
}

impl BrokerGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        if config.key_id.is_empty() || config.secret_key.is_empty() {
            return Err(anyhow!("missing broker API credentials"));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&config.key_id)
                .map_err(|_| anyhow!("API key contains invalid header characters"))?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&config.secret_key)
                .map_err(|_| anyhow!("API secret contains invalid header characters"))?,
        );

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .default_headers(headers)
            .build()?;

        let trading_url = if config.paper_trading {
            PAPER_URL.to_string()
        } else {
            LIVE_URL.to_string()
        };

        Ok(Self {
            http,
            trading_url,
            data_url: DATA_URL.to_string(),
            limiter: RateLimiter::new(
                config.rate_limit_per_minute,
                config.rate_limit_utilization,
                config.emergency_reserve,
            ),
            stale_quote_max: chrono::Duration::minutes(config.stale_quote_max_minutes),
            health: Mutex::new(ConnectionHealth::default()),
        })
    }

    /// Build from environment. Refuses to construct without credentials —
    /// this is the startup gate for the whole engine.
    pub fn from_env() -> Result<Self> {
        let key_id = std::env::var("APCA_API_KEY_ID")
            .map_err(|_| anyhow!("APCA_API_KEY_ID not set"))?;
        let secret_key = std::env::var("APCA_API_SECRET_KEY")
            .map_err(|_| anyhow!("APCA_API_SECRET_KEY not set"))?;
        Self::new(GatewayConfig {
            key_id,
            secret_key,
            ..GatewayConfig::default()
        })
    }

    pub fn is_paper(&self) -> bool {
        self.trading_url.contains("paper-api")
    }

    pub fn base_url(&self) -> &str {
        &self.trading_url
    }

    pub async fn connection_health(&self) -> ConnectionHealth {
        self.health.lock().await.clone()
    }

    pub async fn requests_in_last_minute(&self) -> usize {
        self.limiter.in_flight_last_minute().await
    }

    /// Verify credentials and connectivity with a single account fetch.
    pub async fn initialize(&self) -> Result<Account> {
        let resp = self.get_account().await;
        match resp.data {
            Some(account) if resp.success => {
                tracing::info!(base_url = %self.trading_url, "broker gateway initialized");
                Ok(account)
            }
            _ => Err(anyhow!(
                "gateway connection test failed ({}): {}",
                resp.error_kind,
                resp.error_text()
            )),
        }
    }

    // -- Account / positions / orders ---------------------------------------

    pub async fn get_account(&self) -> ApiResponse<Account> {
        let url = format!("{}/v2/account", self.trading_url);
        self.get_json(url, &[], Priority::Normal).await
    }

    pub async fn get_positions(&self) -> ApiResponse<Vec<Position>> {
        let url = format!("{}/v2/positions", self.trading_url);
        self.get_json(url, &[], Priority::Normal).await
    }

    /// Orders filtered by broker-side status (`open`, `closed`, `all`).
    /// `nested=true` pulls bracket children in with their parents.
    pub async fn get_orders(&self, status: &str) -> ApiResponse<Vec<Order>> {
        let url = format!("{}/v2/orders", self.trading_url);
        let query = [
            ("status".to_string(), status.to_string()),
            ("nested".to_string(), "true".to_string()),
            ("limit".to_string(), "500".to_string()),
        ];
        self.get_json(url, &query, Priority::Normal).await
    }

    pub async fn get_order(&self, broker_id: &str) -> ApiResponse<Order> {
        let url = format!("{}/v2/orders/{}", self.trading_url, broker_id);
        self.get_json(url, &[], Priority::Normal).await
    }

    pub async fn submit_order(&self, request: &OrderRequest) -> ApiResponse<Order> {
        self.submit_order_with_priority(request, Priority::Normal).await
    }

    /// Liquidation submissions draw from the emergency token reserve.
    pub async fn submit_order_emergency(&self, request: &OrderRequest) -> ApiResponse<Order> {
        self.submit_order_with_priority(request, Priority::Emergency).await
    }

    async fn submit_order_with_priority(
        &self,
        request: &OrderRequest,
        priority: Priority,
    ) -> ApiResponse<Order> {
        let url = format!("{}/v2/orders", self.trading_url);
        let body = match serde_json::to_value(request) {
            Ok(v) => v,
            Err(e) => {
                return ApiResponse::failure(0, ErrorKind::InvalidOrder, e.to_string(), false)
            }
        };
        let resp = self
            .send(Method::POST, url, Some(body), &[], priority)
            .await;
        if resp.success {
            tracing::info!(
                symbol = %request.symbol,
                side = request.side.as_str(),
                qty = %request.qty,
                "order submitted"
            );
        }
        decode(resp)
    }

    /// Cancellation acks with HTTP 204 and an empty body; that is success,
    /// not an error. Runs at emergency priority so a saturated rate window
    /// never blocks the protective path.
    pub async fn cancel_order(&self, broker_id: &str) -> ApiResponse<()> {
        let url = format!("{}/v2/orders/{}", self.trading_url, broker_id);
        let resp = self
            .send(Method::DELETE, url, None, &[], Priority::Emergency)
            .await;
        if resp.success {
            tracing::info!(order_id = broker_id, "order canceled");
        }
        resp.map(|_| ())
    }

    /// Cancel every open order on one symbol, returning the orders that were
    /// asked to cancel. Partial failure still reports the successes.
    pub async fn cancel_all_for(&self, symbol: &str) -> ApiResponse<Vec<Order>> {
        let open = self.get_orders("open").await;
        let Some(orders) = open.data else {
            return ApiResponse::failure(
                open.status_code,
                open.error_kind,
                open.error_text().to_string(),
                open.retryable,
            );
        };

        let mut canceled = Vec::new();
        for order in orders.into_iter().filter(|o| o.symbol == symbol) {
            let ack = self.cancel_order(&order.id).await;
            if ack.success {
                canceled.push(order);
            } else {
                tracing::warn!(
                    symbol,
                    order_id = %order.id,
                    kind = %ack.error_kind,
                    "cancel failed: {}",
                    ack.error_text()
                );
            }
        }
        ApiResponse::ok(200, canceled)
    }

    // -- Market data ---------------------------------------------------------

    /// Latest quote with freshness enforcement: quotes older than the
    /// configured bound come back as `stale_data` failures. Exactly at the
    /// bound is still fresh.
    pub async fn get_latest_quote(&self, symbol: &str) -> ApiResponse<Quote> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol);
        let resp: ApiResponse<Value> = self.send(Method::GET, url, None, &[], Priority::Normal).await;
        if !resp.success {
            return ApiResponse::failure(
                resp.status_code,
                resp.error_kind,
                resp.error_text().to_string(),
                resp.retryable,
            );
        }

        let quote_value = resp
            .data
            .as_ref()
            .and_then(|v| v.get("quote"))
            .cloned()
            .unwrap_or(Value::Null);
        let quote: Quote = match serde_json::from_value(quote_value) {
            Ok(q) => q,
            Err(e) => {
                return ApiResponse::failure(
                    resp.status_code,
                    ErrorKind::Other,
                    format!("quote decode failed for {}: {}", symbol, e),
                    false,
                )
            }
        };

        if let Some(ts) = quote.timestamp {
            if quote_is_stale(ts, Utc::now(), self.stale_quote_max) {
                let age = Utc::now() - ts;
                tracing::warn!(
                    symbol,
                    age_minutes = age.num_minutes(),
                    "stale quote rejected"
                );
                return ApiResponse::failure(
                    resp.status_code,
                    ErrorKind::StaleData,
                    format!("{} quote is {} minutes old", symbol, age.num_minutes()),
                    false,
                );
            }
        }

        ApiResponse::ok(resp.status_code, quote)
    }

    pub async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> ApiResponse<Vec<Bar>> {
        let url = format!("{}/v2/stocks/{}/bars", self.data_url, symbol);
        let query = [
            ("timeframe".to_string(), timeframe.to_string()),
            ("limit".to_string(), limit.to_string()),
            ("adjustment".to_string(), "raw".to_string()),
        ];
        let resp: ApiResponse<Value> = self
            .send(Method::GET, url, None, &query, Priority::Normal)
            .await;
        if !resp.success {
            return ApiResponse::failure(
                resp.status_code,
                resp.error_kind,
                resp.error_text().to_string(),
                resp.retryable,
            );
        }

        // The bars payload nests either under "bars" or under the symbol.
        let bars_value = resp
            .data
            .as_ref()
            .and_then(|v| v.get("bars").or_else(|| v.get(symbol)))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        match serde_json::from_value::<Vec<Bar>>(bars_value) {
            Ok(bars) => {
                warn_if_stale_bars(symbol, timeframe, &bars, Utc::now());
                ApiResponse::ok(resp.status_code, bars)
            }
            Err(e) => ApiResponse::failure(
                resp.status_code,
                ErrorKind::Other,
                format!("bars decode failed for {}: {}", symbol, e),
                false,
            ),
        }
    }

    // -- Broad-scan primitives ----------------------------------------------

    pub async fn get_market_movers(&self, kind: MoverKind, top: usize) -> ApiResponse<Vec<MarketMover>> {
        let url = format!("{}/v1beta1/screener/stocks/movers", self.data_url);
        let query = [("top".to_string(), top.to_string())];
        let resp: ApiResponse<Value> = self
            .send(Method::GET, url, None, &query, Priority::Normal)
            .await;
        if !resp.success {
            return ApiResponse::failure(
                resp.status_code,
                resp.error_kind,
                resp.error_text().to_string(),
                resp.retryable,
            );
        }
        let key = match kind {
            MoverKind::Gainers => "gainers",
            MoverKind::Losers => "losers",
        };
        let list = resp
            .data
            .as_ref()
            .and_then(|v| v.get(key))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        match serde_json::from_value::<Vec<MarketMover>>(list) {
            Ok(movers) => ApiResponse::ok(resp.status_code, movers),
            Err(e) => ApiResponse::failure(resp.status_code, ErrorKind::Other, e.to_string(), false),
        }
    }

    pub async fn get_most_active(&self, top: usize) -> ApiResponse<Vec<ActiveStock>> {
        let url = format!("{}/v1beta1/screener/stocks/most-actives", self.data_url);
        let query = [("top".to_string(), top.to_string())];
        let resp: ApiResponse<Value> = self
            .send(Method::GET, url, None, &query, Priority::Normal)
            .await;
        if !resp.success {
            return ApiResponse::failure(
                resp.status_code,
                resp.error_kind,
                resp.error_text().to_string(),
                resp.retryable,
            );
        }
        let list = resp
            .data
            .as_ref()
            .and_then(|v| v.get("most_actives"))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        match serde_json::from_value::<Vec<ActiveStock>>(list) {
            Ok(actives) => ApiResponse::ok(resp.status_code, actives),
            Err(e) => ApiResponse::failure(resp.status_code, ErrorKind::Other, e.to_string(), false),
        }
    }

    pub async fn get_news(&self, symbols: &[String], limit: usize) -> ApiResponse<Vec<NewsArticle>> {
        let url = format!("{}/v1beta1/news", self.data_url);
        let mut query = vec![
            ("limit".to_string(), limit.to_string()),
            ("sort".to_string(), "desc".to_string()),
            ("exclude_contentless".to_string(), "true".to_string()),
        ];
        if !symbols.is_empty() {
            query.push(("symbols".to_string(), symbols.join(",")));
        }
        let resp: ApiResponse<Value> = self
            .send(Method::GET, url, None, &query, Priority::Normal)
            .await;
        if !resp.success {
            return ApiResponse::failure(
                resp.status_code,
                resp.error_kind,
                resp.error_text().to_string(),
                resp.retryable,
            );
        }
        let list = resp
            .data
            .as_ref()
            .and_then(|v| v.get("news"))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        match serde_json::from_value::<Vec<NewsArticle>>(list) {
            Ok(news) => ApiResponse::ok(resp.status_code, news),
            Err(e) => ApiResponse::failure(resp.status_code, ErrorKind::Other, e.to_string(), false),
        }
    }

    // -- Core request machinery ----------------------------------------------

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        query: &[(String, String)],
        priority: Priority,
    ) -> ApiResponse<T> {
        decode(self.send(Method::GET, url, None, query, priority).await)
    }

    /// One classified round trip with bounded retries. Retries apply only to
    /// kinds the classifier marks retryable (429, 5xx, transport errors),
    /// with exponential backoff and ±25% jitter.
    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        query: &[(String, String)],
        priority: Priority,
    ) -> ApiResponse<Value> {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire(priority).await;

            let mut builder = self.http.request(method.clone(), &url);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            let outcome = match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    if is_success_status(status) {
                        // Empty bodies (204 cancels) classify as success with
                        // a null payload.
                        let value = if text.trim().is_empty() {
                            Value::Null
                        } else {
                            serde_json::from_str(&text).unwrap_or(Value::Null)
                        };
                        self.record_success().await;
                        return ApiResponse::ok(status, value);
                    }
                    let (kind, retryable) = classify_failure(status, &text);
                    ApiResponse::failure(status, kind, format!("HTTP {}: {}", status, text), retryable)
                }
                // Transport failures (timeout, connect, reset) are all
                // retryable network errors.
                Err(e) => ApiResponse::failure(0, ErrorKind::Network, e.to_string(), true),
            };

            self.record_failure().await;

            if outcome.retryable && attempt < MAX_RETRIES {
                let backoff = backoff_with_jitter(attempt);
                tracing::warn!(
                    url = %url,
                    attempt = attempt + 1,
                    kind = %outcome.error_kind,
                    backoff_ms = backoff.as_millis() as u64,
                    "retryable gateway failure, backing off"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }
            return outcome;
        }
    }

    async fn record_success(&self) {
        let mut health = self.health.lock().await;
        health.last_successful_request = Some(Utc::now());
        health.consecutive_failures = 0;
    }

    async fn record_failure(&self) {
        let mut health = self.health.lock().await;
        health.consecutive_failures += 1;
        if !health.is_healthy() {
            tracing::warn!(
                consecutive_failures = health.consecutive_failures,
                "gateway connection degraded"
            );
        }
    }
}

fn decode<T: DeserializeOwned>(resp: ApiResponse<Value>) -> ApiResponse<T> {
    if !resp.success {
        return ApiResponse::failure(
            resp.status_code,
            resp.error_kind,
            resp.error_text().to_string(),
            resp.retryable,
        );
    }
    let value = resp.data.unwrap_or(Value::Null);
    match serde_json::from_value(value) {
        Ok(data) => ApiResponse::ok(resp.status_code, data),
        Err(e) => ApiResponse::failure(
            resp.status_code,
            ErrorKind::Other,
            format!("response decode failed: {}", e),
            false,
        ),
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_SECS.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(base * jitter)
}

/// Freshness window for the latest bar of a series: daily bars may lag a
/// full session, intraday bars go stale after an hour.
pub fn stale_bar_max_age(timeframe: &str) -> chrono::Duration {
    if timeframe == "1Day" {
        chrono::Duration::hours(24)
    } else {
        chrono::Duration::hours(1)
    }
}

/// Bars past their freshness window are still returned, but with a WARNING;
/// unlike quotes, stale bars do not fail the request.
fn warn_if_stale_bars(symbol: &str, timeframe: &str, bars: &[Bar], now: DateTime<Utc>) {
    let Some(latest) = bars.last() else {
        return;
    };
    let age = now.signed_duration_since(latest.timestamp);
    if age > stale_bar_max_age(timeframe) {
        tracing::warn!(
            symbol,
            timeframe,
            age_hours = age.num_minutes() as f64 / 60.0,
            "stale bars: latest bar exceeds freshness window"
        );
    }
}

/// A quote is stale strictly past the bound: exactly at the bound it is
/// still accepted.
pub fn quote_is_stale(
    quote_ts: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> bool {
    now.signed_duration_since(quote_ts) > max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quote_exactly_at_bound_is_fresh() {
        let bound = chrono::Duration::minutes(15);
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        let at_bound = now - chrono::Duration::minutes(15);
        assert!(!quote_is_stale(at_bound, now, bound));

        let just_past = at_bound - chrono::Duration::milliseconds(1);
        assert!(quote_is_stale(just_past, now, bound));
    }

    #[test]
    fn twenty_minute_old_quote_is_stale() {
        let bound = chrono::Duration::minutes(15);
        let now = Utc::now();
        assert!(quote_is_stale(now - chrono::Duration::minutes(20), now, bound));
    }

    #[test]
    fn bar_freshness_windows_differ_by_timeframe() {
        assert_eq!(stale_bar_max_age("1Day"), chrono::Duration::hours(24));
        assert_eq!(stale_bar_max_age("5Min"), chrono::Duration::hours(1));
        assert_eq!(stale_bar_max_age("1Hour"), chrono::Duration::hours(1));
    }

    #[test]
    fn backoff_grows_and_stays_within_jitter_band() {
        for attempt in 0..3 {
            let base = BACKOFF_BASE_SECS.powi(attempt as i32);
            let d = backoff_with_jitter(attempt).as_secs_f64();
            assert!(d >= base * 0.75 - f64::EPSILON, "attempt {}: {}", attempt, d);
            assert!(d <= base * 1.25 + f64::EPSILON, "attempt {}: {}", attempt, d);
        }
    }

    #[test]
    fn missing_credentials_refuse_construction() {
        let err = BrokerGateway::new(GatewayConfig::default()).unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }

    #[test]
    fn decode_failure_keeps_envelope_semantics() {
        let raw = ApiResponse::ok(200, Value::String("not an account".to_string()));
        let typed: ApiResponse<Account> = decode(raw);
        assert!(!typed.success);
        assert_eq!(typed.error_kind, ErrorKind::Other);
    }
}

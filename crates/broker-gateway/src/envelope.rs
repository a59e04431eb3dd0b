use serde::{Deserialize, Serialize};

/// Failure categories surfaced by the gateway. Callers branch on these,
/// never on raw status codes or error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    None,
    Network,
    RateLimited,
    Auth,
    PdtViolation,
    PdtWouldViolate,
    QtyHeld,
    StaleData,
    InvalidOrder,
    CircuitBreaker,
    OracleUnavailable,
    ConfigInvalid,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Auth => "auth",
            ErrorKind::PdtViolation => "pdt_violation",
            ErrorKind::PdtWouldViolate => "pdt_would_violate",
            ErrorKind::QtyHeld => "qty_held",
            ErrorKind::StaleData => "stale_data",
            ErrorKind::InvalidOrder => "invalid_order",
            ErrorKind::CircuitBreaker => "circuit_breaker",
            ErrorKind::OracleUnavailable => "oracle_unavailable",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform response wrapper for every gateway call.
///
/// `success` is the only success indicator: a populated `data` without
/// `success == true` must never be treated as a good response.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub status_code: u16,
    pub data: Option<T>,
    pub error_kind: ErrorKind,
    pub error_message: Option<String>,
    pub retryable: bool,
}

impl<T> ApiResponse<T> {
    pub fn ok(status_code: u16, data: T) -> Self {
        Self {
            success: true,
            status_code,
            data: Some(data),
            error_kind: ErrorKind::None,
            error_message: None,
            retryable: false,
        }
    }

    pub fn failure(
        status_code: u16,
        kind: ErrorKind,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            success: false,
            status_code,
            data: None,
            error_kind: kind,
            error_message: Some(message.into()),
            retryable,
        }
    }

    /// Map the payload type, preserving envelope metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            success: self.success,
            status_code: self.status_code,
            data: self.data.map(f),
            error_kind: self.error_kind,
            error_message: self.error_message,
            retryable: self.retryable,
        }
    }

    pub fn error_text(&self) -> &str {
        self.error_message.as_deref().unwrap_or("unknown error")
    }
}

/// Alpaca error code embedded in 403 bodies when PDT rules block an order.
pub const PDT_ERROR_CODE: &str = "40310100";

/// Classify a non-2xx broker response into an error kind and retryability.
///
/// The order of checks matters: the PDT code and the held-quantity message
/// both arrive under 403/422 and must win over the generic auth bucket.
pub fn classify_failure(status: u16, body: &str) -> (ErrorKind, bool) {
    let lower = body.to_lowercase();

    if (status == 403 || status == 422) && body.contains(PDT_ERROR_CODE) {
        return (ErrorKind::PdtViolation, false);
    }
    if (status == 403 || status == 422) && lower.contains("insufficient qty available") {
        return (ErrorKind::QtyHeld, true);
    }
    match status {
        429 => (ErrorKind::RateLimited, true),
        500..=599 => (ErrorKind::Network, true),
        401 | 403 => (ErrorKind::Auth, false),
        422 => (ErrorKind::InvalidOrder, false),
        _ => (ErrorKind::Other, false),
    }
}

/// Success statuses are all of 2xx, explicitly including 201 (order created)
/// and 204 (cancellation acknowledged with an empty body).
pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

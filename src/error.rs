use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    /// The registry answered but holds no healthy instance of the service.
    ServiceNotFound(String),
    RegistryUnavailable(String),
    BreakerOpen(String),
    CallTimeout,
    CallFailure(String),
    FallbackUnreachable(String),
    Config(String),
    /// Request body larger than the configured limit (bytes).
    PayloadTooLarge(u64),
    /// The downstream request could not be read.
    BadRequest(String),
}

impl GatewayError {
    /// Status returned to the downstream caller when this error is terminal.
    ///
    /// Only request-level rejections, `NoRouteMatch` and `FallbackUnreachable`
    /// normally reach a caller; everything else is absorbed by the dispatcher
    /// and turned into a fallback.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteMatch => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::FallbackUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::CallTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short, stable label used for metrics and event records.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NoRouteMatch => "no_route_match",
            GatewayError::ServiceNotFound(_) => "service_not_found",
            GatewayError::RegistryUnavailable(_) => "registry_unavailable",
            GatewayError::BreakerOpen(_) => "breaker_open",
            GatewayError::CallTimeout => "call_timeout",
            GatewayError::CallFailure(_) => "call_failure",
            GatewayError::FallbackUnreachable(_) => "fallback_unreachable",
            GatewayError::Config(_) => "config",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::ServiceNotFound(svc) => {
                write!(f, "no healthy instance of service {}", svc)
            }
            GatewayError::RegistryUnavailable(msg) => write!(f, "registry unavailable: {}", msg),
            GatewayError::BreakerOpen(id) => write!(f, "circuit breaker {} is open", id),
            GatewayError::CallTimeout => write!(f, "backend call timed out"),
            GatewayError::CallFailure(msg) => write!(f, "backend call failed: {}", msg),
            GatewayError::FallbackUnreachable(msg) => write!(f, "fallback unreachable: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::PayloadTooLarge(limit) => {
                write!(f, "request body exceeds {} bytes", limit)
            }
            GatewayError::BadRequest(msg) => write!(f, "bad request: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

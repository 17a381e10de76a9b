use crate::error::GatewayError;
use crate::events::FallbackReason;
use bytes::Bytes;
use http::HeaderValue;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request labels for metrics and the access log.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub route_id: String,
    pub breaker_id: String,
    pub upstream_addr: String,
    pub fallback: Option<FallbackReason>,
    pub client_ip: IpAddr,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(host: String, uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            host,
            uri_path,
            method,
            route_id: String::new(),
            breaker_id: String::new(),
            upstream_addr: String::new(),
            fallback: None,
            client_ip,
            start: Instant::now(),
        }
    }

    /// Outcome label: `backend`, a fallback reason, or `error`.
    pub fn outcome(&self, status: u16) -> &'static str {
        match self.fallback {
            Some(reason) => reason.as_str(),
            None if status >= 400 && self.upstream_addr.is_empty() => "error",
            None => "backend",
        }
    }

    /// Terminal error response (unmatched route or unreachable fallback).
    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let status = err.status_code();
        self.finalize_metrics(status.as_u16());

        let body = serde_json::json!({ "error": err.to_string(), "kind": err.kind() }).to_string();
        let mut resp = hyper::Response::new(full_body(body));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_id.clone(),
            "breaker" => self.breaker_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "outcome" => self.outcome(resp_status),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_id.clone(),
            "outcome" => self.outcome(resp_status),
        )
        .record(self.start.elapsed().as_secs_f64());
    }

    /// One structured line per request at info level.
    pub fn access_log(&self, resp_status: u16) {
        let latency_ms = self.start.elapsed().as_millis();
        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            host = %self.host,
            path = %self.uri_path,
            status = resp_status,
            route = %self.route_id,
            breaker = %self.breaker_id,
            upstream = %self.upstream_addr,
            outcome = self.outcome(resp_status),
            latency_ms = %latency_ms,
            "access"
        );
    }
}

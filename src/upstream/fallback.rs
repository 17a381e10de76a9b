use crate::config::{FallbackConfig, LocalFallbackConfig};
use crate::error::GatewayError;
use crate::events::FallbackReason;
use crate::proxy::{ProxyRequest, ProxyResponse};
use http::{HeaderValue, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Header carrying the fallback reason on requests forwarded to a remote
/// fallback endpoint.
pub const FALLBACK_REASON_HEADER: &str = "x-cloudgate-fallback-reason";

/// Serves a route's fallback URI. Never guarded by a circuit breaker.
pub trait Fallback: Send + Sync + 'static {
    fn respond(
        &self,
        fallback_uri: &str,
        reason: FallbackReason,
        req: ProxyRequest,
    ) -> impl Future<Output = Result<ProxyResponse, GatewayError>> + Send;
}

#[derive(Debug, Clone)]
struct LocalResponder {
    status: StatusCode,
    content_type: HeaderValue,
    body: bytes::Bytes,
}

/// Local responders first (matched on the fallback URI's path), then plain
/// HTTP forwarding of the original method, headers and body.
pub struct FallbackClient {
    local: HashMap<String, LocalResponder>,
    base_url: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl FallbackClient {
    pub fn new(
        cfg: &FallbackConfig,
        responders: &[LocalFallbackConfig],
    ) -> Result<Self, GatewayError> {
        let mut local = HashMap::with_capacity(responders.len());
        for r in responders {
            let status = StatusCode::from_u16(r.status).map_err(|_| {
                GatewayError::Config(format!("fallback '{}': invalid status {}", r.path, r.status))
            })?;
            let content_type = HeaderValue::from_str(&r.content_type).map_err(|_| {
                GatewayError::Config(format!(
                    "fallback '{}': invalid content type '{}'",
                    r.path, r.content_type
                ))
            })?;
            local.insert(
                r.path.clone(),
                LocalResponder {
                    status,
                    content_type,
                    body: bytes::Bytes::from(r.body.clone()),
                },
            );
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("fallback http client: {}", e)))?;

        Ok(Self {
            local,
            base_url: cfg
                .base_url
                .as_deref()
                .map(|b| b.trim_end_matches('/').to_string()),
            timeout: cfg.timeout,
            client,
        })
    }

    fn remote_url(&self, fallback_uri: &str) -> Option<String> {
        if fallback_uri.starts_with("http://") || fallback_uri.starts_with("https://") {
            return Some(fallback_uri.to_string());
        }
        self.base_url
            .as_ref()
            .map(|base| format!("{}{}", base, fallback_uri))
    }

    async fn forward(
        &self,
        url: String,
        reason: FallbackReason,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let mut headers = req.headers;
        headers.remove(http::header::HOST);
        headers.remove(http::header::CONTENT_LENGTH);
        headers.insert(
            FALLBACK_REASON_HEADER,
            HeaderValue::from_static(reason.as_str()),
        );

        let resp = self
            .client
            .request(req.method, &url)
            .headers(headers)
            .body(req.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::FallbackUnreachable(format!(
                        "{} timed out after {:?}",
                        url, self.timeout
                    ))
                } else {
                    GatewayError::FallbackUnreachable(format!("{}: {}", url, e))
                }
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::FallbackUnreachable(format!("{}: {}", url, e)))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

impl Fallback for FallbackClient {
    async fn respond(
        &self,
        fallback_uri: &str,
        reason: FallbackReason,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let path = fallback_uri.split('?').next().unwrap_or(fallback_uri);
        if let Some(local) = self.local.get(path) {
            return Ok(ProxyResponse::new(local.status, local.body.clone())
                .with_header("content-type", local.content_type.clone()));
        }

        match self.remote_url(fallback_uri) {
            Some(url) => self.forward(url, reason, req).await,
            None => Err(GatewayError::FallbackUnreachable(format!(
                "no local responder for {} and no fallback.base_url configured",
                fallback_uri
            ))),
        }
    }
}

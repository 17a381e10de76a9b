use super::message::{ProxyRequest, ProxyResponse};
use crate::error::GatewayError;
use crate::events::{EventRecord, EventSink, FallbackReason, GatewayEvent};
use crate::routing::{Route, RouteTable, RouteTarget};
use crate::upstream::{Backend, CallOutcome, CircuitBreakerRegistry, Fallback};
use arc_swap::ArcSwap;
use http::HeaderValue;
use std::sync::Arc;

/// Response header naming the reason a fallback was served.
pub const FALLBACK_HEADER: &str = "x-cloudgate-fallback";

/// Outcome of one dispatch, with the labels needed for access logs.
#[derive(Debug)]
pub struct Dispatched {
    pub response: ProxyResponse,
    pub route_id: String,
    pub breaker_id: String,
    /// Base URL of the instance that was called, if a call was attempted.
    pub upstream: Option<String>,
    pub fallback: Option<FallbackReason>,
}

/// The breaker-guarded dispatch path.
///
/// Only `NoRouteMatch` and `FallbackUnreachable` escape [`Dispatcher::handle`];
/// every backend-side failure is recorded against the route's breaker and
/// answered with the route's fallback.
pub struct Dispatcher<B, F> {
    routes: Arc<ArcSwap<RouteTable>>,
    breakers: Arc<CircuitBreakerRegistry>,
    backend: B,
    fallback: F,
    events: Arc<dyn EventSink>,
}

impl<B: Backend, F: Fallback> Dispatcher<B, F> {
    pub fn new(
        routes: Arc<ArcSwap<RouteTable>>,
        breakers: Arc<CircuitBreakerRegistry>,
        backend: B,
        fallback: F,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            routes,
            breakers,
            backend,
            fallback,
            events,
        }
    }

    pub fn routes(&self) -> &Arc<ArcSwap<RouteTable>> {
        &self.routes
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn handle(&self, req: ProxyRequest) -> Result<Dispatched, GatewayError> {
        // The request runs against the table it started with, even if a reload
        // swaps in a new one meanwhile.
        let table = self.routes.load_full();
        let entry = table
            .match_path(req.path())
            .cloned()
            .ok_or(GatewayError::NoRouteMatch)?;
        let route = &entry.route;

        self.events.emit(EventRecord::now(GatewayEvent::RouteMatched {
            route_id: route.id.clone(),
            breaker_id: route.breaker_id.clone(),
            path: req.path().to_string(),
        }));

        let instance = match &entry.target {
            RouteTarget::Resolved(instance) => instance,
            RouteTarget::Unresolved { .. } => {
                return self
                    .serve_fallback(route, FallbackReason::Unresolved, req, None)
                    .await;
            }
        };

        let permit = match self.breakers.try_acquire(&route.breaker_id) {
            Ok(permit) => permit,
            Err(_) => {
                return self
                    .serve_fallback(route, FallbackReason::BreakerOpen, req, None)
                    .await;
            }
        };

        let upstream = instance.base_url();
        if permit.is_trial() {
            tracing::debug!(
                "proxy: half-open trial call, route={}, breaker={}, upstream={}",
                route.id,
                route.breaker_id,
                upstream
            );
        }
        let call_timeout = permit.call_timeout();
        let fallback_req = req.clone();

        // On expiry the call future is dropped, which abandons the in-flight
        // request; its result can never be recorded.
        let reason =
            match tokio::time::timeout(call_timeout, self.backend.send(instance, req)).await {
                Ok(Ok(resp)) if !resp.status.is_server_error() => {
                    permit.record(CallOutcome::Success);
                    return Ok(Dispatched {
                        response: resp,
                        route_id: route.id.clone(),
                        breaker_id: route.breaker_id.clone(),
                        upstream: Some(upstream),
                        fallback: None,
                    });
                }
                Ok(Ok(resp)) => {
                    permit.record(CallOutcome::Failure);
                    tracing::warn!(
                        "proxy: upstream server error, route={}, upstream={}, status={}",
                        route.id,
                        upstream,
                        resp.status.as_u16()
                    );
                    FallbackReason::CallFailure
                }
                Ok(Err(e)) => {
                    permit.record(CallOutcome::Failure);
                    tracing::warn!(
                        "proxy: upstream call failed, route={}, upstream={}, error={}",
                        route.id,
                        upstream,
                        e
                    );
                    FallbackReason::CallFailure
                }
                Err(_) => {
                    permit.record(CallOutcome::Timeout);
                    tracing::warn!(
                        "proxy: upstream call timed out, route={}, upstream={}, timeout={:?}",
                        route.id,
                        upstream,
                        call_timeout
                    );
                    FallbackReason::CallTimeout
                }
            };

        self.serve_fallback(route, reason, fallback_req, Some(upstream))
            .await
    }

    async fn serve_fallback(
        &self,
        route: &Route,
        reason: FallbackReason,
        req: ProxyRequest,
        upstream: Option<String>,
    ) -> Result<Dispatched, GatewayError> {
        let mut response = match self.fallback.respond(&route.fallback_uri, reason, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(
                    "proxy: fallback failed, route={}, fallback_uri={}, reason={}, error={}",
                    route.id,
                    route.fallback_uri,
                    reason,
                    e
                );
                return Err(e);
            }
        };
        response
            .headers
            .insert(FALLBACK_HEADER, HeaderValue::from_static(reason.as_str()));

        self.events.emit(EventRecord::now(GatewayEvent::FallbackServed {
            route_id: route.id.clone(),
            breaker_id: route.breaker_id.clone(),
            reason,
        }));

        Ok(Dispatched {
            response,
            route_id: route.id.clone(),
            breaker_id: route.breaker_id.clone(),
            upstream,
            fallback: Some(reason),
        })
    }
}

//! Structured observability events emitted by the dispatch path.
//!
//! The core never writes to a log or metrics sink directly for these; it hands
//! an [`EventRecord`] to an [`EventSink`]. [`TracingEventSink`] is the default
//! and forwards to `tracing` plus Prometheus counters.

use crate::upstream::BreakerState;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

/// Why a fallback response was served instead of the backend's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The route's service had no resolved instance.
    Unresolved,
    BreakerOpen,
    CallFailure,
    CallTimeout,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::Unresolved => "unresolved",
            FallbackReason::BreakerOpen => "breaker_open",
            FallbackReason::CallFailure => "call_failure",
            FallbackReason::CallTimeout => "call_timeout",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    RouteMatched {
        route_id: String,
        breaker_id: String,
        path: String,
    },
    BreakerTransition {
        breaker_id: String,
        from: BreakerState,
        to: BreakerState,
    },
    FallbackServed {
        route_id: String,
        breaker_id: String,
        reason: FallbackReason,
    },
    RegistryResolutionFailed {
        route_id: String,
        service: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: SystemTime,
    #[serde(flatten)]
    pub event: GatewayEvent,
}

impl EventRecord {
    pub fn now(event: GatewayEvent) -> Self {
        Self {
            at: SystemTime::now(),
            event,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Default sink: one structured tracing record per event, plus counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, record: EventRecord) {
        let at = humantime::format_rfc3339_millis(record.at);
        match record.event {
            GatewayEvent::RouteMatched {
                route_id,
                breaker_id,
                path,
            } => {
                tracing::debug!(
                    event = "route_matched",
                    %at,
                    route = %route_id,
                    breaker = %breaker_id,
                    path = %path,
                    "routing: route matched"
                );
            }
            GatewayEvent::BreakerTransition {
                breaker_id,
                from,
                to,
            } => {
                tracing::warn!(
                    event = "breaker_transition",
                    %at,
                    breaker = %breaker_id,
                    from = from.as_str(),
                    to = to.as_str(),
                    "circuit_breaker: state changed"
                );
                metrics::counter!(
                    "gateway_circuit_breaker_transitions_total",
                    "breaker" => breaker_id,
                    "to" => to.as_str(),
                )
                .increment(1);
            }
            GatewayEvent::FallbackServed {
                route_id,
                breaker_id,
                reason,
            } => {
                tracing::info!(
                    event = "fallback_served",
                    %at,
                    route = %route_id,
                    breaker = %breaker_id,
                    reason = reason.as_str(),
                    "proxy: fallback served"
                );
                metrics::counter!(
                    "gateway_fallback_served_total",
                    "route" => route_id,
                    "reason" => reason.as_str(),
                )
                .increment(1);
            }
            GatewayEvent::RegistryResolutionFailed {
                route_id,
                service,
                error,
            } => {
                tracing::warn!(
                    event = "registry_resolution_failed",
                    %at,
                    route = %route_id,
                    service = %service,
                    error = %error,
                    "discovery: route target unresolved"
                );
                metrics::counter!(
                    "gateway_registry_resolution_failures_total",
                    "service" => service,
                )
                .increment(1);
            }
        }
    }
}

/// Keeps every record in memory. Useful when embedding the dispatcher.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.records
            .lock()
            .map(|r| r.iter().map(|rec| rec.event.clone()).collect())
            .unwrap_or_default()
    }

    pub fn transitions(&self, breaker_id: &str) -> Vec<(BreakerState, BreakerState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::BreakerTransition {
                    breaker_id: id,
                    from,
                    to,
                } if id == breaker_id => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn fallbacks(&self) -> Vec<FallbackReason> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::FallbackServed { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, record: EventRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

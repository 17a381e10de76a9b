use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Call **once** at startup; a second install fails because the global
    /// recorder is already set.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed, by route and outcome"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        // circuit breaker & fallback
        describe_counter!(
            "gateway_circuit_breaker_transitions_total",
            Unit::Count,
            "Circuit breaker state transitions, by breaker and target state"
        );
        describe_counter!(
            "gateway_circuit_breaker_rejected_total",
            Unit::Count,
            "Calls denied by an open or saturated half-open breaker"
        );
        describe_counter!(
            "gateway_fallback_served_total",
            Unit::Count,
            "Fallback responses served, by route and reason"
        );

        // service discovery
        describe_counter!(
            "gateway_registry_lookups_total",
            Unit::Count,
            "Registry queries, by registry kind and result"
        );
        describe_histogram!(
            "gateway_registry_lookup_duration_seconds",
            Unit::Seconds,
            "Registry query duration"
        );
        describe_counter!(
            "gateway_registry_resolution_failures_total",
            Unit::Count,
            "Route targets that could not be resolved during a table build"
        );

        // route table
        describe_gauge!(
            "gateway_route_table_routes",
            Unit::Count,
            "Number of routes in the active route table"
        );
        describe_gauge!(
            "gateway_route_table_unresolved",
            Unit::Count,
            "Routes in the active table without a resolved instance"
        );
        describe_counter!(
            "gateway_route_refresh_total",
            Unit::Count,
            "Route table rebuilds, by trigger and result"
        );
        describe_counter!(
            "gateway_config_reloads_total",
            Unit::Count,
            "Config reload events"
        );

        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

use super::pattern::PathPattern;
use crate::config::RouteConfig;
use crate::discovery::{RegistryClient, ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use crate::events::{EventRecord, EventSink, GatewayEvent};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;

/// One configured binding. Immutable; a reload builds new ones.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: PathPattern,
    pub service: String,
    pub breaker_id: String,
    pub fallback_uri: String,
}

impl Route {
    pub fn from_config(cfg: &RouteConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            id: cfg.id.clone(),
            pattern: PathPattern::parse(&cfg.path)?,
            service: cfg.service.clone(),
            breaker_id: cfg.breaker.clone(),
            fallback_uri: cfg.fallback_uri.clone(),
        })
    }
}

/// Where a route's traffic goes for the lifetime of one table.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Resolved(ServiceInstance),
    /// Resolution failed; requests on this route go straight to the fallback.
    Unresolved { error: String },
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub route: Route,
    pub target: RouteTarget,
}

/// Admin view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub id: String,
    pub path: String,
    pub service: String,
    pub breaker: String,
    pub fallback_uri: String,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered route table. Read-only once built; a reload swaps in a new one.
///
/// Matching is longest-prefix; among equally specific patterns the earlier
/// configured route wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<Arc<RouteEntry>>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve one instance per route, concurrently. A failed resolution marks
    /// only that route `Unresolved`; the build itself fails only on an invalid
    /// pattern.
    pub async fn build<R: ServiceRegistry>(
        routes: &[RouteConfig],
        registry: &RegistryClient<R>,
        events: &dyn EventSink,
    ) -> Result<Self, GatewayError> {
        let parsed = routes
            .iter()
            .map(Route::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        let targets = join_all(parsed.iter().map(|r| registry.resolve(&r.service))).await;

        let entries = parsed
            .into_iter()
            .zip(targets)
            .map(|(route, target)| {
                let target = match target {
                    Ok(instance) => {
                        tracing::debug!(
                            "routing: resolved route, id={}, service={}, target={}",
                            route.id,
                            route.service,
                            instance.base_url()
                        );
                        RouteTarget::Resolved(instance)
                    }
                    Err(e) => {
                        events.emit(EventRecord::now(GatewayEvent::RegistryResolutionFailed {
                            route_id: route.id.clone(),
                            service: route.service.clone(),
                            error: e.to_string(),
                        }));
                        RouteTarget::Unresolved {
                            error: e.to_string(),
                        }
                    }
                };
                RouteEntry { route, target }
            })
            .collect();

        let table = Self::from_entries(entries);
        tracing::info!(
            "routing: built route table, registry={}, routes={}, unresolved={}",
            registry.registry().kind(),
            table.len(),
            table.unresolved_count()
        );
        metrics::gauge!("gateway_route_table_routes").set(table.len() as f64);
        metrics::gauge!("gateway_route_table_unresolved").set(table.unresolved_count() as f64);
        Ok(table)
    }

    pub fn from_entries(entries: Vec<RouteEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn match_path(&self, path: &str) -> Option<&Arc<RouteEntry>> {
        let mut best: Option<&Arc<RouteEntry>> = None;
        for entry in &self.entries {
            if !entry.route.pattern.matches(path) {
                continue;
            }
            // Strictly greater: ties keep the earlier route.
            let better = match best {
                Some(b) => entry.route.pattern.specificity() > b.route.pattern.specificity(),
                None => true,
            };
            if better {
                best = Some(entry);
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unresolved_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.target, RouteTarget::Unresolved { .. }))
            .count()
    }

    pub fn status(&self) -> Vec<RouteStatus> {
        self.entries
            .iter()
            .map(|e| {
                let (target, error) = match &e.target {
                    RouteTarget::Resolved(i) => (Some(i.base_url()), None),
                    RouteTarget::Unresolved { error } => (None, Some(error.clone())),
                };
                RouteStatus {
                    id: e.route.id.clone(),
                    path: e.route.pattern.to_string(),
                    service: e.route.service.clone(),
                    breaker: e.route.breaker_id.clone(),
                    fallback_uri: e.route.fallback_uri.clone(),
                    resolved: target.is_some(),
                    target,
                    error,
                }
            })
            .collect()
    }
}

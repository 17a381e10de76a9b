use crate::config::GatewayConfig;
use crate::discovery::{Registry, RegistryClient};
use crate::events::EventSink;
use crate::metrics::Metrics;
use crate::proxy::Dispatcher;
use crate::routing::RouteTable;
use crate::upstream::{BreakerPolicy, CircuitBreakerRegistry, FallbackClient, HttpBackend};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub type GatewayDispatcher = Dispatcher<HttpBackend, FallbackClient>;

/// Shared gateway state handed to the listeners and background loops.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    /// `None` when the process did not install the global recorder (tests,
    /// embedding).
    pub metrics: Option<Metrics>,
    pub dispatcher: Arc<GatewayDispatcher>,
    registry: Arc<ArcSwap<RegistryClient<Registry>>>,
    events: Arc<dyn EventSink>,
    ready: Arc<AtomicBool>,
    /// Serializes table rebuilds and reloads.
    config_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    /// Build the state with an empty route table. Call
    /// [`GatewayState::refresh_routes`] before serving traffic.
    pub fn new(
        config: GatewayConfig,
        metrics: Option<Metrics>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let registry = RegistryClient::from_config(&config.registry)?;
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            BreakerPolicy::from_config(&config),
            events.clone(),
        ));
        let backend = HttpBackend::new(&config.upstream);
        let fallback = FallbackClient::new(&config.fallback, &config.fallbacks)?;
        let routes = Arc::new(ArcSwap::from_pointee(RouteTable::empty()));

        let dispatcher = Arc::new(Dispatcher::new(
            routes,
            breakers,
            backend,
            fallback,
            events.clone(),
        ));

        info!(
            "server: state initialized, registry={}, routes={}",
            config.registry.kind.as_str(),
            config.routes.len()
        );

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            metrics,
            dispatcher,
            registry: Arc::new(ArcSwap::from_pointee(registry)),
            events,
            ready: Arc::new(AtomicBool::new(false)),
            config_mu: Arc::new(Mutex::new(())),
        })
    }

    pub fn route_table(&self) -> arc_swap::Guard<Arc<RouteTable>> {
        self.dispatcher.routes().load()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.dispatcher.breakers()
    }

    pub fn registry_kind(&self) -> &'static str {
        self.config.load().registry.kind.as_str()
    }

    /// True once the first route table has been built.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Re-resolve every route against the registry and swap the table in.
    /// Requests already in flight keep the table they started with.
    pub async fn refresh_routes(&self) -> Result<()> {
        let _guard = self.config_mu.lock().await;
        let config = self.config.load_full();
        let registry = self.registry.load_full();

        let table = RouteTable::build(&config.routes, &registry, self.events.as_ref()).await?;
        self.dispatcher.routes().store(Arc::new(table));
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Apply a new configuration: registry, breaker policy and routes.
    ///
    /// The new table is built before anything is swapped, so a reload that
    /// fails validation leaves the running state untouched. Breakers whose id
    /// is no longer referenced are dropped; the rest keep their state.
    pub async fn reload(&self, new_config: GatewayConfig) -> Result<()> {
        new_config.validate()?;

        let _guard = self.config_mu.lock().await;
        let old = self.config.load_full();

        let registry = if old.registry == new_config.registry {
            self.registry.load_full()
        } else {
            info!(
                "server: reload: registry changed, kind={}, address={}",
                new_config.registry.kind.as_str(),
                new_config.registry.address
            );
            Arc::new(RegistryClient::from_config(&new_config.registry)?)
        };

        if old.fallback != new_config.fallback
            || old.fallbacks != new_config.fallbacks
            || old.upstream != new_config.upstream
        {
            warn!("server: reload: fallback and upstream changes apply on restart");
        }

        let table = RouteTable::build(&new_config.routes, &registry, self.events.as_ref()).await?;

        let policy = BreakerPolicy::from_config(&new_config);
        let active: HashSet<String> = new_config
            .breaker_ids()
            .into_iter()
            .map(str::to_string)
            .collect();

        // Swap the table first: a request still holding the old table can only
        // recreate a dropped breaker before the prune below, never after it.
        self.registry.store(registry);
        self.dispatcher.routes().store(Arc::new(table));
        self.config.store(Arc::new(new_config));
        self.ready.store(true, Ordering::Release);

        let breakers = self.dispatcher.breakers();
        breakers.reconfigure(policy);
        breakers.retain_ids(&active);

        info!("server: config reloaded, breakers={}", active.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalFallbackConfig, RegistryKind, RouteConfig, StaticInstanceConfig};
    use crate::events::RecordingEventSink;
    use crate::upstream::BreakerState;

    fn static_config(port: u16) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.registry.kind = RegistryKind::Static;
        cfg.registry.services.insert(
            "user-service".to_string(),
            vec![StaticInstanceConfig {
                host: "127.0.0.1".to_string(),
                port,
                scheme: "http".to_string(),
                healthy: true,
            }],
        );
        cfg.routes = vec![
            RouteConfig {
                id: "users".to_string(),
                path: "/users/**".to_string(),
                service: "user-service".to_string(),
                breaker: "codedTribeCB".to_string(),
                fallback_uri: "/userServiceFallBack".to_string(),
            },
            RouteConfig {
                id: "departments".to_string(),
                path: "/departments/**".to_string(),
                service: "department-service".to_string(),
                breaker: "deptCB".to_string(),
                fallback_uri: "/departmentServiceFallBack".to_string(),
            },
        ];
        cfg.fallbacks = ["/userServiceFallBack", "/departmentServiceFallBack"]
            .into_iter()
            .map(|path| LocalFallbackConfig {
                path: path.to_string(),
                status: 503,
                body: "unavailable".to_string(),
                content_type: "text/plain; charset=utf-8".to_string(),
            })
            .collect();
        cfg
    }

    fn state(cfg: GatewayConfig) -> GatewayState {
        GatewayState::new(cfg, None, Arc::new(RecordingEventSink::new())).unwrap()
    }

    #[tokio::test]
    async fn test_not_ready_until_first_build() {
        let state = state(static_config(9001));
        assert!(!state.is_ready());
        assert!(state.route_table().is_empty());

        state.refresh_routes().await.unwrap();
        assert!(state.is_ready());
        let table = state.route_table();
        assert_eq!(table.len(), 2);
        // department-service has no static instances.
        assert_eq!(table.unresolved_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_routes_and_drops_unused_breakers() {
        let state = state(static_config(9001));
        state.refresh_routes().await.unwrap();

        state.breakers().get("deptCB");
        state.breakers().get("codedTribeCB");

        let mut next = static_config(9002);
        next.routes.retain(|r| r.id == "users");
        state.reload(next).await.unwrap();

        let table = state.route_table();
        assert_eq!(table.len(), 1);
        let entry = table.match_path("/users/7").unwrap();
        match &entry.target {
            crate::routing::RouteTarget::Resolved(i) => assert_eq!(i.port, 9002),
            other => panic!("expected resolved target, got {:?}", other),
        }

        assert_eq!(state.breakers().state("codedTribeCB"), Some(BreakerState::Closed));
        assert_eq!(state.breakers().state("deptCB"), None);
        assert_eq!(state.config.load().routes.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_breaker_is_not_recreated_after_reload() {
        let state = state(static_config(9001));
        state.refresh_routes().await.unwrap();
        state.breakers().get("deptCB");

        let mut next = static_config(9001);
        next.routes.retain(|r| r.id == "users");
        state.reload(next).await.unwrap();

        // Dispatch after the reload sees the new table, which no longer routes
        // to deptCB, so nothing brings the breaker back.
        let req = crate::proxy::ProxyRequest {
            method: http::Method::GET,
            uri: "/departments/1".parse().unwrap(),
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
        };
        let err = state.dispatcher.handle(req).await.unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
        assert_eq!(state.breakers().state("deptCB"), None);
        assert_eq!(state.breakers().snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_running_state() {
        let state = state(static_config(9001));
        state.refresh_routes().await.unwrap();

        let mut bad = static_config(9001);
        bad.routes[0].path = "users".to_string();
        assert!(state.reload(bad).await.is_err());

        assert_eq!(state.route_table().len(), 2);
        assert_eq!(state.config.load().routes[0].path, "/users/**");
    }
}

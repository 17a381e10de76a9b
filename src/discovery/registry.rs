use super::{Registry, ServiceInstance, ServiceRegistry};
use crate::config::RegistryConfig;
use crate::error::GatewayError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resolves a service name to one healthy instance.
///
/// Wraps a [`ServiceRegistry`] with a per-query timeout, an optional TTL cache
/// of the last healthy set, and a per-service round-robin cursor.
pub struct RegistryClient<R> {
    registry: R,
    query_timeout: Duration,
    cache_ttl: Duration,
    cache: DashMap<String, CachedInstances>,
    cursors: DashMap<String, AtomicUsize>,
}

struct CachedInstances {
    instances: Arc<Vec<ServiceInstance>>,
    fetched_at: Instant,
}

impl RegistryClient<Registry> {
    pub fn from_config(cfg: &RegistryConfig) -> Result<Self, GatewayError> {
        Ok(Self::new(
            Registry::from_config(cfg)?,
            cfg.query_timeout,
            cfg.cache_ttl,
        ))
    }
}

impl<R: ServiceRegistry> RegistryClient<R> {
    pub fn new(registry: R, query_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            registry,
            query_timeout,
            cache_ttl,
            cache: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Current healthy set of `service`. An empty set is a valid answer.
    pub async fn healthy_instances(
        &self,
        service: &str,
    ) -> Result<Arc<Vec<ServiceInstance>>, GatewayError> {
        if !self.cache_ttl.is_zero() {
            if let Some(hit) = self.cache.get(service) {
                if hit.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(hit.instances.clone());
                }
            }
        }

        let kind = self.registry.kind();
        let start = Instant::now();
        let result = tokio::time::timeout(self.query_timeout, self.registry.lookup(service)).await;
        metrics::histogram!("gateway_registry_lookup_duration_seconds", "registry" => kind)
            .record(start.elapsed().as_secs_f64());

        let instances = match result {
            Ok(Ok(all)) => all,
            Ok(Err(e)) => {
                metrics::counter!(
                    "gateway_registry_lookups_total",
                    "registry" => kind,
                    "result" => "error",
                )
                .increment(1);
                return Err(e);
            }
            Err(_) => {
                metrics::counter!(
                    "gateway_registry_lookups_total",
                    "registry" => kind,
                    "result" => "timeout",
                )
                .increment(1);
                return Err(GatewayError::RegistryUnavailable(format!(
                    "{}: query for {} timed out after {:?}",
                    kind, service, self.query_timeout
                )));
            }
        };
        metrics::counter!("gateway_registry_lookups_total", "registry" => kind, "result" => "ok")
            .increment(1);

        let total = instances.len();
        let healthy: Arc<Vec<ServiceInstance>> =
            Arc::new(instances.into_iter().filter(|i| i.healthy).collect());
        tracing::debug!(
            "discovery: {} lookup, service={}, instances={}, healthy={}",
            kind,
            service,
            total,
            healthy.len()
        );

        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                service.to_string(),
                CachedInstances {
                    instances: healthy.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(healthy)
    }

    /// Next healthy instance of `service`, rotating round-robin over the set.
    /// `ServiceNotFound` when the registry answered with no healthy instance.
    pub async fn resolve(&self, service: &str) -> Result<ServiceInstance, GatewayError> {
        let healthy = self.healthy_instances(service).await?;
        if healthy.is_empty() {
            return Err(GatewayError::ServiceNotFound(service.to_string()));
        }
        let idx = self.next_cursor(service) % healthy.len();
        Ok(healthy[idx].clone())
    }

    fn next_cursor(&self, service: &str) -> usize {
        // Fast path: no allocation when the cursor exists.
        if let Some(c) = self.cursors.get(service) {
            return c.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Registry whose answer can be swapped between calls.
    struct FakeRegistry {
        answer: Mutex<Result<Vec<ServiceInstance>, String>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl FakeRegistry {
        fn new(instances: Vec<ServiceInstance>) -> Self {
            Self {
                answer: Mutex::new(Ok(instances)),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn set(&self, answer: Result<Vec<ServiceInstance>, String>) {
            *self.answer.lock().unwrap() = answer;
        }
    }

    impl ServiceRegistry for FakeRegistry {
        async fn lookup(&self, _service: &str) -> Result<Vec<ServiceInstance>, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let answer = self.answer.lock().unwrap().clone();
            answer.map_err(GatewayError::RegistryUnavailable)
        }

        fn kind(&self) -> &'static str {
            "fake"
        }
    }

    fn node(port: u16, healthy: bool) -> ServiceInstance {
        ServiceInstance {
            id: format!("n{}", port),
            host: "127.0.0.1".into(),
            port,
            scheme: "http".into(),
            healthy,
        }
    }

    fn client(reg: FakeRegistry, ttl: Duration) -> RegistryClient<FakeRegistry> {
        RegistryClient::new(reg, Duration::from_millis(200), ttl)
    }

    #[tokio::test]
    async fn test_round_robin_over_healthy_set() {
        let c = client(
            FakeRegistry::new(vec![node(1, true), node(2, false), node(3, true)]),
            Duration::ZERO,
        );
        let mut ports = Vec::new();
        for _ in 0..4 {
            ports.push(c.resolve("USER-SERVICE").await.unwrap().port);
        }
        assert_eq!(ports, vec![1, 3, 1, 3]);
    }

    #[tokio::test]
    async fn test_empty_healthy_set_is_not_found() {
        let c = client(FakeRegistry::new(vec![node(1, false)]), Duration::ZERO);
        let err = c.resolve("USER-SERVICE").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceNotFound(s) if s == "USER-SERVICE"));
    }

    #[tokio::test]
    async fn test_registry_error_propagates() {
        let reg = FakeRegistry::new(vec![]);
        reg.set(Err("connection refused".into()));
        let c = client(reg, Duration::ZERO);
        let err = c.resolve("USER-SERVICE").await.unwrap_err();
        assert!(matches!(err, GatewayError::RegistryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_query_timeout_is_registry_unavailable() {
        let mut reg = FakeRegistry::new(vec![node(1, true)]);
        reg.delay = Duration::from_secs(5);
        let c = client(reg, Duration::ZERO);
        let start = Instant::now();
        let err = c.resolve("USER-SERVICE").await.unwrap_err();
        assert!(matches!(err, GatewayError::RegistryUnavailable(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_no_cache_by_default() {
        let c = client(FakeRegistry::new(vec![node(1, true)]), Duration::ZERO);
        c.resolve("USER-SERVICE").await.unwrap();
        c.registry().set(Ok(vec![node(2, true)]));
        assert_eq!(c.resolve("USER-SERVICE").await.unwrap().port, 2);
        assert_eq!(c.registry().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_ttl_bounds_staleness() {
        let c = client(
            FakeRegistry::new(vec![node(1, true)]),
            Duration::from_millis(50),
        );
        c.resolve("USER-SERVICE").await.unwrap();
        c.registry().set(Ok(vec![node(2, true)]));
        assert_eq!(c.resolve("USER-SERVICE").await.unwrap().port, 1);
        assert_eq!(c.registry().calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(c.resolve("USER-SERVICE").await.unwrap().port, 2);
        assert_eq!(c.registry().calls.load(Ordering::SeqCst), 2);
    }
}

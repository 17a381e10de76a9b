use super::duration;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Defaults applied to every breaker identifier.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-identifier overrides layered on top of `circuit_breaker`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub breakers: HashMap<String, CircuitBreakerOverride>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// In-process fallback responders, keyed by path.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub fallbacks: Vec<LocalFallbackConfig>,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Largest request body the proxy accepts; bigger requests get a 413.
    /// Bodies are buffered so a fallback can replay them.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            breakers: HashMap::new(),
            routes: Vec::new(),
            fallback: FallbackConfig::default(),
            fallbacks: Vec::new(),
            upstream: UpstreamConfig::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Consul,
    Eureka,
    Static,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Consul => "consul",
            RegistryKind::Eureka => "eureka",
            RegistryKind::Static => "static",
        }
    }
}

impl std::str::FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "consul" => Ok(RegistryKind::Consul),
            "eureka" => Ok(RegistryKind::Eureka),
            "static" => Ok(RegistryKind::Static),
            other => Err(format!("unknown registry kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,

    /// Consul agent address, or the Eureka server base (`.../eureka`).
    #[serde(default = "default_registry_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// Upper bound on a single registry query.
    #[serde(default = "default_query_timeout", with = "duration")]
    pub query_timeout: Duration,

    /// How long a healthy-instance list may be reused. Zero disables caching.
    #[serde(default, with = "duration")]
    pub cache_ttl: Duration,

    /// How often route targets are re-resolved against the registry.
    #[serde(default = "default_refresh_interval", with = "duration")]
    pub refresh_interval: Duration,

    /// Instances for `kind = "static"`, keyed by service name.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: HashMap<String, Vec<StaticInstanceConfig>>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::default(),
            address: default_registry_addr(),
            datacenter: None,
            token: None,
            query_timeout: default_query_timeout(),
            cache_ttl: Duration::ZERO,
            refresh_interval: default_refresh_interval(),
            services: HashMap::new(),
        }
    }
}

fn default_registry_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticInstanceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_true")]
    pub healthy: bool,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

/// Breaker and call-timeout policy for one breaker identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Each permitted backend call is abandoned after this long.
    #[serde(default = "default_call_timeout", with = "duration")]
    pub call_timeout: Duration,

    /// Percentage (0, 100] of failed calls in the window that opens the breaker.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Number of most recent call outcomes kept in the rolling window.
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,

    /// The failure rate is not evaluated until this many outcomes are recorded.
    #[serde(default = "default_minimum_number_of_calls")]
    pub minimum_number_of_calls: usize,

    #[serde(default = "default_open_duration", with = "duration")]
    pub open_duration: Duration,

    /// Maximum concurrent trial calls while half-open.
    #[serde(default = "default_permitted_calls_in_half_open")]
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            failure_rate_threshold: default_failure_rate_threshold(),
            sliding_window_size: default_sliding_window_size(),
            minimum_number_of_calls: default_minimum_number_of_calls(),
            open_duration: default_open_duration(),
            permitted_calls_in_half_open: default_permitted_calls_in_half_open(),
        }
    }
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_failure_rate_threshold() -> f64 {
    50.0
}

fn default_sliding_window_size() -> usize {
    10
}

fn default_minimum_number_of_calls() -> usize {
    10
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_permitted_calls_in_half_open() -> u32 {
    1
}

impl CircuitBreakerConfig {
    /// Apply a per-identifier override on top of these defaults.
    pub fn merged(&self, ov: &CircuitBreakerOverride) -> Self {
        Self {
            call_timeout: ov.call_timeout.unwrap_or(self.call_timeout),
            failure_rate_threshold: ov
                .failure_rate_threshold
                .unwrap_or(self.failure_rate_threshold),
            sliding_window_size: ov.sliding_window_size.unwrap_or(self.sliding_window_size),
            minimum_number_of_calls: ov
                .minimum_number_of_calls
                .unwrap_or(self.minimum_number_of_calls),
            open_duration: ov.open_duration.unwrap_or(self.open_duration),
            permitted_calls_in_half_open: ov
                .permitted_calls_in_half_open
                .unwrap_or(self.permitted_calls_in_half_open),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerOverride {
    #[serde(default, with = "duration::option")]
    pub call_timeout: Option<Duration>,
    #[serde(default)]
    pub failure_rate_threshold: Option<f64>,
    #[serde(default)]
    pub sliding_window_size: Option<usize>,
    #[serde(default)]
    pub minimum_number_of_calls: Option<usize>,
    #[serde(default, with = "duration::option")]
    pub open_duration: Option<Duration>,
    #[serde(default)]
    pub permitted_calls_in_half_open: Option<u32>,
}

/// One path-prefix binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Prefix pattern. `/users/**` matches `/users` and everything below it;
    /// a pattern without `**` is a plain string prefix.
    pub path: String,

    /// Registry service name, e.g. `USER-SERVICE`.
    pub service: String,

    /// Breaker identifier. Routes naming the same identifier share one breaker.
    pub breaker: String,

    pub fallback_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Base for relative fallback URIs that have no local responder.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_fallback_timeout", with = "duration")]
    pub timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: default_fallback_timeout(),
        }
    }
}

fn default_fallback_timeout() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFallbackConfig {
    pub path: String,

    #[serde(default = "default_fallback_status")]
    pub status: u16,

    #[serde(default)]
    pub body: String,

    #[serde(default = "default_fallback_content_type")]
    pub content_type: String,
}

fn default_fallback_status() -> u16 {
    503
}

fn default_fallback_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,

    /// Off by default: internal services commonly use self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            keepalive_pool: KeepalivePoolConfig::default(),
            tls_verify: false,
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_idle_timeout", with = "duration")]
    pub idle_timeout: Duration,

    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_pool_size() -> usize {
    64
}

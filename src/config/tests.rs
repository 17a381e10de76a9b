use super::types::*;
use super::GatewayConfig;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn route(id: &str, path: &str, breaker: &str) -> RouteConfig {
    RouteConfig {
        id: id.to_string(),
        path: path.to_string(),
        service: "USER-SERVICE".to_string(),
        breaker: breaker.to_string(),
        fallback_uri: "/userServiceFallBack".to_string(),
    }
}

fn local_fallback(path: &str) -> LocalFallbackConfig {
    LocalFallbackConfig {
        path: path.to_string(),
        status: 503,
        body: "unavailable".to_string(),
        content_type: "text/plain; charset=utf-8".to_string(),
    }
}

/// Config with `routes` and a local responder for their fallback.
fn with_routes(routes: Vec<RouteConfig>) -> GatewayConfig {
    GatewayConfig {
        routes,
        fallbacks: vec![local_fallback("/userServiceFallBack")],
        ..Default::default()
    }
}

#[test]
fn test_load_toml_config() {
    let cfg = GatewayConfig::load(Path::new("config.toml")).unwrap();
    assert_eq!(cfg.routes.len(), 2);
    assert_eq!(cfg.routes[0].path, "/users/**");
    assert_eq!(cfg.routes[1].service, "DEPARTMENT-SERVICE");
    assert_eq!(cfg.breaker_ids(), vec!["codedTribeCB"]);
    assert_eq!(cfg.circuit_breaker.call_timeout, Duration::from_secs(2));
    assert_eq!(cfg.fallbacks.len(), 2);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "registry": { "kind": "static", "services": {
            "USER-SERVICE": [{ "host": "127.0.0.1", "port": 9001 }]
        }},
        "circuit_breaker": { "call_timeout": "500ms", "open_duration": "1m" },
        "routes": [{
            "id": "users",
            "path": "/users/**",
            "service": "USER-SERVICE",
            "breaker": "usersCB",
            "fallback_uri": "/userServiceFallBack"
        }],
        "fallbacks": [{ "path": "/userServiceFallBack", "body": "try later" }]
    }"#;
    let tmp = std::env::temp_dir().join("cloudgate_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.registry.kind, RegistryKind::Static);
    assert_eq!(cfg.registry.services["USER-SERVICE"][0].port, 9001);
    assert_eq!(cfg.registry.services["USER-SERVICE"][0].scheme, "http");
    assert!(cfg.registry.services["USER-SERVICE"][0].healthy);
    assert_eq!(cfg.circuit_breaker.call_timeout, Duration::from_millis(500));
    assert_eq!(cfg.circuit_breaker.open_duration, Duration::from_secs(60));
    // Unspecified fields keep their defaults.
    assert_eq!(cfg.circuit_breaker.sliding_window_size, 10);
}

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(Path::new("/nonexistent/cloudgate.toml")).unwrap();
    assert!(cfg.routes.is_empty());
    assert_eq!(cfg.registry.kind, RegistryKind::Consul);
    assert_eq!(cfg.registry.cache_ttl, Duration::ZERO);
}

#[test]
fn test_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("cloudgate_test_config.yaml");
    std::fs::write(&tmp, "routes: []").unwrap();
    let result = GatewayConfig::load(&tmp);
    std::fs::remove_file(&tmp).ok();
    assert!(result.is_err());
}

#[test]
fn test_defaults() {
    let cb = CircuitBreakerConfig::default();
    assert_eq!(cb.call_timeout, Duration::from_secs(2));
    assert_eq!(cb.failure_rate_threshold, 50.0);
    assert_eq!(cb.sliding_window_size, 10);
    assert_eq!(cb.minimum_number_of_calls, 10);
    assert_eq!(cb.open_duration, Duration::from_secs(30));
    assert_eq!(cb.permitted_calls_in_half_open, 1);

    let reg = RegistryConfig::default();
    assert_eq!(reg.query_timeout, Duration::from_secs(2));
    assert_eq!(reg.refresh_interval, Duration::from_secs(30));
}

#[test]
fn test_breaker_override_merges_onto_defaults() {
    let toml_src = r#"
        [circuit_breaker]
        call_timeout = "3s"

        [breakers.slowCB]
        open_duration = "10s"
        sliding_window_size = 20
    "#;
    let cfg: GatewayConfig = toml::from_str(toml_src).unwrap();
    let slow = cfg.breaker_config("slowCB");
    assert_eq!(slow.call_timeout, Duration::from_secs(3));
    assert_eq!(slow.open_duration, Duration::from_secs(10));
    assert_eq!(slow.sliding_window_size, 20);

    let other = cfg.breaker_config("unknownCB");
    assert_eq!(other, cfg.circuit_breaker);
}

#[test]
fn test_validate_ok() {
    let cfg = with_routes(vec![
        route("users", "/users/**", "cb"),
        route("deps", "/departments/**", "cb"),
    ]);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_duplicate_id_fails() {
    let cfg = with_routes(vec![
        route("users", "/users/**", "cb"),
        route("users", "/other/**", "cb"),
    ]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_path_fails() {
    let cfg = with_routes(vec![route("a", "/users/**", "cb"), route("b", "/users/**", "cb")]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_relative_path_fails() {
    let cfg = with_routes(vec![route("a", "users/**", "cb")]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_empty_fallback_fails() {
    let mut r = route("a", "/users/**", "cb");
    r.fallback_uri.clear();
    let cfg = with_routes(vec![r]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_fallback_needs_responder() {
    let mut cfg = with_routes(vec![route("users", "/users/**", "cb")]);
    cfg.fallbacks.clear();
    let err = cfg.validate().unwrap_err().to_string();
    assert!(err.contains("/userServiceFallBack"), "{}", err);

    // A remote fallback service covers any relative path.
    cfg.fallback.base_url = Some("http://fallback.internal".to_string());
    assert!(cfg.validate().is_ok());

    // Absolute URIs need neither.
    cfg.fallback.base_url = None;
    cfg.routes[0].fallback_uri = "http://fallback.internal/users".to_string();
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_fallback_query_is_ignored_for_local_match() {
    let mut r = route("users", "/users/**", "cb");
    r.fallback_uri = "/userServiceFallBack?source=gateway".to_string();
    assert!(with_routes(vec![r]).validate().is_ok());
}

#[test]
fn test_validate_zero_body_limit_fails() {
    let mut cfg = GatewayConfig::default();
    assert_eq!(cfg.max_body_bytes, 10 * 1024 * 1024);
    cfg.max_body_bytes = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_env_overrides() {
    let env = HashMap::from([
        ("CLOUDGATE_REGISTRY_KIND", "eureka"),
        ("CLOUDGATE_REGISTRY_ADDRESS", "http://eureka:8761/eureka"),
        ("CLOUDGATE_REGISTRY_TOKEN", "secret"),
        ("CLOUDGATE_REFRESH_INTERVAL", "45s"),
        ("CLOUDGATE_FALLBACK_BASE_URL", "http://fallback:8080"),
    ]);
    let mut cfg = GatewayConfig::default();
    cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

    assert_eq!(cfg.registry.kind, RegistryKind::Eureka);
    assert_eq!(cfg.registry.address, "http://eureka:8761/eureka");
    assert_eq!(cfg.registry.token.as_deref(), Some("secret"));
    assert_eq!(cfg.registry.datacenter, None);
    assert_eq!(cfg.registry.refresh_interval, Duration::from_secs(45));
    assert_eq!(cfg.fallback.base_url.as_deref(), Some("http://fallback:8080"));
}

#[test]
fn test_invalid_env_overrides_are_ignored() {
    let env = HashMap::from([
        ("CLOUDGATE_REGISTRY_KIND", "zookeeper"),
        ("CLOUDGATE_REFRESH_INTERVAL", "soon"),
    ]);
    let mut cfg = GatewayConfig::default();
    cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

    assert_eq!(cfg.registry.kind, RegistryKind::Consul);
    assert_eq!(cfg.registry.refresh_interval, Duration::from_secs(30));
}

#[test]
fn test_validate_breaker_bounds() {
    let mut cfg = GatewayConfig::default();
    cfg.circuit_breaker.failure_rate_threshold = 0.0;
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.circuit_breaker.minimum_number_of_calls = 11;
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.breakers.insert(
        "cb".into(),
        CircuitBreakerOverride {
            permitted_calls_in_half_open: Some(0),
            ..Default::default()
        },
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_static_services_need_static_kind() {
    let mut cfg = GatewayConfig::default();
    cfg.registry.services.insert(
        "USER-SERVICE".into(),
        vec![StaticInstanceConfig {
            host: "127.0.0.1".into(),
            port: 9001,
            scheme: "http".into(),
            healthy: true,
        }],
    );
    assert!(cfg.validate().is_err());
    cfg.registry.kind = RegistryKind::Static;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_registry_kind_from_str() {
    assert_eq!("Eureka".parse::<RegistryKind>().unwrap(), RegistryKind::Eureka);
    assert!("zookeeper".parse::<RegistryKind>().is_err());
}

#[test]
fn test_duration_round_trip_is_humantime() {
    let cfg = CircuitBreakerConfig::default();
    let json = serde_json::to_value(&cfg).unwrap();
    assert_eq!(json["call_timeout"], "2s");
    assert_eq!(json["open_duration"], "30s");
}

//! Integration tests for Consul-backed route resolution.
//!
//! These tests require Docker (via testcontainers) and start a real
//! Consul agent in dev mode.
//!
//! Run with: `cargo test --test consul_integration`

use cloudgate::config::{RegistryConfig, RegistryKind, RouteConfig};
use cloudgate::discovery::{ConsulClient, RegistryClient, ServiceRegistry};
use cloudgate::error::GatewayError;
use cloudgate::events::RecordingEventSink;
use cloudgate::routing::{RouteTable, RouteTarget};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Start a Consul container in dev mode and return its HTTP base URL.
async fn start_consul() -> (String, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("hashicorp/consul", "1.19")
        .with_exposed_port(8500_u16.tcp())
        .with_env_var("CONSUL_BIND_INTERFACE", "eth0")
        .with_cmd(vec!["agent", "-dev", "-client=0.0.0.0"])
        .start()
        .await
        .expect("failed to start consul container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(8500).await.expect("get port");
    let base_url = format!("http://{}:{}", host, port);

    // Wait for a leader; the catalog rejects writes before that.
    let http = reqwest::Client::new();
    for _ in 0..30 {
        if let Ok(resp) = http.get(format!("{}/v1/status/leader", base_url)).send().await {
            if resp.status().is_success() {
                let body = resp.text().await.unwrap_or_default();
                if body.len() > 2 {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    (base_url, container)
}

#[derive(Serialize)]
struct TestServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    check: TestTTLCheck,
}

#[derive(Serialize)]
struct TestTTLCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: String,
}

/// Register an instance with a TTL check; it stays critical until `pass_ttl`.
async fn register(base_url: &str, id: &str, name: &str, port: u16) {
    let reg = TestServiceRegistration {
        id: id.to_string(),
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        meta: HashMap::from([("version".to_string(), "1.0".to_string())]),
        check: TestTTLCheck {
            check_id: id.to_string(),
            ttl: "30s".to_string(),
            deregister_after: "60s".to_string(),
        },
    };
    let resp = reqwest::Client::new()
        .put(format!("{}/v1/agent/service/register", base_url))
        .json(&reg)
        .send()
        .await
        .expect("register request");
    assert!(resp.status().is_success(), "register: {}", resp.status());
}

async fn pass_ttl(base_url: &str, check_id: &str) {
    let resp = reqwest::Client::new()
        .put(format!("{}/v1/agent/check/pass/{}", base_url, check_id))
        .send()
        .await
        .expect("pass ttl request");
    assert!(resp.status().is_success(), "pass ttl: {}", resp.status());
}

fn registry_client(base_url: &str) -> RegistryClient<ConsulClient> {
    let consul = ConsulClient::new(base_url, None, None).expect("consul client");
    RegistryClient::new(consul, Duration::from_secs(2), Duration::ZERO)
}

#[tokio::test]
async fn test_healthy_instance_resolves() {
    let (base_url, _container) = start_consul().await;

    register(&base_url, "user-1", "user-service", 8081).await;
    pass_ttl(&base_url, "user-1").await;

    let client = registry_client(&base_url);
    let instance = client.resolve("user-service").await.expect("resolve");
    assert_eq!(instance.id, "user-1");
    assert_eq!(instance.host, "127.0.0.1");
    assert_eq!(instance.port, 8081);
    assert_eq!(instance.base_url(), "http://127.0.0.1:8081");
}

#[tokio::test]
async fn test_critical_instance_is_not_resolved() {
    let (base_url, _container) = start_consul().await;

    // TTL check never passed, so the instance stays critical.
    register(&base_url, "dept-1", "department-service", 8082).await;

    let consul = ConsulClient::new(&base_url, None, None).expect("consul client");
    let all = consul.lookup("department-service").await.expect("lookup");
    assert_eq!(all.len(), 1);
    assert!(!all[0].healthy);

    let client = registry_client(&base_url);
    match client.resolve("department-service").await {
        Err(GatewayError::ServiceNotFound(s)) => assert_eq!(s, "department-service"),
        other => panic!("expected ServiceNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_round_robin_over_healthy_instances() {
    let (base_url, _container) = start_consul().await;

    for (id, port) in [("user-1", 8081), ("user-2", 8082)] {
        register(&base_url, id, "user-service", port).await;
        pass_ttl(&base_url, id).await;
    }

    let client = registry_client(&base_url);
    let a = client.resolve("user-service").await.expect("resolve a");
    let b = client.resolve("user-service").await.expect("resolve b");
    assert_ne!(a.port, b.port);
}

#[tokio::test]
async fn test_route_table_against_consul() {
    let (base_url, _container) = start_consul().await;

    register(&base_url, "user-1", "user-service", 8081).await;
    pass_ttl(&base_url, "user-1").await;

    let routes = vec![
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
            breaker: "codedTribeCB".to_string(),
            fallback_uri: "/departmentServiceFallBack".to_string(),
        },
    ];

    let registry = RegistryClient::from_config(&RegistryConfig {
        kind: RegistryKind::Consul,
        address: base_url.clone(),
        ..RegistryConfig::default()
    })
    .expect("registry client");
    let events = RecordingEventSink::new();
    let table = RouteTable::build(&routes, &registry, &events)
        .await
        .expect("build table");

    assert_eq!(table.len(), 2);
    assert_eq!(table.unresolved_count(), 1);

    let users = table.match_path("/users/42").expect("users route");
    match &users.target {
        RouteTarget::Resolved(i) => assert_eq!(i.port, 8081),
        other => panic!("expected resolved, got {:?}", other),
    }
    let depts = table.match_path("/departments/1").expect("departments route");
    assert!(matches!(depts.target, RouteTarget::Unresolved { .. }));
}

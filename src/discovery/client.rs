use super::{ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same
/// as a missing field.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Service block of a /v1/health/service entry.
#[derive(Debug, Clone, Deserialize)]
struct ConsulService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default, deserialize_with = "deserialize_null_default")]
    meta: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConsulCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ConsulNode {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address", default)]
    address: String,
}

/// A single entry from the /v1/health/service response.
#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
    #[serde(rename = "Checks", default)]
    checks: Vec<ConsulCheck>,
}

impl ConsulHealthEntry {
    fn into_instance(self) -> ServiceInstance {
        let healthy = self.checks.iter().all(|c| c.status == "passing");
        if !healthy {
            let failing: Vec<&str> = self
                .checks
                .iter()
                .filter(|c| c.status != "passing")
                .map(|c| c.check_id.as_str())
                .collect();
            tracing::debug!(
                "discovery: consul: instance not passing, node={}, service_id={}, checks={:?}",
                self.node.node,
                self.service.id,
                failing
            );
        }
        // An empty service address means "use the node address".
        let host = if !self.service.address.is_empty() {
            self.service.address
        } else if !self.node.address.is_empty() {
            self.node.address
        } else {
            "127.0.0.1".to_string()
        };
        let scheme = match self.service.meta.get("scheme").map(String::as_str) {
            Some("https") => "https",
            _ => "http",
        };
        ServiceInstance {
            id: self.service.id,
            host,
            port: self.service.port,
            scheme: scheme.to_string(),
            healthy,
        }
    }
}

fn parse_health_entries(body: &[u8]) -> Result<Vec<ServiceInstance>, GatewayError> {
    let entries: Vec<ConsulHealthEntry> = serde_json::from_slice(body)
        .map_err(|e| GatewayError::RegistryUnavailable(format!("consul: bad response: {}", e)))?;
    Ok(entries
        .into_iter()
        .map(ConsulHealthEntry::into_instance)
        .collect())
}

/// Consul HTTP client. Query only: the gateway never registers itself.
#[derive(Clone)]
pub struct ConsulClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    pub fn new(
        consul_addr: &str,
        token: Option<String>,
        datacenter: Option<String>,
    ) -> Result<Self, GatewayError> {
        let base_url = if consul_addr.starts_with("http://") || consul_addr.starts_with("https://")
        {
            consul_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", consul_addr.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Config(format!("consul http client: {}", e)))?;

        Ok(Self {
            base_url,
            client,
            token,
            datacenter,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Inject the Consul ACL token into a request builder if configured.
    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }
}

impl ServiceRegistry for ConsulClient {
    /// All registered instances of `service`; an instance is healthy iff every
    /// one of its checks (including `serfHealth`) is passing.
    async fn lookup(&self, service: &str) -> Result<Vec<ServiceInstance>, GatewayError> {
        let mut url = format!("{}/v1/health/service/{}", self.base_url, service);
        if let Some(dc) = &self.datacenter {
            url.push_str(&format!("?dc={}", dc));
        }

        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| GatewayError::RegistryUnavailable(format!("consul: {}", e)))?;

        if !resp.status().is_success() {
            return Err(GatewayError::RegistryUnavailable(format!(
                "consul: non-200 response: status={}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::RegistryUnavailable(format!("consul: {}", e)))?;
        parse_health_entries(&body)
    }

    fn kind(&self) -> &'static str {
        "consul"
    }
}

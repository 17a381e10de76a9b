use super::{ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use serde::Deserialize;
use std::time::Duration;

/// Eureka REST client (`GET {base}/apps/{APP}`).
#[derive(Clone)]
pub struct EurekaClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApplicationEnvelope {
    application: Application,
}

#[derive(Debug, Deserialize)]
struct Application {
    #[serde(default)]
    instance: OneOrMany<EurekaInstance>,
}

/// Eureka's JSON encoder emits a bare object when an application has exactly
/// one instance.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(t) => vec![t],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EurekaInstance {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    host_name: String,
    #[serde(default)]
    ip_addr: String,
    status: String,
    port: EurekaPort,
    #[serde(default)]
    secure_port: Option<EurekaPort>,
}

#[derive(Debug, Deserialize)]
struct EurekaPort {
    #[serde(rename = "$")]
    value: PortValue,
    #[serde(rename = "@enabled", default)]
    enabled: Option<PortFlag>,
}

/// Ports and flags arrive as numbers/bools or as strings depending on the
/// server's codec.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Num(u16),
    Str(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortFlag {
    Bool(bool),
    Str(String),
}

impl EurekaPort {
    fn port(&self) -> Option<u16> {
        match &self.value {
            PortValue::Num(n) => Some(*n),
            PortValue::Str(s) => s.parse().ok(),
        }
    }

    fn is_enabled(&self) -> bool {
        match &self.enabled {
            Some(PortFlag::Bool(b)) => *b,
            Some(PortFlag::Str(s)) => s.eq_ignore_ascii_case("true"),
            None => false,
        }
    }
}

impl EurekaInstance {
    fn into_instance(self) -> Option<ServiceInstance> {
        let secure = self
            .secure_port
            .as_ref()
            .filter(|p| p.is_enabled())
            .and_then(EurekaPort::port);
        let (scheme, port) = match secure {
            Some(p) => ("https", p),
            None => ("http", self.port.port()?),
        };
        let host = if self.host_name.is_empty() {
            self.ip_addr
        } else {
            self.host_name
        };
        if host.is_empty() {
            return None;
        }
        Some(ServiceInstance {
            id: self
                .instance_id
                .unwrap_or_else(|| format!("{}:{}", host, port)),
            host,
            port,
            scheme: scheme.to_string(),
            healthy: self.status == "UP",
        })
    }
}

fn parse_application(body: &[u8]) -> Result<Vec<ServiceInstance>, GatewayError> {
    let envelope: ApplicationEnvelope = serde_json::from_slice(body)
        .map_err(|e| GatewayError::RegistryUnavailable(format!("eureka: bad response: {}", e)))?;
    Ok(envelope
        .application
        .instance
        .into_vec()
        .into_iter()
        .filter_map(EurekaInstance::into_instance)
        .collect())
}

impl EurekaClient {
    /// `eureka_url` is the server base, e.g. `http://127.0.0.1:8761/eureka`.
    pub fn new(eureka_url: &str) -> Result<Self, GatewayError> {
        let base_url = if eureka_url.starts_with("http://") || eureka_url.starts_with("https://") {
            eureka_url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", eureka_url.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Config(format!("eureka http client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ServiceRegistry for EurekaClient {
    async fn lookup(&self, service: &str) -> Result<Vec<ServiceInstance>, GatewayError> {
        let url = format!("{}/apps/{}", self.base_url, service);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::RegistryUnavailable(format!("eureka: {}", e)))?;

        // Eureka answers 404 for an application with no registered instances.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(GatewayError::RegistryUnavailable(format!(
                "eureka: non-200 response: status={}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::RegistryUnavailable(format!("eureka: {}", e)))?;
        parse_application(&body)
    }

    fn kind(&self) -> &'static str {
        "eureka"
    }
}

pub mod client;
pub mod eureka;
pub mod registry;
pub mod static_nodes;

pub use client::ConsulClient;
pub use eureka::EurekaClient;
pub use registry::RegistryClient;
pub use static_nodes::StaticRegistry;

use crate::config::{RegistryConfig, RegistryKind};
use crate::error::GatewayError;
use serde::Serialize;
use std::future::Future;

/// One registered backend instance. A snapshot: a refresh produces new values
/// rather than mutating old ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub healthy: bool,
}

impl ServiceInstance {
    /// `scheme://host:port`, with IPv6 literals bracketed.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Query side of a service registry. Implementations return every instance
/// they know of with its health flag; filtering and rotation happen in
/// [`RegistryClient`].
pub trait ServiceRegistry: Send + Sync + 'static {
    fn lookup(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Vec<ServiceInstance>, GatewayError>> + Send;

    /// Label used in logs and metrics.
    fn kind(&self) -> &'static str;
}

/// The registry backend selected by configuration.
pub enum Registry {
    Consul(ConsulClient),
    Eureka(EurekaClient),
    Static(StaticRegistry),
}

impl Registry {
    pub fn from_config(cfg: &RegistryConfig) -> Result<Self, GatewayError> {
        Ok(match cfg.kind {
            RegistryKind::Consul => Registry::Consul(ConsulClient::new(
                &cfg.address,
                cfg.token.clone(),
                cfg.datacenter.clone(),
            )?),
            RegistryKind::Eureka => Registry::Eureka(EurekaClient::new(&cfg.address)?),
            RegistryKind::Static => Registry::Static(StaticRegistry::from_config(&cfg.services)),
        })
    }
}

impl ServiceRegistry for Registry {
    async fn lookup(&self, service: &str) -> Result<Vec<ServiceInstance>, GatewayError> {
        match self {
            Registry::Consul(c) => c.lookup(service).await,
            Registry::Eureka(c) => c.lookup(service).await,
            Registry::Static(c) => c.lookup(service).await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Registry::Consul(c) => c.kind(),
            Registry::Eureka(c) => c.kind(),
            Registry::Static(c) => c.kind(),
        }
    }
}

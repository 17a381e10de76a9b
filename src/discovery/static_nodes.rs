use super::{ServiceInstance, ServiceRegistry};
use crate::config::StaticInstanceConfig;
use crate::error::GatewayError;
use std::collections::HashMap;

/// Fixed instance lists from configuration, for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    services: HashMap<String, Vec<ServiceInstance>>,
}

impl StaticRegistry {
    pub fn new(services: HashMap<String, Vec<ServiceInstance>>) -> Self {
        Self { services }
    }

    pub fn from_config(services: &HashMap<String, Vec<StaticInstanceConfig>>) -> Self {
        let services = services
            .iter()
            .map(|(name, nodes)| {
                let instances = nodes
                    .iter()
                    .map(|n| ServiceInstance {
                        id: format!("{}:{}:{}", name, n.host, n.port),
                        host: n.host.clone(),
                        port: n.port,
                        scheme: n.scheme.clone(),
                        healthy: n.healthy,
                    })
                    .collect();
                (name.clone(), instances)
            })
            .collect();
        Self { services }
    }
}

impl ServiceRegistry for StaticRegistry {
    async fn lookup(&self, service: &str) -> Result<Vec<ServiceInstance>, GatewayError> {
        Ok(self.services.get(service).cloned().unwrap_or_default())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

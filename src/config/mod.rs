pub mod duration;
pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used (no routes, so every request is a 404).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            routes = config.routes.len(),
            breakers = config.breaker_ids().len(),
            registry = config.registry.kind.as_str(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Environment overrides cover registry and fallback connectivity only.
    /// Routes and breaker policy come from the config file.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CLOUDGATE_REGISTRY_KIND") {
            match v.parse() {
                Ok(kind) => self.registry.kind = kind,
                Err(e) => tracing::warn!("config: ignoring CLOUDGATE_REGISTRY_KIND, error={}", e),
            }
        }
        if let Some(v) = var("CLOUDGATE_REGISTRY_ADDRESS") {
            self.registry.address = v;
        }
        if let Some(v) = var("CLOUDGATE_REGISTRY_TOKEN") {
            self.registry.token = Some(v);
        }
        if let Some(v) = var("CLOUDGATE_REGISTRY_DATACENTER") {
            self.registry.datacenter = Some(v);
        }
        if let Some(v) = var("CLOUDGATE_REFRESH_INTERVAL") {
            match humantime::parse_duration(&v) {
                Ok(d) => self.registry.refresh_interval = d,
                Err(e) => tracing::warn!(
                    "config: ignoring CLOUDGATE_REFRESH_INTERVAL, value={:?}, error={}",
                    v,
                    e
                ),
            }
        }
        if let Some(v) = var("CLOUDGATE_FALLBACK_BASE_URL") {
            self.fallback.base_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut paths = HashSet::new();

        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route with path '{}' has empty id", route.path);
            }
            if !ids.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id '{}'", route.id);
            }
            if let Err(e) = crate::routing::PathPattern::parse(&route.path) {
                anyhow::bail!("route '{}': {}", route.id, e);
            }
            if !paths.insert(route.path.as_str()) {
                anyhow::bail!("route '{}': path '{}' is already bound", route.id, route.path);
            }
            if route.service.is_empty() {
                anyhow::bail!("route '{}' has empty service", route.id);
            }
            if route.breaker.is_empty() {
                anyhow::bail!("route '{}' has empty breaker", route.id);
            }
            if route.fallback_uri.is_empty() {
                anyhow::bail!("route '{}' has empty fallback_uri", route.id);
            }
            if !self.has_fallback_responder(&route.fallback_uri) {
                anyhow::bail!(
                    "route '{}': fallback_uri '{}' has no [[fallbacks]] entry or fallback.base_url",
                    route.id,
                    route.fallback_uri
                );
            }
        }

        if self.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be greater than zero");
        }

        validate_breaker("circuit_breaker", &self.circuit_breaker)?;
        for (id, ov) in &self.breakers {
            validate_breaker(id, &self.circuit_breaker.merged(ov))?;
        }

        for fb in &self.fallbacks {
            if !fb.path.starts_with('/') {
                anyhow::bail!("fallback path '{}' must start with '/'", fb.path);
            }
            if http::StatusCode::from_u16(fb.status).is_err() {
                anyhow::bail!("fallback '{}' has invalid status {}", fb.path, fb.status);
            }
        }

        if self.registry.kind != RegistryKind::Static && !self.registry.services.is_empty() {
            anyhow::bail!(
                "registry.services is only used with kind = \"static\" (kind is \"{}\")",
                self.registry.kind.as_str()
            );
        }
        if self.registry.query_timeout.is_zero() {
            anyhow::bail!("registry.query_timeout must be greater than zero");
        }

        Ok(())
    }

    /// Absolute fallback URIs are called as-is; relative ones need a local
    /// `[[fallbacks]]` entry for their path or a `fallback.base_url`.
    fn has_fallback_responder(&self, fallback_uri: &str) -> bool {
        if fallback_uri.starts_with("http://") || fallback_uri.starts_with("https://") {
            return true;
        }
        let path = fallback_uri.split('?').next().unwrap_or(fallback_uri);
        self.fallbacks.iter().any(|fb| fb.path == path) || self.fallback.base_url.is_some()
    }

    /// Effective breaker policy for an identifier.
    pub fn breaker_config(&self, id: &str) -> CircuitBreakerConfig {
        match self.breakers.get(id) {
            Some(ov) => self.circuit_breaker.merged(ov),
            None => self.circuit_breaker.clone(),
        }
    }

    /// Distinct breaker identifiers referenced by routes, in route order.
    pub fn breaker_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.routes
            .iter()
            .map(|r| r.breaker.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

fn validate_breaker(name: &str, cfg: &CircuitBreakerConfig) -> Result<()> {
    if !(cfg.failure_rate_threshold > 0.0 && cfg.failure_rate_threshold <= 100.0) {
        anyhow::bail!(
            "breaker '{}': failure_rate_threshold must be in (0, 100], got {}",
            name,
            cfg.failure_rate_threshold
        );
    }
    if cfg.sliding_window_size == 0 {
        anyhow::bail!("breaker '{}': sliding_window_size must be at least 1", name);
    }
    if cfg.minimum_number_of_calls == 0 || cfg.minimum_number_of_calls > cfg.sliding_window_size {
        anyhow::bail!(
            "breaker '{}': minimum_number_of_calls must be in 1..={}",
            name,
            cfg.sliding_window_size
        );
    }
    if cfg.permitted_calls_in_half_open == 0 {
        anyhow::bail!("breaker '{}': permitted_calls_in_half_open must be at least 1", name);
    }
    if cfg.call_timeout.is_zero() {
        anyhow::bail!("breaker '{}': call_timeout must be greater than zero", name);
    }
    Ok(())
}

pub mod types;


pub use types::*;

use crate::upstream::{Strategy, Target};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

impl ProxyConfig {
    /// Load configuration from a TOML or JSON file, apply environment
    /// variable overrides, normalize, and validate. Any error here refuses
    /// startup.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("cannot read config file {}: {}", path.display(), e)
        })?;
        let mut config: ProxyConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        };

        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        tracing::info!(
            "config: loaded, targets={}, strategy={}",
            config.targets.len(),
            config.load_balancer_strategy
        );
        Ok(config)
    }

    /// Environment variable overrides for deployment-level settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VESTIBULE_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("VESTIBULE_TARGETS") {
            self.targets = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("VESTIBULE_LB_STRATEGY") {
            self.load_balancer_strategy = v;
        }
        if let Ok(v) = std::env::var("VESTIBULE_LB_HEALTH_CHECK") {
            self.load_balancer_health_check = v == "true" || v == "1";
        }
    }

    /// ":8080" → "0.0.0.0:8080"; method names uppercased.
    pub fn normalize(&mut self) {
        if self.listen.starts_with(':') {
            self.listen = format!("0.0.0.0{}", self.listen);
        }
        for m in &mut self.allowed_methods {
            *m = m.to_ascii_uppercase();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            anyhow::bail!("at least one target is required");
        }
        for raw in &self.targets {
            Target::parse(raw)?;
        }
        if Strategy::parse(&self.load_balancer_strategy).is_none() {
            anyhow::bail!(
                "unknown load_balancer_strategy '{}', use \"rr\" or \"least_conn\"",
                self.load_balancer_strategy
            );
        }
        for m in &self.allowed_methods {
            if m.parse::<http::Method>().is_err() {
                anyhow::bail!("invalid method '{}' in allowed_methods", m);
            }
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be positive");
        }
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be positive");
        }
        if self.queue.max_queue == 0 {
            anyhow::bail!("queue.max_queue must be positive");
        }
        if self.queue.max_concurrent == 0 {
            anyhow::bail!("queue.max_concurrent must be positive");
        }
        if self.queue.enqueue_timeout_ms == 0 {
            anyhow::bail!("queue.enqueue_timeout_ms must be positive");
        }
        if self.tls.enabled {
            if self.tls.cert_file.is_none() {
                anyhow::bail!("tls.cert_file is required when tls.enabled");
            }
            if self.tls.key_file.is_none() {
                anyhow::bail!("tls.key_file is required when tls.enabled");
            }
        }
        Ok(())
    }

    pub fn parsed_targets(&self) -> Result<Vec<Arc<Target>>> {
        self.targets
            .iter()
            .map(|raw| Target::parse(raw).map(Arc::new))
            .collect()
    }

    pub fn strategy(&self) -> Result<Strategy> {
        Strategy::parse(&self.load_balancer_strategy).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown load_balancer_strategy '{}'",
                self.load_balancer_strategy
            )
        })
    }
}

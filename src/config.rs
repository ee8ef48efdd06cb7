use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure, loaded from a JSON file
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Ingress listen address, e.g. ":8080" or "0.0.0.0:8080"
    pub addr: String,
    /// Management API listen address
    pub mgr_addr: String,
    /// Registry address, e.g. "mem://" or "etcd://host:2379"
    pub registry_addr: String,
    /// Key prefix inside the registry
    pub prefix: String,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub external: bool,
}

/// Tunables for the per-backend HTTP clients
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    pub max_conns_per_host: usize,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 512,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            pool_idle_timeout_secs: 90,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            anyhow::bail!("addr cannot be empty");
        }

        if self.mgr_addr.is_empty() {
            anyhow::bail!("mgrAddr cannot be empty");
        }

        if self.registry_addr.is_empty() {
            anyhow::bail!("registryAddr cannot be empty");
        }

        if !self.registry_addr.contains("://") {
            anyhow::bail!("registryAddr must be scheme://address: {}", self.registry_addr);
        }

        if self.backend.request_timeout_secs == 0 {
            anyhow::bail!("backend.requestTimeoutSecs cannot be zero");
        }

        Ok(())
    }

    /// Bindable form of the ingress address (":8080" means any interface)
    pub fn listen_addr(&self) -> String {
        normalize_addr(&self.addr)
    }

    /// Bindable form of the management address
    pub fn mgr_listen_addr(&self) -> String {
        normalize_addr(&self.mgr_addr)
    }
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

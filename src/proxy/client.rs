use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};

/// Per-backend reqwest clients, created on first use. The map is read on
/// every dispatch, so lookups take the read lock and only a miss upgrades to
/// the write lock (re-checking under it).
pub struct BackendClients {
    inner: RwLock<HashMap<String, reqwest::Client>>,
}

impl BackendClients {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, addr: &str, cfg: &BackendConfig) -> Result<reqwest::Client> {
        {
            let clients = self.inner.read().await;
            if let Some(client) = clients.get(addr) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.inner.write().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .connect_timeout(cfg.connect_timeout())
            .pool_idle_timeout(cfg.pool_idle_timeout())
            .pool_max_idle_per_host(cfg.max_conns_per_host)
            .build()
            .map_err(|e| GatewayError::Internal(format!("backend client: {}", e)))?;

        debug!("proxy: backend client for <{}> created", addr);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    pub async fn remove(&self, addr: &str) {
        self.inner.write().await.remove(addr);
    }
}

impl Default for BackendClients {
    fn default() -> Self {
        Self::new()
    }
}

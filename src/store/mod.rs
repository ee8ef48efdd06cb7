pub mod memory;

pub use memory::MemStore;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{GatewayError, Result};
use crate::model::{ApiSpec, ClusterSpec, RoutingSpec, ServerSpec};

/// Association between a server and a cluster. Registry key is
/// `<serverAddr>-<clusterName>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
    pub server_addr: String,
    pub cluster_name: String,
}

impl Bind {
    pub fn key(&self) -> String {
        format!("{}-{}", self.server_addr, self.cluster_name)
    }

    pub fn from_key(key: &str) -> Option<Bind> {
        let (addr, name) = key.split_once('-')?;
        Some(Bind {
            server_addr: addr.to_string(),
            cluster_name: name.to_string(),
        })
    }
}

/// This proxy's presence record, published for admin discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
    pub addr: String,
    pub mgr_addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSrc {
    Cluster,
    Server,
    Bind,
    Api,
    Routing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub enum EntityValue {
    Cluster(ClusterSpec),
    Server(ServerSpec),
    Bind(Bind),
    Api(ApiSpec),
    Routing(RoutingSpec),
}

/// One registry change, streamed to watchers
#[derive(Debug, Clone)]
pub struct Event {
    pub src: EventSrc,
    pub kind: EventKind,
    pub key: String,
    pub value: Option<EntityValue>,
}

/// Abstract configuration registry: full snapshots, mutation, and a watch
/// stream. Events for one key are delivered in the order applied.
pub trait Store: Send + Sync {
    fn get_clusters(&self) -> Result<Vec<ClusterSpec>>;
    fn get_servers(&self) -> Result<Vec<ServerSpec>>;
    fn get_binds(&self) -> Result<Vec<Bind>>;
    fn get_apis(&self) -> Result<Vec<ApiSpec>>;
    fn get_routings(&self) -> Result<Vec<RoutingSpec>>;

    fn save_cluster(&self, cluster: ClusterSpec) -> Result<()>;
    fn delete_cluster(&self, name: &str) -> Result<()>;
    fn save_server(&self, server: ServerSpec) -> Result<()>;
    fn delete_server(&self, addr: &str) -> Result<()>;
    fn save_bind(&self, bind: Bind) -> Result<()>;
    fn delete_bind(&self, bind: &Bind) -> Result<()>;
    fn save_api(&self, api: ApiSpec) -> Result<()>;
    fn delete_api(&self, url: &str, method: &str) -> Result<()>;
    fn save_routing(&self, routing: RoutingSpec) -> Result<()>;
    fn delete_routing(&self, id: &str) -> Result<()>;

    /// Stream registry changes into `sink` until `stop` fires, the sink is
    /// dropped, or the underlying store fails (logged, task ends).
    fn watch(&self, sink: mpsc::Sender<Event>, stop: oneshot::Receiver<()>) -> Result<()>;

    /// Publish this proxy's presence for admin discovery
    fn registry(&self, proxy: &ProxyInfo) -> Result<()>;
}

/// Build a store from the configured registry address
pub fn from_registry(registry_addr: &str, prefix: &str) -> Result<Arc<dyn Store>> {
    let (scheme, _rest) = registry_addr.split_once("://").ok_or_else(|| {
        GatewayError::ConfigInvalid(format!("bad registry address: {}", registry_addr))
    })?;

    match scheme {
        "mem" => Ok(Arc::new(MemStore::new(prefix))),
        other => Err(GatewayError::ConfigInvalid(format!(
            "unsupported registry scheme: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_key_round_trip() {
        let bind = Bind {
            server_addr: "127.0.0.1:9001".to_string(),
            cluster_name: "users".to_string(),
        };
        assert_eq!(bind.key(), "127.0.0.1:9001-users");
        assert_eq!(Bind::from_key(&bind.key()), Some(bind));
    }

    #[test]
    fn test_from_registry_schemes() {
        assert!(from_registry("mem://", "/gateway").is_ok());
        assert!(from_registry("etcd://host:2379", "/gateway").is_err());
        assert!(from_registry("nonsense", "/gateway").is_err());
    }
}

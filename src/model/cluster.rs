use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::RequestMeta;

/// Load balance strategy for picking a backend inside a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalance {
    RoundRobin,
    Random,
    IpHash,
    HeaderHash,
}

impl LoadBalance {
    pub fn from_name(name: &str) -> LoadBalance {
        match name.to_uppercase().as_str() {
            "RANDOM" => LoadBalance::Random,
            "IPHASH" => LoadBalance::IpHash,
            "HEADERHASH" => LoadBalance::HeaderHash,
            _ => LoadBalance::RoundRobin,
        }
    }
}

/// Cluster definition as stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpec {
    pub name: String,
    pub lb_name: String,
    /// Header consulted by the HEADERHASH strategy
    pub hash_header: String,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            lb_name: "ROUNDROBIN".to_string(),
            hash_header: "X-Hash-Key".to_string(),
        }
    }
}

/// Runtime cluster: the set of bound servers currently Up, plus the
/// selection strategy. Membership edits serialize under the cluster's own
/// lock so the route table lock is never held across them.
pub struct Cluster {
    pub name: String,
    spec: Mutex<ClusterSpec>,
    active: Mutex<Vec<String>>,
    rr: AtomicUsize,
}

impl Cluster {
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            name: spec.name.clone(),
            spec: Mutex::new(spec),
            active: Mutex::new(Vec::new()),
            rr: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> ClusterSpec {
        self.spec.lock().unwrap().clone()
    }

    pub fn update_from(&self, other: &ClusterSpec) {
        let mut spec = self.spec.lock().unwrap();
        spec.lb_name = other.lb_name.clone();
        spec.hash_header = other.hash_header.clone();
    }

    /// Add an Up server to the active set
    pub fn bind(&self, addr: &str) {
        let mut active = self.active.lock().unwrap();
        if !active.iter().any(|a| a == addr) {
            active.push(addr.to_string());
            info!("meta: cluster <{}> bind <{}>", self.name, addr);
        }
    }

    /// Remove a server from the active set
    pub fn unbind(&self, addr: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(pos) = active.iter().position(|a| a == addr) {
            active.remove(pos);
            info!("meta: cluster <{}> unbind <{}>", self.name, addr);
        }
    }

    pub fn active_servers(&self) -> Vec<String> {
        self.active.lock().unwrap().clone()
    }

    /// Pick a backend address for the request, or None when no server is
    /// active.
    pub fn select(&self, req: &RequestMeta) -> Option<String> {
        let active = self.active.lock().unwrap();
        if active.is_empty() {
            return None;
        }

        let (lb, hash_header) = {
            let spec = self.spec.lock().unwrap();
            (LoadBalance::from_name(&spec.lb_name), spec.hash_header.clone())
        };

        let index = match lb {
            LoadBalance::RoundRobin => self.rr.fetch_add(1, Ordering::Relaxed) % active.len(),
            LoadBalance::Random => rand::thread_rng().gen_range(0..active.len()),
            LoadBalance::IpHash => match req.client_ip {
                Some(ip) => hash_of(&ip) % active.len(),
                None => self.rr.fetch_add(1, Ordering::Relaxed) % active.len(),
            },
            LoadBalance::HeaderHash => match req.header_value(&hash_header) {
                Some(value) => hash_of(&value) % active.len(),
                None => self.rr.fetch_add(1, Ordering::Relaxed) % active.len(),
            },
        };

        Some(active[index].clone())
    }
}

fn hash_of<T: Hash>(value: &T) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn cluster(lb: &str) -> Cluster {
        let c = Cluster::new(ClusterSpec {
            name: "c1".to_string(),
            lb_name: lb.to_string(),
            ..Default::default()
        });
        c.bind("127.0.0.1:9001");
        c.bind("127.0.0.1:9002");
        c.bind("127.0.0.1:9003");
        c
    }

    fn meta(ip: Option<IpAddr>, hash_key: Option<&str>) -> RequestMeta {
        let mut headers = HeaderMap::new();
        if let Some(v) = hash_key {
            headers.insert("X-Hash-Key", v.parse().unwrap());
        }
        RequestMeta::new("GET".into(), "/".into(), String::new(), None, headers, ip)
    }

    #[test]
    fn test_round_robin_cycles() {
        let c = cluster("ROUNDROBIN");
        let req = meta(None, None);

        let picks: Vec<_> = (0..6).map(|_| c.select(&req).unwrap()).collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_ip_hash_is_sticky() {
        let c = cluster("IPHASH");
        let req = meta(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))), None);

        let first = c.select(&req).unwrap();
        for _ in 0..5 {
            assert_eq!(c.select(&req).unwrap(), first);
        }
    }

    #[test]
    fn test_header_hash_is_sticky() {
        let c = cluster("HEADERHASH");
        let req = meta(None, Some("user-42"));

        let first = c.select(&req).unwrap();
        for _ in 0..5 {
            assert_eq!(c.select(&req).unwrap(), first);
        }
    }

    #[test]
    fn test_empty_cluster_selects_nothing() {
        let c = Cluster::new(ClusterSpec {
            name: "empty".to_string(),
            ..Default::default()
        });
        assert!(c.select(&meta(None, None)).is_none());
    }

    #[test]
    fn test_bind_unbind_dedupes() {
        let c = cluster("ROUNDROBIN");
        c.bind("127.0.0.1:9001");
        assert_eq!(c.active_servers().len(), 3);

        c.unbind("127.0.0.1:9002");
        assert_eq!(
            c.active_servers(),
            vec!["127.0.0.1:9001".to_string(), "127.0.0.1:9003".to_string()]
        );

        c.unbind("127.0.0.1:9002");
        assert_eq!(c.active_servers().len(), 2);
    }
}

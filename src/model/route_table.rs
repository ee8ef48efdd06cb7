use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

use super::api::Node;
use super::timer::KeyedTimer;
use super::{Analysis, Api, ApiSpec, Cluster, ClusterSpec, RequestMeta, Routing, RoutingSpec, Server, ServerSpec, Status};
use crate::error::{GatewayError, Result};
use crate::store::{EntityValue, Event, EventKind, EventSrc, Store};

/// Capacity of the status-change channel; sized so the health checker is
/// never back-pressured by propagation.
const STATUS_CHANGE_BUFFER: usize = 1024;

/// Outcome of matching one API node against the route table
pub struct RouteResult {
    pub api: Arc<Api>,
    pub node_index: usize,
    pub svr: Option<Arc<Server>>,
    pub merge: bool,
}

impl RouteResult {
    pub fn node(&self) -> &Node {
        &self.api.spec.nodes[self.node_index]
    }
}

struct Tables {
    clusters: HashMap<String, Arc<Cluster>>,
    servers: HashMap<String, Arc<Server>>,
    /// Reverse index: server addr -> names of bound clusters
    mapping: HashMap<String, HashSet<String>>,
    apis: HashMap<String, Arc<Api>>,
    routings: BTreeMap<String, Arc<Routing>>,
}

/// The live routing graph. All entity maps sit under one RW-lock; mutators
/// write, selection reads. Health-status propagation runs on a dedicated
/// worker fed by a buffered channel so probe ticks never contend with the
/// selection path, and cluster membership locks are only taken after the
/// table lock has been released.
pub struct RouteTable {
    inner: RwLock<Tables>,
    analysis: Arc<Analysis>,
    timer: KeyedTimer,
    changed_tx: mpsc::Sender<String>,
    store: Arc<dyn Store>,
    watch_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl RouteTable {
    pub fn new(store: Arc<dyn Store>, analysis: Arc<Analysis>) -> Arc<Self> {
        let (changed_tx, changed_rx) = mpsc::channel(STATUS_CHANGE_BUFFER);

        let rt = Arc::new(Self {
            inner: RwLock::new(Tables {
                clusters: HashMap::new(),
                servers: HashMap::new(),
                mapping: HashMap::new(),
                apis: HashMap::new(),
                routings: BTreeMap::new(),
            }),
            analysis,
            timer: KeyedTimer::new(),
            changed_tx,
            store,
            watch_stop: Mutex::new(None),
        });

        tokio::spawn(Self::changed_worker(Arc::clone(&rt), changed_rx));
        rt
    }

    pub fn analysis(&self) -> &Arc<Analysis> {
        &self.analysis
    }

    pub async fn get_server(&self, addr: &str) -> Option<Arc<Server>> {
        self.inner.read().await.servers.get(addr).cloned()
    }

    pub async fn get_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.inner.read().await.clusters.get(name).cloned()
    }

    // ---- servers ----

    pub async fn add_new_server(self: &Arc<Self>, spec: ServerSpec) -> Result<()> {
        let svr = {
            let mut tables = self.inner.write().await;
            if tables.servers.contains_key(&spec.addr) {
                return Err(GatewayError::exists("server", spec.addr.as_str()));
            }

            let svr = Arc::new(Server::new(spec)?);
            tables.servers.insert(svr.addr.clone(), Arc::clone(&svr));
            tables.mapping.insert(svr.addr.clone(), HashSet::new());
            svr
        };

        let breaker = svr.breaker();
        self.analysis.add_point(&svr.addr);
        self.analysis.add_recent_count(&svr.addr, 1);
        self.analysis
            .add_recent_count(&svr.addr, breaker.open_to_close_collect_seconds);
        self.analysis
            .add_recent_count(&svr.addr, breaker.half_to_open_collect_seconds);

        if svr.external {
            svr.change_to(Status::Up);
        } else {
            self.schedule_check(&svr.addr, Duration::ZERO);
        }

        info!("meta: server <{}> added", svr.addr);
        Ok(())
    }

    pub async fn update_server(&self, spec: ServerSpec) -> Result<()> {
        let tables = self.inner.write().await;
        let old = tables
            .servers
            .get(&spec.addr)
            .ok_or_else(|| GatewayError::not_found("server", spec.addr.as_str()))?;

        self.analysis
            .add_recent_count(&spec.addr, spec.open_to_close_collect_seconds);
        old.update_from(&spec);

        info!("meta: server <{}> updated", spec.addr);
        Ok(())
    }

    pub async fn delete_server(&self, addr: &str) -> Result<()> {
        let (svr, clusters) = {
            let mut tables = self.inner.write().await;
            let svr = tables
                .servers
                .remove(addr)
                .ok_or_else(|| GatewayError::not_found("server", addr))?;

            let bound = tables.mapping.remove(addr).unwrap_or_default();
            let clusters: Vec<Arc<Cluster>> = bound
                .iter()
                .filter_map(|name| tables.clusters.get(name).cloned())
                .collect();
            (svr, clusters)
        };

        svr.stop_check();
        self.timer.cancel(addr);
        self.analysis.remove_point(addr);

        for cluster in clusters {
            cluster.unbind(addr);
        }

        info!("meta: server <{}> deleted", addr);
        Ok(())
    }

    // ---- clusters ----

    pub async fn add_new_cluster(&self, spec: ClusterSpec) -> Result<()> {
        let mut tables = self.inner.write().await;
        if tables.clusters.contains_key(&spec.name) {
            return Err(GatewayError::exists("cluster", spec.name.as_str()));
        }

        let name = spec.name.clone();
        tables.clusters.insert(name.clone(), Arc::new(Cluster::new(spec)));

        info!("meta: cluster <{}> added", name);
        Ok(())
    }

    pub async fn update_cluster(&self, spec: ClusterSpec) -> Result<()> {
        let tables = self.inner.write().await;
        let old = tables
            .clusters
            .get(&spec.name)
            .ok_or_else(|| GatewayError::not_found("cluster", spec.name.as_str()))?;

        old.update_from(&spec);
        info!("meta: cluster <{}> updated", spec.name);
        Ok(())
    }

    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        let (cluster, bound) = {
            let mut tables = self.inner.write().await;
            let cluster = tables
                .clusters
                .remove(name)
                .ok_or_else(|| GatewayError::not_found("cluster", name))?;

            let mut bound = Vec::new();
            for (addr, names) in tables.mapping.iter_mut() {
                if names.remove(name) {
                    bound.push(addr.clone());
                }
            }
            (cluster, bound)
        };

        for addr in bound {
            cluster.unbind(&addr);
        }

        info!("meta: cluster <{}> deleted", name);
        Ok(())
    }

    // ---- binds ----

    pub async fn bind(&self, server_addr: &str, cluster_name: &str) -> Result<()> {
        let (svr, cluster) = {
            let mut tables = self.inner.write().await;
            let svr = tables
                .servers
                .get(server_addr)
                .cloned()
                .ok_or_else(|| GatewayError::not_found("server", server_addr))?;
            let cluster = tables
                .clusters
                .get(cluster_name)
                .cloned()
                .ok_or_else(|| GatewayError::not_found("cluster", cluster_name))?;

            let bound = tables.mapping.entry(server_addr.to_string()).or_default();
            if !bound.insert(cluster_name.to_string()) {
                return Err(GatewayError::exists(
                    "bind",
                    format!("{}-{}", server_addr, cluster_name),
                ));
            }
            (svr, cluster)
        };

        info!("meta: bind <{},{}> stored", server_addr, cluster_name);

        if svr.status() == Status::Up {
            cluster.bind(server_addr);
        }
        Ok(())
    }

    pub async fn unbind(&self, server_addr: &str, cluster_name: &str) -> Result<()> {
        let cluster = {
            let mut tables = self.inner.write().await;
            if !tables.servers.contains_key(server_addr) {
                return Err(GatewayError::not_found("server", server_addr));
            }
            let cluster = tables
                .clusters
                .get(cluster_name)
                .cloned()
                .ok_or_else(|| GatewayError::not_found("cluster", cluster_name))?;

            if let Some(bound) = tables.mapping.get_mut(server_addr) {
                bound.remove(cluster_name);
            }
            cluster
        };

        info!("meta: bind <{},{}> removed", server_addr, cluster_name);
        cluster.unbind(server_addr);
        Ok(())
    }

    // ---- apis ----

    pub async fn add_new_api(&self, spec: ApiSpec) -> Result<()> {
        let api = Api::parse(spec)?;
        let key = api.key();

        let mut tables = self.inner.write().await;
        if tables.apis.contains_key(&key) {
            return Err(GatewayError::exists("api", key));
        }

        info!("meta: api <{}> added", key);
        tables.apis.insert(key, Arc::new(api));
        Ok(())
    }

    pub async fn update_api(&self, spec: ApiSpec) -> Result<()> {
        let api = Api::parse(spec)?;
        let key = api.key();

        let mut tables = self.inner.write().await;
        if !tables.apis.contains_key(&key) {
            return Err(GatewayError::not_found("api", key));
        }

        info!("meta: api <{}> updated", key);
        tables.apis.insert(key, Arc::new(api));
        Ok(())
    }

    pub async fn delete_api(&self, url: &str, method: &str) -> Result<()> {
        let key = super::api::api_key(url, method);
        let mut tables = self.inner.write().await;
        tables
            .apis
            .remove(&key)
            .ok_or_else(|| GatewayError::not_found("api", key.as_str()))?;

        info!("meta: api <{}> deleted", key);
        Ok(())
    }

    // ---- routings ----

    pub async fn add_new_routing(&self, spec: RoutingSpec) -> Result<()> {
        let routing = Routing::parse(spec)?;
        let id = routing.spec.id.clone();

        let mut tables = self.inner.write().await;
        if tables.routings.contains_key(&id) {
            return Err(GatewayError::exists("routing", id));
        }

        info!("meta: routing <{}> added", id);
        tables.routings.insert(id, Arc::new(routing));
        Ok(())
    }

    pub async fn update_routing(&self, spec: RoutingSpec) -> Result<()> {
        let routing = Routing::parse(spec)?;
        let id = routing.spec.id.clone();

        let mut tables = self.inner.write().await;
        if !tables.routings.contains_key(&id) {
            return Err(GatewayError::not_found("routing", id));
        }

        info!("meta: routing <{}> updated", id);
        tables.routings.insert(id, Arc::new(routing));
        Ok(())
    }

    pub async fn delete_routing(&self, id: &str) -> Result<()> {
        let mut tables = self.inner.write().await;
        tables
            .routings
            .remove(id)
            .ok_or_else(|| GatewayError::not_found("routing", id))?;

        info!("meta: routing <{}> deleted", id);
        Ok(())
    }

    // ---- selection ----

    /// Match the request to an API and resolve a backend per node. The read
    /// lock spans the whole node loop; no I/O happens under it.
    pub async fn select(&self, req: &RequestMeta) -> Vec<RouteResult> {
        let tables = self.inner.read().await;

        let api = tables
            .apis
            .values()
            .filter(|api| api.matches(req))
            .max_by(|a, b| {
                a.spec
                    .url
                    .len()
                    .cmp(&b.spec.url.len())
                    .then_with(|| b.key().cmp(&a.key()))
            });

        let Some(api) = api else {
            return Vec::new();
        };

        let merge = api.is_merge();
        api.spec
            .nodes
            .iter()
            .enumerate()
            .map(|(node_index, node)| {
                let svr = Self::pick_cluster(&tables, req, &node.cluster_name)
                    .and_then(|cluster| cluster.select(req))
                    .and_then(|addr| tables.servers.get(&addr).cloned());

                RouteResult {
                    api: Arc::clone(api),
                    node_index,
                    svr,
                    merge,
                }
            })
            .collect()
    }

    /// Routing overrides run in ascending id order; the first match wins. A
    /// missing target cluster is a selection miss, exactly like a missing
    /// node cluster.
    fn pick_cluster<'t>(
        tables: &'t Tables,
        req: &RequestMeta,
        node_cluster: &str,
    ) -> Option<&'t Arc<Cluster>> {
        for routing in tables.routings.values() {
            if routing.matches(req) {
                return tables.clusters.get(&routing.spec.cluster_name);
            }
        }
        tables.clusters.get(node_cluster)
    }

    // ---- health checking ----

    fn schedule_check(self: &Arc<Self>, addr: &str, delay: Duration) {
        let rt = Arc::clone(self);
        let owned = addr.to_string();
        self.timer
            .schedule(addr, delay, async move { rt.check(owned).await });
    }

    async fn check(self: Arc<Self>, addr: String) {
        let svr = { self.inner.read().await.servers.get(&addr).cloned() };
        let Some(svr) = svr else { return };
        if svr.check_stopped() {
            return;
        }

        let ok = svr.check().await;
        svr.change_to(if ok { Status::Up } else { Status::Down });

        if svr.status_changed() {
            if ok {
                info!("meta: server <{}> UP", addr);
            } else {
                warn!("meta: server <{}> DOWN", addr);
            }

            if let Err(e) = self.changed_tx.try_send(addr.clone()) {
                warn!("meta: status change for <{}> dropped: {}", addr, e);
            }
        }

        if !svr.check_stopped() {
            self.schedule_check(&addr, svr.check_interval());
        }
    }

    pub fn is_check_scheduled(&self, addr: &str) -> bool {
        self.timer.is_scheduled(addr)
    }

    /// Drains the status-change channel and pushes membership edits to the
    /// bound clusters. The table lock is released before cluster locks are
    /// taken.
    async fn changed_worker(rt: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        while let Some(addr) = rx.recv().await {
            let (svr, clusters) = {
                let tables = rt.inner.read().await;
                let svr = tables.servers.get(&addr).cloned();
                let clusters: Vec<Arc<Cluster>> = tables
                    .mapping
                    .get(&addr)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(|name| tables.clusters.get(name).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                (svr, clusters)
            };

            let Some(svr) = svr else { continue };

            if svr.status() == Status::Up {
                for cluster in clusters {
                    cluster.bind(&addr);
                }
            } else {
                for cluster in clusters {
                    cluster.unbind(&addr);
                }
            }
        }
    }

    // ---- load & watch ----

    /// Pull full snapshots from the store, then start watching for changes.
    /// Snapshot failures are fatal at load.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        for cluster in self.store.get_clusters()? {
            self.add_new_cluster(cluster).await?;
        }
        for server in self.store.get_servers()? {
            self.add_new_server(server).await?;
        }
        for bind in self.store.get_binds()? {
            self.bind(&bind.server_addr, &bind.cluster_name).await?;
        }
        for api in self.store.get_apis()? {
            self.add_new_api(api).await?;
        }
        for routing in self.store.get_routings()? {
            self.add_new_routing(routing).await?;
        }

        self.start_watch()?;
        Ok(())
    }

    fn start_watch(self: &Arc<Self>) -> Result<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(STATUS_CHANGE_BUFFER);

        self.store.watch(tx, stop_rx)?;
        *self.watch_stop.lock().unwrap() = Some(stop_tx);

        let rt = Arc::clone(self);
        tokio::spawn(async move {
            info!("meta: routetable start watch");
            while let Some(event) = rx.recv().await {
                rt.apply_event(event).await;
            }
            error!("meta: routetable watch ended");
        });
        Ok(())
    }

    pub fn stop_watch(&self) {
        if let Some(stop) = self.watch_stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
    }

    async fn apply_event(self: &Arc<Self>, event: Event) {
        let outcome = match (event.src, event.kind, event.value) {
            (EventSrc::Cluster, EventKind::New, Some(EntityValue::Cluster(c))) => {
                self.add_new_cluster(c).await
            }
            (EventSrc::Cluster, EventKind::Update, Some(EntityValue::Cluster(c))) => {
                self.update_cluster(c).await
            }
            (EventSrc::Cluster, EventKind::Delete, _) => self.delete_cluster(&event.key).await,

            (EventSrc::Server, EventKind::New, Some(EntityValue::Server(s))) => {
                self.add_new_server(s).await
            }
            (EventSrc::Server, EventKind::Update, Some(EntityValue::Server(s))) => {
                self.update_server(s).await
            }
            (EventSrc::Server, EventKind::Delete, _) => self.delete_server(&event.key).await,

            (EventSrc::Bind, EventKind::New, Some(EntityValue::Bind(b))) => {
                self.bind(&b.server_addr, &b.cluster_name).await
            }
            (EventSrc::Bind, EventKind::Delete, value) => {
                let bind = match value {
                    Some(EntityValue::Bind(b)) => Some(b),
                    _ => crate::store::Bind::from_key(&event.key),
                };
                match bind {
                    Some(b) => self.unbind(&b.server_addr, &b.cluster_name).await,
                    None => {
                        warn!("meta: bind event with bad key <{}>", event.key);
                        Ok(())
                    }
                }
            }

            (EventSrc::Api, EventKind::New, Some(EntityValue::Api(a))) => self.add_new_api(a).await,
            (EventSrc::Api, EventKind::Update, Some(EntityValue::Api(a))) => {
                self.update_api(a).await
            }
            (EventSrc::Api, EventKind::Delete, _) => {
                match event.key.rsplit_once('-') {
                    Some((url, method)) => self.delete_api(url, method).await,
                    None => {
                        warn!("meta: api event with bad key <{}>", event.key);
                        Ok(())
                    }
                }
            }

            (EventSrc::Routing, EventKind::New, Some(EntityValue::Routing(r))) => {
                self.add_new_routing(r).await
            }
            (EventSrc::Routing, EventKind::Update, Some(EntityValue::Routing(r))) => {
                self.update_routing(r).await
            }
            (EventSrc::Routing, EventKind::Delete, _) => self.delete_routing(&event.key).await,

            (src, kind, _) => {
                warn!("meta: unhandled event <{:?} {:?} {}>", src, kind, event.key);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!("meta: event for <{}> not applied: {}", event.key, e);
        }
    }
}

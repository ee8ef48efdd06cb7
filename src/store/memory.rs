use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};

use super::{Bind, EntityValue, Event, EventKind, EventSrc, ProxyInfo, Store};
use crate::error::Result;
use crate::model::{api::api_key, ApiSpec, ClusterSpec, RoutingSpec, ServerSpec};

/// In-process registry. Mutations publish watch events on a broadcast
/// channel; each watcher gets its own forwarding task.
pub struct MemStore {
    prefix: String,
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

#[derive(Default)]
struct State {
    clusters: HashMap<String, ClusterSpec>,
    servers: HashMap<String, ServerSpec>,
    binds: HashMap<String, Bind>,
    apis: HashMap<String, ApiSpec>,
    routings: HashMap<String, RoutingSpec>,
    proxies: HashMap<String, ProxyInfo>,
}

impl MemStore {
    pub fn new(prefix: &str) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            prefix: prefix.to_string(),
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn publish(&self, event: Event) {
        // no subscribers yet is fine
        let _ = self.events.send(event);
    }

    fn save_kind(existed: bool) -> EventKind {
        if existed {
            EventKind::Update
        } else {
            EventKind::New
        }
    }
}

impl Store for MemStore {
    fn get_clusters(&self) -> Result<Vec<ClusterSpec>> {
        Ok(self.state.lock().unwrap().clusters.values().cloned().collect())
    }

    fn get_servers(&self) -> Result<Vec<ServerSpec>> {
        Ok(self.state.lock().unwrap().servers.values().cloned().collect())
    }

    fn get_binds(&self) -> Result<Vec<Bind>> {
        Ok(self.state.lock().unwrap().binds.values().cloned().collect())
    }

    fn get_apis(&self) -> Result<Vec<ApiSpec>> {
        Ok(self.state.lock().unwrap().apis.values().cloned().collect())
    }

    fn get_routings(&self) -> Result<Vec<RoutingSpec>> {
        Ok(self.state.lock().unwrap().routings.values().cloned().collect())
    }

    fn save_cluster(&self, cluster: ClusterSpec) -> Result<()> {
        let key = cluster.name.clone();
        let existed = {
            let mut state = self.state.lock().unwrap();
            state.clusters.insert(key.clone(), cluster.clone()).is_some()
        };
        self.publish(Event {
            src: EventSrc::Cluster,
            kind: Self::save_kind(existed),
            key,
            value: Some(EntityValue::Cluster(cluster)),
        });
        Ok(())
    }

    fn delete_cluster(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().clusters.remove(name);
        self.publish(Event {
            src: EventSrc::Cluster,
            kind: EventKind::Delete,
            key: name.to_string(),
            value: None,
        });
        Ok(())
    }

    fn save_server(&self, server: ServerSpec) -> Result<()> {
        let key = server.addr.clone();
        let existed = {
            let mut state = self.state.lock().unwrap();
            state.servers.insert(key.clone(), server.clone()).is_some()
        };
        self.publish(Event {
            src: EventSrc::Server,
            kind: Self::save_kind(existed),
            key,
            value: Some(EntityValue::Server(server)),
        });
        Ok(())
    }

    fn delete_server(&self, addr: &str) -> Result<()> {
        self.state.lock().unwrap().servers.remove(addr);
        self.publish(Event {
            src: EventSrc::Server,
            kind: EventKind::Delete,
            key: addr.to_string(),
            value: None,
        });
        Ok(())
    }

    fn save_bind(&self, bind: Bind) -> Result<()> {
        let key = bind.key();
        {
            let mut state = self.state.lock().unwrap();
            state.binds.insert(key.clone(), bind.clone());
        }
        self.publish(Event {
            src: EventSrc::Bind,
            kind: EventKind::New,
            key,
            value: Some(EntityValue::Bind(bind)),
        });
        Ok(())
    }

    fn delete_bind(&self, bind: &Bind) -> Result<()> {
        self.state.lock().unwrap().binds.remove(&bind.key());
        self.publish(Event {
            src: EventSrc::Bind,
            kind: EventKind::Delete,
            key: bind.key(),
            value: Some(EntityValue::Bind(bind.clone())),
        });
        Ok(())
    }

    fn save_api(&self, api: ApiSpec) -> Result<()> {
        let key = api_key(&api.url, &api.method);
        let existed = {
            let mut state = self.state.lock().unwrap();
            state.apis.insert(key.clone(), api.clone()).is_some()
        };
        self.publish(Event {
            src: EventSrc::Api,
            kind: Self::save_kind(existed),
            key,
            value: Some(EntityValue::Api(api)),
        });
        Ok(())
    }

    fn delete_api(&self, url: &str, method: &str) -> Result<()> {
        let key = api_key(url, method);
        self.state.lock().unwrap().apis.remove(&key);
        self.publish(Event {
            src: EventSrc::Api,
            kind: EventKind::Delete,
            key,
            value: None,
        });
        Ok(())
    }

    fn save_routing(&self, routing: RoutingSpec) -> Result<()> {
        let key = routing.id.clone();
        let existed = {
            let mut state = self.state.lock().unwrap();
            state.routings.insert(key.clone(), routing.clone()).is_some()
        };
        self.publish(Event {
            src: EventSrc::Routing,
            kind: Self::save_kind(existed),
            key,
            value: Some(EntityValue::Routing(routing)),
        });
        Ok(())
    }

    fn delete_routing(&self, id: &str) -> Result<()> {
        self.state.lock().unwrap().routings.remove(id);
        self.publish(Event {
            src: EventSrc::Routing,
            kind: EventKind::Delete,
            key: id.to_string(),
            value: None,
        });
        Ok(())
    }

    fn watch(&self, sink: mpsc::Sender<Event>, mut stop: oneshot::Receiver<()>) -> Result<()> {
        let mut source = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop => {
                        info!("store: watch stopped");
                        return;
                    }
                    received = source.recv() => match received {
                        Ok(event) => {
                            if sink.send(event).await.is_err() {
                                debug!("store: watch sink closed");
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            error!("store: watch lagged, {} events dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            error!("store: watch source closed");
                            return;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn registry(&self, proxy: &ProxyInfo) -> Result<()> {
        let key = format!("{}/proxies/{}", self.prefix, proxy.mgr_addr);
        self.state
            .lock()
            .unwrap()
            .proxies
            .insert(key.clone(), proxy.clone());
        info!("store: proxy registered at <{}>", key);
        Ok(())
    }
}

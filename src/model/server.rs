use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Default interval between health checks, seconds
pub const DEFAULT_CHECK_DURATION_SECS: u64 = 5;
/// Default timeout for a single health probe, seconds
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 3;

/// Backend health as determined by the active probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    Down,
    Up,
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        match s {
            Status::Down => 0,
            Status::Up => 1,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(Status::Down),
            1 => Ok(Status::Up),
            other => Err(format!("invalid status: {}", other)),
        }
    }
}

/// Circuit state. Open admits traffic, Close rejects, Half probes with a
/// fraction of traffic. The naming follows the admin UI, which is inverted
/// from the usual circuit-breaker terminology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Circuit {
    Open,
    Half,
    Close,
}

impl Circuit {
    fn from_u8(v: u8) -> Circuit {
        match v {
            0 => Circuit::Open,
            1 => Circuit::Half,
            _ => Circuit::Close,
        }
    }
}

/// Server definition as stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSpec {
    pub schema: String,
    pub addr: String,
    /// Created from external service discovery; never probed, pinned Up
    pub external: bool,
    pub check_path: String,
    /// Expected probe response body; empty means status-only check
    pub check_body: String,
    /// Probe interval, seconds
    pub check_duration: u64,
    /// Probe timeout, seconds
    pub check_timeout: u64,
    pub status: Status,
    #[serde(rename = "maxQPS")]
    pub max_qps: u32,
    pub half_to_open_seconds: u64,
    pub half_traffic_rate: u32,
    pub half_to_open_succeed_rate: u32,
    pub half_to_open_collect_seconds: u64,
    pub open_to_close_failure_rate: u32,
    pub open_to_close_collect_seconds: u64,
    pub bind_clusters: Vec<String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            schema: "http".to_string(),
            addr: String::new(),
            external: false,
            check_path: String::new(),
            check_body: String::new(),
            check_duration: 0,
            check_timeout: 0,
            status: Status::Down,
            max_qps: 0,
            half_to_open_seconds: 0,
            half_traffic_rate: 0,
            half_to_open_succeed_rate: 0,
            half_to_open_collect_seconds: 0,
            open_to_close_failure_rate: 0,
            open_to_close_collect_seconds: 0,
            bind_clusters: Vec::new(),
        }
    }
}

impl ServerSpec {
    /// Parse from registry JSON, filling defaulted fields
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut spec: ServerSpec = serde_json::from_slice(data)?;
        spec.fill_defaults();
        Ok(spec)
    }

    pub fn fill_defaults(&mut self) {
        if self.schema.is_empty() {
            self.schema = "http".to_string();
        }
        if self.check_duration == 0 {
            self.check_duration = DEFAULT_CHECK_DURATION_SECS;
        }
        if self.check_timeout == 0 {
            self.check_timeout = DEFAULT_CHECK_TIMEOUT_SECS;
        }
    }
}

/// Breaker tunables, snapshotted under one lock acquisition
#[derive(Debug, Clone, Copy)]
pub struct BreakerParams {
    pub max_qps: u32,
    pub half_to_open_seconds: u64,
    pub half_traffic_rate: u32,
    pub half_to_open_succeed_rate: u32,
    pub half_to_open_collect_seconds: u64,
    pub open_to_close_failure_rate: u32,
    pub open_to_close_collect_seconds: u64,
}

/// Runtime state of a backend server. Identity fields (addr, schema,
/// external) are immutable; tunables mutate under the spec lock, health and
/// circuit state through atomics so the selection path never blocks on them.
pub struct Server {
    pub addr: String,
    pub schema: String,
    pub external: bool,

    spec: Mutex<ServerSpec>,

    status: AtomicU8,
    prev_status: AtomicU8,
    circuit: AtomicU8,

    check_fail_count: AtomicU32,
    use_check_duration_secs: AtomicU64,
    check_stopped: AtomicBool,

    tripped_at: Mutex<Option<Instant>>,
    half_since: Mutex<Option<Instant>>,

    probe: reqwest::Client,
}

impl Server {
    pub fn new(mut spec: ServerSpec) -> Result<Self> {
        spec.fill_defaults();

        let probe = reqwest::Client::builder()
            .timeout(Duration::from_secs(spec.check_timeout))
            .build()
            .map_err(|e| GatewayError::Internal(format!("probe client: {}", e)))?;

        Ok(Self {
            addr: spec.addr.clone(),
            schema: spec.schema.clone(),
            external: spec.external,
            status: AtomicU8::new(Status::Down.into()),
            prev_status: AtomicU8::new(Status::Down.into()),
            circuit: AtomicU8::new(0),
            check_fail_count: AtomicU32::new(0),
            use_check_duration_secs: AtomicU64::new(spec.check_duration),
            check_stopped: AtomicBool::new(false),
            tripped_at: Mutex::new(None),
            half_since: Mutex::new(None),
            probe,
            spec: Mutex::new(spec),
        })
    }

    /// Serializable snapshot, carrying the current status
    pub fn spec(&self) -> ServerSpec {
        let mut spec = self.spec.lock().unwrap().clone();
        spec.status = self.status();
        spec
    }

    pub fn breaker(&self) -> BreakerParams {
        let spec = self.spec.lock().unwrap();
        BreakerParams {
            max_qps: spec.max_qps,
            half_to_open_seconds: spec.half_to_open_seconds,
            half_traffic_rate: spec.half_traffic_rate,
            half_to_open_succeed_rate: spec.half_to_open_succeed_rate,
            half_to_open_collect_seconds: spec.half_to_open_collect_seconds,
            open_to_close_failure_rate: spec.open_to_close_failure_rate,
            open_to_close_collect_seconds: spec.open_to_close_collect_seconds,
        }
    }

    /// Merge the mutable tunables from an updated spec; identity keys and
    /// check settings are not touched.
    pub fn update_from(&self, other: &ServerSpec) {
        let mut spec = self.spec.lock().unwrap();
        spec.max_qps = other.max_qps;
        spec.half_to_open_seconds = other.half_to_open_seconds;
        spec.half_traffic_rate = other.half_traffic_rate;
        spec.half_to_open_succeed_rate = other.half_to_open_succeed_rate;
        spec.half_to_open_collect_seconds = other.half_to_open_collect_seconds;
        spec.open_to_close_failure_rate = other.open_to_close_failure_rate;
        spec.open_to_close_collect_seconds = other.open_to_close_collect_seconds;
    }

    pub fn status(&self) -> Status {
        Status::try_from(self.status.load(Ordering::Acquire)).unwrap_or(Status::Down)
    }

    pub fn change_to(&self, status: Status) {
        self.prev_status
            .store(self.status.load(Ordering::Acquire), Ordering::Release);
        self.status.store(status.into(), Ordering::Release);
    }

    pub fn status_changed(&self) -> bool {
        self.prev_status.load(Ordering::Acquire) != self.status.load(Ordering::Acquire)
    }

    pub fn circuit(&self) -> Circuit {
        Circuit::from_u8(self.circuit.load(Ordering::Acquire))
    }

    /// Healthy breaker: admit all traffic
    pub fn open_circuit(&self) {
        self.circuit.store(0, Ordering::Release);
        *self.tripped_at.lock().unwrap() = None;
        *self.half_since.lock().unwrap() = None;
    }

    /// Probing: admit a fraction of traffic
    pub fn half_circuit(&self) {
        self.circuit.store(1, Ordering::Release);
        *self.half_since.lock().unwrap() = Some(Instant::now());
    }

    /// Tripped breaker: reject all traffic
    pub fn close_circuit(&self) {
        self.circuit.store(2, Ordering::Release);
        *self.tripped_at.lock().unwrap() = Some(Instant::now());
        *self.half_since.lock().unwrap() = None;
    }

    pub fn tripped_elapsed(&self) -> Option<Duration> {
        self.tripped_at.lock().unwrap().map(|t| t.elapsed())
    }

    pub fn half_elapsed(&self) -> Option<Duration> {
        self.half_since.lock().unwrap().map(|t| t.elapsed())
    }

    pub fn stop_check(&self) {
        self.check_stopped.store(true, Ordering::Release);
    }

    pub fn check_stopped(&self) -> bool {
        self.check_stopped.load(Ordering::Acquire)
    }

    /// Current probe interval, grown geometrically on consecutive failures
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.use_check_duration_secs.load(Ordering::Acquire))
    }

    pub fn check_fail_count(&self) -> u32 {
        self.check_fail_count.load(Ordering::Acquire)
    }

    /// Run one active health probe. Success is a 200 response whose body
    /// matches the configured expectation. Adjusts the fail counter and the
    /// back-off interval.
    pub async fn check(&self) -> bool {
        let (url, expected) = {
            let spec = self.spec.lock().unwrap();
            (
                format!("{}://{}{}", spec.schema, spec.addr, spec.check_path),
                spec.check_body.clone(),
            )
        };

        debug!("meta: server <{}> start check", self.addr);

        let ok = self.do_check(&url, &expected).await;
        if ok {
            self.reset_check();
        } else {
            self.fail_check();
        }
        ok
    }

    async fn do_check(&self, url: &str, expected: &str) -> bool {
        let resp = match self.probe.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    "meta: server <{}, {}> check failed: {}",
                    self.addr,
                    self.check_fail_count() + 1,
                    e
                );
                return false;
            }
        };

        if resp.status() != reqwest::StatusCode::OK {
            warn!(
                "meta: server <{}, {}, {}> check failed",
                self.addr,
                resp.status(),
                self.check_fail_count() + 1
            );
            return false;
        }

        if expected.is_empty() {
            return true;
        }

        match resp.text().await {
            Ok(body) => body == expected,
            Err(_) => false,
        }
    }

    fn fail_check(&self) {
        self.check_fail_count.fetch_add(1, Ordering::AcqRel);
        let current = self.use_check_duration_secs.load(Ordering::Acquire);
        self.use_check_duration_secs
            .store(current + current / 2, Ordering::Release);
    }

    fn reset_check(&self) {
        self.check_fail_count.store(0, Ordering::Release);
        let base = self.spec.lock().unwrap().check_duration;
        self.use_check_duration_secs.store(base, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(addr: &str) -> ServerSpec {
        ServerSpec {
            addr: addr.to_string(),
            check_path: "/check".to_string(),
            check_duration: 4,
            max_qps: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_spec_round_trip_fills_check_timeout() {
        let raw = r#"{"addr":"127.0.0.1:9001","schema":"http","checkPath":"/check","checkDuration":5,"maxQPS":100}"#;
        let spec = ServerSpec::from_json(raw.as_bytes()).unwrap();
        assert_eq!(spec.check_timeout, DEFAULT_CHECK_TIMEOUT_SECS);

        let encoded = serde_json::to_vec(&spec).unwrap();
        let again = ServerSpec::from_json(&encoded).unwrap();
        assert_eq!(spec, again);
    }

    #[test]
    fn test_backoff_is_geometric() {
        let svr = Server::new(spec("127.0.0.1:9001")).unwrap();
        assert_eq!(svr.check_interval(), Duration::from_secs(4));

        svr.fail_check();
        assert_eq!(svr.check_interval(), Duration::from_secs(6));
        svr.fail_check();
        assert_eq!(svr.check_interval(), Duration::from_secs(9));
        svr.fail_check();
        assert_eq!(svr.check_interval(), Duration::from_secs(13));
        assert_eq!(svr.check_fail_count(), 3);

        svr.reset_check();
        assert_eq!(svr.check_interval(), Duration::from_secs(4));
        assert_eq!(svr.check_fail_count(), 0);
    }

    #[test]
    fn test_status_change_tracking() {
        let svr = Server::new(spec("127.0.0.1:9001")).unwrap();
        assert_eq!(svr.status(), Status::Down);
        assert!(!svr.status_changed());

        svr.change_to(Status::Up);
        assert_eq!(svr.status(), Status::Up);
        assert!(svr.status_changed());

        svr.change_to(Status::Up);
        assert!(!svr.status_changed());
    }

    #[test]
    fn test_update_from_only_touches_tunables() {
        let svr = Server::new(spec("127.0.0.1:9001")).unwrap();

        let mut updated = spec("10.0.0.1:9999");
        updated.max_qps = 7;
        updated.open_to_close_failure_rate = 50;
        svr.update_from(&updated);

        let snapshot = svr.spec();
        assert_eq!(snapshot.addr, "127.0.0.1:9001");
        assert_eq!(snapshot.max_qps, 7);
        assert_eq!(snapshot.open_to_close_failure_rate, 50);
    }

    #[test]
    fn test_circuit_transitions() {
        let svr = Server::new(spec("127.0.0.1:9001")).unwrap();
        assert_eq!(svr.circuit(), Circuit::Open);
        assert!(svr.tripped_elapsed().is_none());

        svr.close_circuit();
        assert_eq!(svr.circuit(), Circuit::Close);
        assert!(svr.tripped_elapsed().is_some());

        svr.half_circuit();
        assert_eq!(svr.circuit(), Circuit::Half);
        assert!(svr.half_elapsed().is_some());

        svr.open_circuit();
        assert_eq!(svr.circuit(), Circuit::Open);
        assert!(svr.tripped_elapsed().is_none());
    }
}

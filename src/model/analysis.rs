use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Per-backend sliding-window traffic counters.
///
/// Each backend owns a set of windows keyed by duration. A window is a ring
/// of per-second buckets; the shared 1 s ticker advances every ring and
/// zeroes the new head, so queries aggregate the completed buckets only.
pub struct Analysis {
    points: DashMap<String, Arc<Point>>,
}

struct Point {
    windows: RwLock<HashMap<u64, Arc<Window>>>,
}

struct Window {
    buckets: Vec<Bucket>,
    head: AtomicUsize,
}

#[derive(Default)]
struct Bucket {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejects: AtomicU64,
    elapsed_nanos: AtomicU64,
}

impl Bucket {
    fn clear(&self) {
        self.requests.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.rejects.store(0, Ordering::Release);
        self.elapsed_nanos.store(0, Ordering::Release);
    }
}

impl Window {
    fn new(secs: u64) -> Self {
        let len = secs as usize + 1;
        Self {
            buckets: (0..len).map(|_| Bucket::default()).collect(),
            head: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> &Bucket {
        &self.buckets[self.head.load(Ordering::Acquire)]
    }

    fn advance(&self) {
        let next = (self.head.load(Ordering::Acquire) + 1) % self.buckets.len();
        self.buckets[next].clear();
        self.head.store(next, Ordering::Release);
    }

    fn aggregate(&self) -> WindowTotals {
        let head = self.head.load(Ordering::Acquire);
        let mut totals = WindowTotals::default();
        for (i, bucket) in self.buckets.iter().enumerate() {
            if i == head {
                continue;
            }
            totals.requests += bucket.requests.load(Ordering::Acquire);
            totals.successes += bucket.successes.load(Ordering::Acquire);
            totals.failures += bucket.failures.load(Ordering::Acquire);
            totals.rejects += bucket.rejects.load(Ordering::Acquire);
            totals.elapsed_nanos += bucket.elapsed_nanos.load(Ordering::Acquire);
        }
        totals
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WindowTotals {
    requests: u64,
    successes: u64,
    failures: u64,
    rejects: u64,
    elapsed_nanos: u64,
}

/// Aggregated view of one window, as served by the management API
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
    pub avg_ms: f64,
}

impl Analysis {
    pub fn new() -> Self {
        Self {
            points: DashMap::new(),
        }
    }

    /// Start the shared ticker that advances every ring once per second
    pub fn start_ticker(self: &Arc<Self>) {
        let analysis = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                analysis.advance_all();
            }
        });
    }

    pub fn add_point(&self, addr: &str) {
        self.points
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Point {
                windows: RwLock::new(HashMap::new()),
            }));
    }

    pub fn remove_point(&self, addr: &str) {
        self.points.remove(addr);
    }

    /// Register a window of `secs` seconds for the backend
    pub fn add_recent_count(&self, addr: &str, secs: u64) {
        if secs == 0 {
            return;
        }

        self.add_point(addr);
        if let Some(point) = self.points.get(addr) {
            let mut windows = point.windows.write().unwrap();
            windows
                .entry(secs)
                .or_insert_with(|| Arc::new(Window::new(secs)));
            debug!("analysis: point <{}> window <{}s> added", addr, secs);
        }
    }

    pub fn request(&self, addr: &str) {
        self.record(addr, |b| {
            b.requests.fetch_add(1, Ordering::AcqRel);
        });
    }

    pub fn response(&self, addr: &str, code: u16, latency: Duration) {
        self.record(addr, |b| {
            if code < 500 {
                b.successes.fetch_add(1, Ordering::AcqRel);
            }
            b.elapsed_nanos
                .fetch_add(latency.as_nanos() as u64, Ordering::AcqRel);
        });
    }

    pub fn reject(&self, addr: &str) {
        self.record(addr, |b| {
            b.rejects.fetch_add(1, Ordering::AcqRel);
        });
    }

    pub fn failure(&self, addr: &str) {
        self.record(addr, |b| {
            b.failures.fetch_add(1, Ordering::AcqRel);
        });
    }

    pub fn recently_request_count(&self, addr: &str, secs: u64) -> u64 {
        self.totals(addr, secs).map(|t| t.requests).unwrap_or(0)
    }

    pub fn recently_reject_count(&self, addr: &str, secs: u64) -> u64 {
        self.totals(addr, secs).map(|t| t.rejects).unwrap_or(0)
    }

    /// Percentage of requests answered below 500, None without traffic
    pub fn recently_success_rate(&self, addr: &str, secs: u64) -> Option<f64> {
        let totals = self.totals(addr, secs)?;
        if totals.requests == 0 {
            return None;
        }
        Some(totals.successes as f64 * 100.0 / totals.requests as f64)
    }

    /// Percentage of requests that failed, None without traffic
    pub fn recently_failure_rate(&self, addr: &str, secs: u64) -> Option<f64> {
        let totals = self.totals(addr, secs)?;
        if totals.requests == 0 {
            return None;
        }
        Some(totals.failures as f64 * 100.0 / totals.requests as f64)
    }

    /// Mean backend service time over the window, None without traffic
    pub fn recently_avg_service_time(&self, addr: &str, secs: u64) -> Option<Duration> {
        let totals = self.totals(addr, secs)?;
        if totals.successes == 0 {
            return None;
        }
        Some(Duration::from_nanos(totals.elapsed_nanos / totals.successes))
    }

    pub fn report(&self, addr: &str, secs: u64) -> Option<AnalysisReport> {
        let totals = self.totals(addr, secs)?;
        let avg_ms = if totals.successes == 0 {
            0.0
        } else {
            totals.elapsed_nanos as f64 / totals.successes as f64 / 1_000_000.0
        };
        Some(AnalysisReport {
            requests: totals.requests,
            successes: totals.successes,
            failures: totals.failures,
            rejects: totals.rejects,
            avg_ms,
        })
    }

    fn record(&self, addr: &str, op: impl Fn(&Bucket)) {
        if let Some(point) = self.points.get(addr) {
            let windows = point.windows.read().unwrap();
            for window in windows.values() {
                op(window.current());
            }
        }
    }

    fn totals(&self, addr: &str, secs: u64) -> Option<WindowTotals> {
        let point = self.points.get(addr)?;
        let windows = point.windows.read().unwrap();
        windows.get(&secs).map(|w| w.aggregate())
    }

    pub(crate) fn advance_all(&self) {
        for point in self.points.iter() {
            let windows = point.windows.read().unwrap();
            for window in windows.values() {
                window.advance();
            }
        }
    }
}

impl Default for Analysis {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "127.0.0.1:9001";

    fn with_window(secs: u64) -> Analysis {
        let a = Analysis::new();
        a.add_recent_count(ADDR, secs);
        a
    }

    #[test]
    fn test_head_bucket_is_excluded_until_advanced() {
        let a = with_window(10);
        a.request(ADDR);
        a.request(ADDR);

        assert_eq!(a.recently_request_count(ADDR, 10), 0);

        a.advance_all();
        assert_eq!(a.recently_request_count(ADDR, 10), 2);
    }

    #[test]
    fn test_rates() {
        let a = with_window(10);
        for _ in 0..4 {
            a.request(ADDR);
        }
        a.response(ADDR, 200, Duration::from_millis(10));
        a.response(ADDR, 404, Duration::from_millis(30));
        a.failure(ADDR);
        a.failure(ADDR);
        a.advance_all();

        assert_eq!(a.recently_success_rate(ADDR, 10), Some(50.0));
        assert_eq!(a.recently_failure_rate(ADDR, 10), Some(50.0));
        assert_eq!(
            a.recently_avg_service_time(ADDR, 10),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn test_empty_window_has_no_rates() {
        let a = with_window(10);
        assert_eq!(a.recently_success_rate(ADDR, 10), None);
        assert_eq!(a.recently_failure_rate(ADDR, 10), None);
        assert_eq!(a.recently_request_count(ADDR, 10), 0);
    }

    #[test]
    fn test_ring_expires_old_buckets() {
        let a = with_window(2);
        a.request(ADDR);
        a.advance_all();
        assert_eq!(a.recently_request_count(ADDR, 2), 1);

        // the ring holds two completed seconds; two more advances push the
        // recorded bucket back under the head
        a.advance_all();
        a.advance_all();
        assert_eq!(a.recently_request_count(ADDR, 2), 0);
    }

    #[test]
    fn test_rejects_tracked_separately() {
        let a = with_window(5);
        a.reject(ADDR);
        a.reject(ADDR);
        a.advance_all();

        assert_eq!(a.recently_reject_count(ADDR, 5), 2);
        assert_eq!(a.recently_request_count(ADDR, 5), 0);
    }

    #[test]
    fn test_unknown_window_reports_nothing() {
        let a = with_window(5);
        assert!(a.report(ADDR, 30).is_none());
        assert!(a.report("unknown", 5).is_none());
    }
}

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

/// Keyed timer: scheduling a key that is already pending replaces the prior
/// deadline, so there is at most one outstanding fire per key. Used by the
/// route table to drive health checks, keyed by server address.
pub struct KeyedTimer {
    entries: Arc<DashMap<String, u64>>,
    next_gen: AtomicU64,
}

impl KeyedTimer {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_gen: AtomicU64::new(0),
        }
    }

    /// Schedule `fire` to run after `delay`, replacing any pending entry for
    /// the same key.
    pub fn schedule<F>(&self, key: &str, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gen = self.next_gen.fetch_add(1, Ordering::AcqRel) + 1;
        self.entries.insert(key.to_string(), gen);

        let entries = Arc::clone(&self.entries);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // superseded or cancelled entries must not fire
            if entries.remove_if(&key, |_, g| *g == gen).is_some() {
                fire.await;
            }
        });
    }

    pub fn cancel(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl Default for KeyedTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_fires_once() {
        let timer = KeyedTimer::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        timer.schedule("a", Duration::from_millis(10), async move {
            f.fetch_add(1, Ordering::AcqRel);
        });

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(!timer.is_scheduled("a"));
    }

    #[tokio::test]
    async fn test_reschedule_replaces_pending_entry() {
        let timer = KeyedTimer::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        timer.schedule("a", Duration::from_millis(10), async move {
            f.fetch_add(1, Ordering::AcqRel);
        });
        let f = Arc::clone(&fired);
        timer.schedule("a", Duration::from_millis(30), async move {
            f.fetch_add(10, Ordering::AcqRel);
        });

        sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::Acquire), 10);
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let timer = KeyedTimer::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        timer.schedule("a", Duration::from_millis(20), async move {
            f.fetch_add(1, Ordering::AcqRel);
        });
        timer.cancel("a");

        sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::Acquire), 0);
    }
}

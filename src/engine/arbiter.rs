//! Per-device bus arbitration
//!
//! Several nodes can read different channels of one converter. The arbiter
//! hands out one async mutex per [`DeviceKey`] so their transactions never
//! interleave:
//!
//! - Waiters on one key are served in arrival order (tokio's mutex is fair).
//! - A waiter that times out is removed from the queue and never blocks the
//!   waiters behind it.
//! - Distinct keys are fully independent.
//! - The transaction runs on the blocking thread pool and owns the lock
//!   guard, so the lock is released when the transaction returns or panics,
//!   even if the awaiting task was dropped.
//!
//! Acquiring the same key again from inside a transaction deadlocks until
//! the timeout; transactions must not nest.

use crate::error::{EngineError, Result};
use crate::types::DeviceKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as BusLock;

#[derive(Default)]
struct KeySlot {
    lock: Arc<BusLock<()>>,
    /// Nodes currently configured against this key
    reservations: BTreeSet<u32>,
}

/// Serializes transactions against shared bus resources
#[derive(Default)]
pub struct BusArbiter {
    slots: Mutex<HashMap<DeviceKey, KeySlot>>,
}

impl BusArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DeviceKey, KeySlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `node` reads through `key`
    pub fn reserve(&self, key: DeviceKey, node: u32) {
        let mut slots = self.slots();
        let slot = slots.entry(key).or_default();
        if slot.reservations.insert(node) {
            tracing::debug!(key = %key, node, holders = slot.reservations.len(), "Bus reservation acquired");
        }
    }

    /// Drop `node`'s reservation on `key`
    pub fn release(&self, key: DeviceKey, node: u32) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&key) {
            if slot.reservations.remove(&node) {
                tracing::debug!(key = %key, node, holders = slot.reservations.len(), "Bus reservation released");
            }
        }
        Self::prune(&mut slots, key);
    }

    /// Nodes holding a reservation on `key`
    pub fn reservations(&self, key: DeviceKey) -> Vec<u32> {
        self.slots()
            .get(&key)
            .map(|s| s.reservations.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of keys with live lock state
    pub fn key_count(&self) -> usize {
        self.slots().len()
    }

    /// Remove the slot for `key` once nothing reserves or uses it
    fn prune(slots: &mut HashMap<DeviceKey, KeySlot>, key: DeviceKey) {
        let idle = slots
            .get(&key)
            .map(|s| s.reservations.is_empty() && Arc::strong_count(&s.lock) == 1)
            .unwrap_or(false);
        if idle {
            slots.remove(&key);
        }
    }

    /// Run `f` with exclusive access to `key`
    ///
    /// Returns [`EngineError::BusTimeout`] if the lock is not obtained
    /// within `timeout`. `f` runs on the blocking thread pool.
    pub async fn with_lock<T, F>(&self, key: DeviceKey, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let lock = self.slots().entry(key).or_default().lock.clone();

        let acquired = tokio::time::timeout(timeout, lock.clone().lock_owned()).await;
        let result = match acquired {
            Ok(guard) => {
                tracing::trace!(key = %key, "Bus lock acquired");
                tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    f()
                })
                .await
                .unwrap_or_else(|e| {
                    Err(EngineError::HardwareRead(format!(
                        "{}: transaction aborted: {}",
                        key, e
                    )))
                })
            }
            Err(_) => Err(EngineError::BusTimeout {
                key: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        let mut slots = self.slots();
        drop(lock);
        Self::prune(&mut slots, key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: DeviceKey = DeviceKey::I2c {
        bus: 1,
        address: 0x48,
    };

    #[test]
    fn test_reservations_track_nodes() {
        let arbiter = BusArbiter::new();
        arbiter.reserve(KEY, 1);
        arbiter.reserve(KEY, 2);
        arbiter.reserve(KEY, 2);
        assert_eq!(arbiter.reservations(KEY), vec![1, 2]);

        arbiter.release(KEY, 1);
        assert_eq!(arbiter.reservations(KEY), vec![2]);
        assert_eq!(arbiter.key_count(), 1);

        arbiter.release(KEY, 2);
        assert_eq!(arbiter.key_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialized() {
        let arbiter = Arc::new(BusArbiter::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let arbiter = arbiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                arbiter
                    .with_lock(KEY, Duration::from_secs(5), move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.key_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_when_held() {
        let arbiter = Arc::new(BusArbiter::new());

        let holder = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .with_lock(KEY, Duration::from_secs(1), || {
                        std::thread::sleep(Duration::from_millis(200));
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = arbiter
            .with_lock(KEY, Duration::from_millis(10), || Ok(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BusTimeout { timeout_ms: 10, .. }));

        assert_eq!(holder.await.unwrap().unwrap(), 1);
        // Lock is usable again after the timed-out waiter left
        assert_eq!(
            arbiter
                .with_lock(KEY, Duration::from_millis(100), || Ok(3))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_releases_lock() {
        let arbiter = BusArbiter::new();
        let err = arbiter
            .with_lock(KEY, Duration::from_millis(100), || -> Result<()> {
                panic!("transaction blew up")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::HardwareRead(_)));

        let ok = arbiter
            .with_lock(KEY, Duration::from_millis(100), || Ok("after"))
            .await
            .unwrap();
        assert_eq!(ok, "after");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_keys_run_in_parallel() {
        let arbiter = Arc::new(BusArbiter::new());
        let other = DeviceKey::Spi {
            bus: 0,
            chip_select: 8,
        };
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let run = |key: DeviceKey| {
            let arbiter = arbiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                arbiter
                    .with_lock(key, Duration::from_secs(2), move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(100));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        };
        let a = run(KEY);
        let b = run(other);
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reserved_key_survives_idle() {
        let arbiter = BusArbiter::new();
        arbiter.reserve(KEY, 9);
        arbiter
            .with_lock(KEY, Duration::from_millis(50), || Ok(()))
            .await
            .unwrap();
        assert_eq!(arbiter.key_count(), 1);
        assert_eq!(arbiter.reservations(KEY), vec![9]);
    }
}

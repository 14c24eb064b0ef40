//! Per-backend admission control for tablet ingest requests.
//!
//! Every destination backend gets one [`ConcurrencyWindow`]. A caller holds
//! an [`OwnedSemaphorePermit`] for the duration of one ingest RPC; dropping
//! the permit releases the slot and wakes one waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, SyncError};

pub const DEFAULT_MAX_INGEST_CONCURRENCY: usize = 48;

/// Bounded gate for one backend id.
#[derive(Debug)]
pub struct ConcurrencyWindow {
    id: i64,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyWindow {
    pub fn new(id: i64, limit: usize) -> Self {
        Self {
            id,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait until fewer than `limit` requests are in flight, then take a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.map_err(|_| {
            SyncError::normal(format!("concurrency window of backend {} is closed", self.id))
        })
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}

/// Lazily created windows keyed by backend id.
#[derive(Debug)]
pub struct ConcurrencyManager {
    limit: usize,
    windows: Mutex<HashMap<i64, Arc<ConcurrencyWindow>>>,
}

impl ConcurrencyManager {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_window(&self, backend_id: i64) -> Arc<ConcurrencyWindow> {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        windows
            .entry(backend_id)
            .or_insert_with(|| Arc::new(ConcurrencyWindow::new(backend_id, self.limit)))
            .clone()
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INGEST_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn window_is_shared_per_backend() {
        let manager = ConcurrencyManager::new(2);
        let a = manager.get_window(10);
        let b = manager.get_window(10);
        let c = manager.get_window(11);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.limit(), 2);
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let window = Arc::new(ConcurrencyWindow::new(1, 1));
        let first = window.acquire().await.unwrap();
        assert_eq!(window.in_flight(), 1);

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move {
                let _permit = window.acquire().await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert_eq!(window.in_flight(), 0);
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let window = Arc::new(ConcurrencyWindow::new(7, 3));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let window = window.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = window.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(window.in_flight(), 0);
    }
}

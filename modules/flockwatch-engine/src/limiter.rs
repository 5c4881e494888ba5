use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded-parallelism gate for upstream timeline fetches, independent of
/// stage worker concurrency. FIFO-fair: waiters are granted slots in
/// arrival order. The returned permit releases its slot on drop, so a
/// failing fetch can never leak a slot.
#[derive(Clone)]
pub struct FetchLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl FetchLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. Hold the permit for the duration of the fetch.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("Fetch limiter semaphore closed"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free (for logging/metrics).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test(start_paused = true)]
    async fn caps_concurrency_and_serves_fifo() {
        let limiter = FetchLimiter::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5usize {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                order.lock().unwrap().push(i);
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
            // Stagger spawns so arrival order is deterministic.
            sleep(Duration::from_millis(1)).await;
        }

        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "more than 2 slots granted");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn permit_drop_frees_slot() {
        let limiter = FetchLimiter::new(1);
        {
            let _permit = limiter.acquire().await.unwrap();
            assert_eq!(limiter.available(), 0);
        }
        assert_eq!(limiter.available(), 1);
    }
}

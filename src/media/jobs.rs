//! Admission control for conversions
//!
//! A semaphore bounds how many conversions (and searches) run at once and a
//! waiting counter bounds how many may queue behind them. Per-key locks
//! serialize requests for the same source so the second one finds the
//! finished file.

use super::error::MediaError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct JobStats {
    active: AtomicUsize,
    waiting: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the job counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobSnapshot {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub max_concurrent: usize,
    pub max_queued: usize,
}

type KeyLocks = DashMap<String, Arc<Mutex<()>>>;

pub struct JobRegistry {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    max_queued: usize,
    stats: Arc<JobStats>,
    locks: Arc<KeyLocks>,
}

/// Held while a conversion runs
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<JobStats>,
    recorded: bool,
}

impl JobPermit {
    /// Record the outcome of the job holding this permit
    pub fn finish(mut self, success: bool) {
        if self.recorded {
            return;
        }
        let counter = if success {
            &self.stats.completed
        } else {
            &self.stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.recorded = true;
    }
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        if !self.recorded {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A place in the wait queue, given back on drop (including cancellation)
struct QueueSlot<'a> {
    stats: &'a JobStats,
}

impl<'a> QueueSlot<'a> {
    fn take(stats: &'a JobStats, max_queued: usize) -> Result<Self, MediaError> {
        let waiting = stats.waiting.fetch_add(1, Ordering::AcqRel);
        let slot = Self { stats };
        if waiting >= max_queued {
            return Err(MediaError::Busy);
        }
        Ok(slot)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.stats.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive hold on one media key
pub struct KeyLock {
    key: String,
    locks: Arc<KeyLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Release first so the entry's only remaining owner is the map
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl JobRegistry {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_queued,
            stats: Arc::new(JobStats::default()),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock_key(&self, key: &str) -> KeyLock {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        KeyLock {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Wait for a conversion slot, or fail fast when the queue is full
    pub async fn acquire(&self) -> Result<JobPermit, MediaError> {
        self.admit(false).await
    }

    /// Slot for a search: limited like a conversion, left out of the
    /// completed/failed counters
    pub async fn acquire_lookup(&self) -> Result<JobPermit, MediaError> {
        self.admit(true).await
    }

    async fn admit(&self, uncounted: bool) -> Result<JobPermit, MediaError> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let _slot = QueueSlot::take(&self.stats, self.max_queued)?;
                // The semaphore is never closed
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| MediaError::Busy)?
            }
        };

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        Ok(JobPermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
            recorded: uncounted,
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            active: self.stats.active.load(Ordering::Relaxed),
            queued: self.stats.waiting.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
            max_queued: self.max_queued,
        }
    }

    /// Number of keys currently locked or waited on
    pub fn locked_keys(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_and_counters() {
        let jobs = JobRegistry::new(2, 4);

        let a = jobs.acquire().await.unwrap();
        let b = jobs.acquire().await.unwrap();
        assert_eq!(jobs.snapshot().active, 2);

        a.finish(true);
        b.finish(false);

        let snapshot = jobs.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.max_concurrent, 2);
    }

    #[tokio::test]
    async fn test_dropped_permit_counts_as_failed() {
        let jobs = JobRegistry::new(1, 1);
        drop(jobs.acquire().await.unwrap());
        assert_eq!(jobs.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_busy() {
        let jobs = Arc::new(JobRegistry::new(1, 1));
        let running = jobs.acquire().await.unwrap();

        let waiter = {
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move { jobs.acquire().await.map(|p| p.finish(true)) })
        };

        // Let the waiter enqueue
        for _ in 0..50 {
            if jobs.snapshot().queued == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(jobs.snapshot().queued, 1);

        assert!(matches!(jobs.acquire().await, Err(MediaError::Busy)));

        running.finish(true);
        waiter.await.unwrap().unwrap();
        assert_eq!(jobs.snapshot().completed, 2);
        assert_eq!(jobs.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn test_lookup_shares_the_limit_but_not_the_counters() {
        let jobs = JobRegistry::new(1, 0);

        let lookup = jobs.acquire_lookup().await.unwrap();
        assert_eq!(jobs.snapshot().active, 1);
        assert!(matches!(jobs.acquire().await, Err(MediaError::Busy)));
        lookup.finish(true);

        let conversion = jobs.acquire().await.unwrap();
        assert!(matches!(jobs.acquire_lookup().await, Err(MediaError::Busy)));
        drop(conversion);

        drop(jobs.acquire_lookup().await.unwrap());
        let snapshot = jobs.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.completed, 0);
        assert_eq!(snapshot.failed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_frees_queue_slot() {
        let jobs = Arc::new(JobRegistry::new(1, 1));
        let running = jobs.acquire().await.unwrap();

        let abandoned = {
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move { jobs.acquire().await.map(|p| p.finish(true)) })
        };
        for _ in 0..50 {
            if jobs.snapshot().queued == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(jobs.snapshot().queued, 1);

        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());
        assert_eq!(jobs.snapshot().queued, 0);

        // The freed slot is usable by the next waiter
        let waiter = {
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move { jobs.acquire().await.map(|p| p.finish(true)) })
        };
        for _ in 0..50 {
            if jobs.snapshot().queued == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(jobs.snapshot().queued, 1);

        running.finish(true);
        waiter.await.unwrap().unwrap();

        let snapshot = jobs.snapshot();
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.completed, 2);
    }

    #[tokio::test]
    async fn test_key_lock_serializes_and_cleans_up() {
        let jobs = Arc::new(JobRegistry::new(1, 1));
        let first = jobs.lock_key("abc").await;

        let second = {
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move {
                let _lock = jobs.lock_key("abc").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        // Different keys don't block each other
        drop(jobs.lock_key("other").await);

        drop(first);
        second.await.unwrap();
        assert_eq!(jobs.locked_keys(), 0);
    }
}

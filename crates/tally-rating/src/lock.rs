//! Per-key mutual exclusion
//!
//! One async mutex per state key, created on demand and dropped once nobody
//! holds or waits for it. Locks are process local.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tally_common::{Result, StateKey, TallyError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Keyed mutex with bounded waits
#[derive(Clone)]
pub struct KeyLockManager {
    locks: Arc<LockTable>,
    timeout: Duration,
}

impl KeyLockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Wait for exclusive access to `key`, failing with `LockTimeout` after
    /// the configured bound
    pub async fn acquire(&self, key: &StateKey) -> Result<KeyLockGuard> {
        let name = key.to_string();
        let mutex = self.locks.entry(name.clone()).or_default().clone();
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!(key = %name, waited_ms = started.elapsed().as_millis() as u64, "Lock acquired");
                Ok(KeyLockGuard {
                    key: name,
                    guard: Some(guard),
                    locks: self.locks.clone(),
                })
            }
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(key = %name, waited_ms, "Lock wait timed out");
                remove_if_idle(&self.locks, &name);
                Err(TallyError::LockTimeout {
                    key: name,
                    waited_ms,
                })
            }
        }
    }

    /// Keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

fn remove_if_idle(locks: &LockTable, key: &str) {
    locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Exclusive access to one key, released on drop
pub struct KeyLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock; further calls do nothing
    pub fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
            remove_if_idle(&self.locks, &self.key);
            debug!(key = %self.key, "Lock released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(org: &str) -> StateKey {
        StateKey::new(org, 0)
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let locks = KeyLockManager::new(Duration::from_millis(20));
        let _held = locks.acquire(&key("org1")).await.unwrap();

        let err = locks.acquire(&key("org1")).await.err().unwrap();
        assert!(matches!(err, TallyError::LockTimeout { ref key, .. } if key == "k/org1/t/0000000000000000"));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLockManager::new(Duration::from_millis(20));
        let _a = locks.acquire(&key("org1")).await.unwrap();
        let b = locks.acquire(&key("org2")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_cleans_up() {
        let locks = KeyLockManager::new(Duration::from_millis(20));
        let mut guard = locks.acquire(&key("org1")).await.unwrap();

        guard.release();
        guard.release();
        assert!(!guard.is_held());
        assert_eq!(locks.active_keys(), 0);

        let again = locks.acquire(&key("org1")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_on_error_path() {
        let locks = KeyLockManager::new(Duration::from_millis(50));

        async fn failing_section(locks: &KeyLockManager) -> Result<()> {
            let _guard = locks.acquire(&StateKey::new("org1", 0)).await?;
            Err(TallyError::Internal("boom".into()))
        }

        assert!(failing_section(&locks).await.is_err());
        assert!(locks.acquire(&key("org1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_run_one_at_a_time() {
        let locks = KeyLockManager::new(Duration::from_secs(5));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    let _guard = locks.acquire(&StateKey::new("org1", 0)).await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }
}

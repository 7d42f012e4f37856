//! Tally Guardian
//!
//! A keyed lock registry: mutual exclusion per arbitrary string key
//! (account id, shared-group member id, ...).
//!
//! Every key maps to a reference-counted single-permit semaphore. The entry
//! is created on first use and removed as soon as its last holder or waiter
//! goes away, so idle keys do not accumulate. Multi-key acquisitions always
//! happen in sorted key order, which keeps two overlapping key sets from
//! deadlocking each other.
//!
//! [`Guardian::guard`] bounds only the caller's wait. When the timeout fires
//! the guarded work keeps running in the background and keeps its keys
//! locked until it finishes; its result is discarded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{AppError, AppResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

struct LockEntry {
    refs: usize,
    semaphore: Arc<Semaphore>,
}

#[derive(Default)]
struct Registry {
    locks: Mutex<HashMap<String, LockEntry>>,
    held_refs: Mutex<HashMap<Uuid, LockSet>>,
}

impl Registry {
    /// Register interest in `key` and hand back its semaphore
    fn retain(&self, key: &str) -> Arc<Semaphore> {
        let mut locks = self.locks.lock();
        let entry = locks.entry(key.to_string()).or_insert_with(|| LockEntry {
            refs: 0,
            semaphore: Arc::new(Semaphore::new(1)),
        });
        entry.refs += 1;
        entry.semaphore.clone()
    }

    fn release(&self, key: &str) {
        let mut locks = self.locks.lock();
        let remove = match locks.get_mut(key) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => {
                warn!(key = %key, "Releasing unknown lock key");
                false
            }
        };
        if remove {
            locks.remove(key);
        }
    }
}

/// Hold on one key; releases on drop
pub struct KeyGuard {
    key: String,
    // dropped before the refcount goes down
    permit: Option<OwnedSemaphorePermit>,
    registry: Arc<Registry>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.permit.take();
        self.registry.release(&self.key);
    }
}

/// Set of held keys, released together on drop
#[derive(Default)]
pub struct LockSet {
    guards: Vec<KeyGuard>,
}

impl LockSet {
    pub fn keys(&self) -> Vec<&str> {
        self.guards.iter().map(|g| g.key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Sort and dedup a key list into acquisition order
pub fn canonical_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Keyed lock registry service
#[derive(Clone, Default)]
pub struct Guardian {
    registry: Arc<Registry>,
}

impl Guardian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key, in canonical order
    pub async fn lock<S: AsRef<str>>(&self, keys: &[S]) -> LockSet {
        let ordered = canonical_keys(keys.iter().map(|k| k.as_ref().to_string()));
        let mut set = LockSet::default();
        for key in ordered {
            let semaphore = self.registry.retain(&key);
            // registered before waiting so a dropped future still releases
            let mut guard = KeyGuard {
                key,
                permit: None,
                registry: self.registry.clone(),
            };
            match semaphore.acquire_owned().await {
                Ok(permit) => guard.permit = Some(permit),
                // semaphores are never closed
                Err(_) => continue,
            }
            set.guards.push(guard);
        }
        debug!(keys = ?set.keys(), "Acquired locks");
        set
    }

    /// Run `work` while holding `keys`.
    ///
    /// With a timeout the caller stops waiting after `timeout` and gets
    /// [`AppError::LockTimeout`]; the work itself runs to completion and only
    /// then releases the keys.
    pub async fn guard<F, T>(&self, keys: Vec<String>, timeout: Option<Duration>, work: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guardian = self.clone();
        let task_keys = keys.clone();
        let handle = tokio::spawn(async move {
            let _locks = guardian.lock(&task_keys).await;
            work.await
        });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(keys = ?keys, timeout_ms = limit.as_millis() as u64, "Guarded call timed out");
                    return Err(AppError::LockTimeout(keys.join(",")));
                }
            },
            None => handle.await,
        };

        joined.map_err(|e| AppError::Internal(format!("guarded task failed: {}", e)))?
    }

    /// Lock `keys` and release them automatically after `duration`.
    ///
    /// Returns a reference id that can release them earlier through
    /// [`Guardian::unguard`].
    pub async fn guard_for_duration<S: AsRef<str>>(&self, keys: &[S], duration: Duration) -> Uuid {
        let set = self.lock(keys).await;
        let ref_id = Uuid::new_v4();
        self.registry.held_refs.lock().insert(ref_id, set);

        let guardian = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            guardian.unguard(&ref_id);
        });

        debug!(ref_id = %ref_id, duration_ms = duration.as_millis() as u64, "Holding locks for duration");
        ref_id
    }

    /// Release keys held under `ref_id`; a no-op when already released
    pub fn unguard(&self, ref_id: &Uuid) -> bool {
        let released = self.registry.held_refs.lock().remove(ref_id);
        match released {
            Some(set) => {
                debug!(ref_id = %ref_id, keys = ?set.keys(), "Released held locks");
                true
            }
            None => false,
        }
    }

    /// Number of keys currently known (held or waited on)
    pub fn key_count(&self) -> usize {
        self.registry.locks.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.key_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_canonical_keys() {
        assert_eq!(canonical_keys(vec!["b", "a", "b", "c"]), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_lock_set_releases_on_drop() {
        let guardian = Guardian::new();
        let set = guardian.lock(&["t:2", "t:1", "t:2"]).await;
        assert_eq!(set.keys(), vec!["t:1", "t:2"]);
        assert_eq!(guardian.key_count(), 2);
        drop(set);
        assert!(guardian.is_idle());
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let guardian = Guardian::new();
        let delay = Duration::from_millis(40);
        let calls = 5;
        let active = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..calls {
            let g = guardian.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                g.guard(vec!["cgrates.org:1001".to_string()], None, async move {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(delay).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(started.elapsed() >= delay * calls);
        assert!(guardian.is_idle());
    }

    #[tokio::test]
    async fn test_disjoint_keys_run_in_parallel() {
        let guardian = Guardian::new();
        let delay = Duration::from_millis(100);
        let started = Instant::now();

        let a = guardian.guard(vec!["a".into()], None, async move {
            tokio::time::sleep(delay).await;
            Ok(1)
        });
        let b = guardian.guard(vec!["b".into()], None, async move {
            tokio::time::sleep(delay).await;
            Ok(2)
        });
        let (a, b) = tokio::join!(a, b);

        assert_eq!((assert_ok!(a), assert_ok!(b)), (1, 2));
        assert!(started.elapsed() < delay * 2);
        assert!(guardian.is_idle());
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_work() {
        let guardian = Guardian::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result = guardian
            .guard(vec!["k".into()], Some(Duration::from_millis(20)), async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(AppError::LockTimeout(_))));
        // still running and still holding the key
        assert_eq!(guardian.key_count(), 1);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(guardian.is_idle());
    }

    #[tokio::test]
    async fn test_guard_propagates_errors() {
        let guardian = Guardian::new();
        let result: AppResult<()> = guardian
            .guard(vec!["k".into()], None, async { Err(AppError::AccountNotFound("k".into())) })
            .await;
        assert_eq!(assert_err!(result), AppError::AccountNotFound("k".into()));
        assert!(guardian.is_idle());
    }

    #[tokio::test]
    async fn test_guard_for_duration_and_unguard() {
        let guardian = Guardian::new();

        let ref_id = guardian
            .guard_for_duration(&["x", "y"], Duration::from_secs(60))
            .await;
        assert_eq!(guardian.key_count(), 2);

        assert!(guardian.unguard(&ref_id));
        assert!(!guardian.unguard(&ref_id));
        assert!(guardian.is_idle());

        guardian
            .guard_for_duration(&["x"], Duration::from_millis(30))
            .await;
        assert_eq!(guardian.key_count(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(guardian.is_idle());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let guardian = Guardian::new();
        let held = guardian.lock(&["k"]).await;

        let g = guardian.clone();
        let waiter = tokio::spawn(async move {
            let _set = g.lock(&["k"]).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(guardian.key_count(), 1);

        drop(held);
        waiter.await.unwrap();
        assert!(guardian.is_idle());
    }
}

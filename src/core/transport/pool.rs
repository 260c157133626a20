//! Keyed pool of reusable sessions.
//!
//! At most one live session exists per key. The pool-wide mutex only guards
//! the map; liveness checks and connects run after it is released. Callers
//! that arrive while a connect for the same key is in flight wait for it
//! instead of opening a duplicate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::debug;

use crate::core::PoolKey;

enum Slot<S> {
    Ready(S),
    Connecting(watch::Receiver<()>),
}

enum Next<S> {
    Check(S),
    Wait(watch::Receiver<()>),
    Connect(watch::Sender<()>),
}

pub struct SessionPool<S> {
    slots: Arc<Mutex<HashMap<PoolKey, Slot<S>>>>,
}

impl<S> Default for SessionPool<S> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<S: Clone + Send + 'static> SessionPool<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, Slot<S>>> {
        // A panic while holding this lock cannot leave the map half-updated
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the pooled session for `key` if `is_alive` accepts it, otherwise
    /// create one with `connect` and pool it.
    pub async fn get_or_connect<E, A, AF, C, CF>(
        &self,
        key: &PoolKey,
        is_alive: A,
        connect: C,
    ) -> Result<S, E>
    where
        A: Fn(S) -> AF,
        AF: Future<Output = bool>,
        C: Fn() -> CF,
        CF: Future<Output = Result<S, E>>,
    {
        loop {
            let next = {
                let mut slots = self.lock();
                match slots.get(key) {
                    Some(Slot::Ready(session)) => Next::Check(session.clone()),
                    Some(Slot::Connecting(rx)) => Next::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        slots.insert(key.clone(), Slot::Connecting(rx));
                        Next::Connect(tx)
                    }
                }
            };

            match next {
                Next::Check(session) => {
                    if is_alive(session.clone()).await {
                        return Ok(session);
                    }
                    debug!(pool_key = %key, "Pooled session is dead, replacing");
                    self.evict(key);
                }
                Next::Wait(mut rx) => {
                    // Err means the connecting side finished and dropped its sender
                    let _ = rx.changed().await;
                }
                Next::Connect(tx) => {
                    let guard = ConnectGuard {
                        slots: self.slots.clone(),
                        key: key.clone(),
                        armed: true,
                    };
                    let result = connect().await;
                    guard.finish(result.as_ref().ok().cloned());
                    drop(tx);
                    return result;
                }
            }
        }
    }

    /// Drop the pooled session for `key`, if any. A connect in progress is
    /// left alone.
    pub fn evict(&self, key: &PoolKey) -> Option<S> {
        let mut slots = self.lock();
        if matches!(slots.get(key), Some(Slot::Ready(_))) {
            if let Some(Slot::Ready(session)) = slots.remove(key) {
                debug!(pool_key = %key, "Evicted pooled session");
                return Some(session);
            }
        }
        None
    }

    /// Remove and return every ready session.
    pub fn drain(&self) -> Vec<S> {
        let mut slots = self.lock();
        let keys: Vec<PoolKey> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| match slots.remove(&k) {
                Some(Slot::Ready(s)) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears the `Connecting` marker if the connecting future is dropped before
/// it finishes.
struct ConnectGuard<S> {
    slots: Arc<Mutex<HashMap<PoolKey, Slot<S>>>>,
    key: PoolKey,
    armed: bool,
}

impl<S> ConnectGuard<S> {
    fn finish(mut self, session: Option<S>) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        match session {
            Some(s) => {
                slots.insert(self.key.clone(), Slot::Ready(s));
            }
            None => {
                slots.remove(&self.key);
            }
        }
        self.armed = false;
    }
}

impl<S> Drop for ConnectGuard<S> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(slots.get(&self.key), Some(Slot::Connecting(_))) {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key() -> PoolKey {
        PoolKey::new("db1", 22, "ops")
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connect() {
        let pool: Arc<SessionPool<usize>> = Arc::new(SessionPool::new());
        let connects = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let connects = connects.clone();
            handles.push(tokio::spawn(async move {
                pool.get_or_connect(
                    &key(),
                    |_| async { true },
                    || {
                        let connects = connects.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>(connects.fetch_add(1, Ordering::SeqCst))
                        }
                    },
                )
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn dead_session_is_replaced() {
        let pool: SessionPool<usize> = SessionPool::new();
        let first = pool
            .get_or_connect(&key(), |_| async { true }, || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = pool
            .get_or_connect(
                &key(),
                |s| async move { s != 1 },
                || async { Ok::<_, String>(2) },
            )
            .await
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_slot() {
        let pool: SessionPool<usize> = SessionPool::new();
        let result = pool
            .get_or_connect(
                &key(),
                |_| async { true },
                || async { Err::<usize, _>("refused".to_string()) },
            )
            .await;
        assert!(result.is_err());
        assert!(pool.is_empty());

        let retry = pool
            .get_or_connect(&key(), |_| async { true }, || async { Ok::<_, String>(5) })
            .await;
        assert_eq!(retry.unwrap(), 5);
    }

    #[tokio::test]
    async fn evict_and_drain_release_sessions() {
        let pool: SessionPool<usize> = SessionPool::new();
        pool.get_or_connect(&key(), |_| async { true }, || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        let other = PoolKey::new("db2", 22, "ops");
        pool.get_or_connect(&other, |_| async { true }, || async { Ok::<_, String>(2) })
            .await
            .unwrap();

        assert_eq!(pool.evict(&key()), Some(1));
        assert_eq!(pool.evict(&key()), None);
        assert_eq!(pool.drain(), vec![2]);
        assert!(pool.is_empty());
    }
}

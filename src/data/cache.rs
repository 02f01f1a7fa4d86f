use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{sync::Mutex as AsyncMutex, time::Instant};
use tracing::{debug, info, warn};

use crate::error::EpicastError;

/// A built value together with the key it was built for and its lifetime.
#[derive(Debug)]
pub struct CacheEntry<K, V> {
    key: K,
    value: Arc<V>,
    created_at: Instant,
    expires_at: Instant,
}

impl<K, V> CacheEntry<K, V> {
    fn new(key: K, value: V, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            key,
            value: Arc::new(value),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type Slot<K, V> = Arc<AsyncMutex<Option<CacheEntry<K, V>>>>;
type Slots<K, V> = Arc<Mutex<HashMap<K, Slot<K, V>>>>;

/**
Time-bounded memoization with at most one build in flight per key.

Each key owns an async mutex around its entry. The first caller to find the entry missing or
expired keeps the lock while the builder runs, so concurrent callers for the same key queue on
the lock and then read the freshly stored value. Readers only ever see a whole entry.
A slot left empty by a failed build is dropped once no other caller holds or awaits it.

Builds run on a spawned task that owns the lock: a caller that is dropped mid-build does not
cancel it, and the result still lands in the cache. Failed builds store nothing.
 */
pub struct MemoCache<K, V> {
    slots: Slots<K, V>,
}

impl<K, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Slot<K, V> {
        // The map only holds Arcs; a panic while it was locked leaves it consistent.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    /// Returns the cached value for `key`, running `builder` only if there is
    /// no fresh entry. The new entry expires `ttl` after it is stored.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: K,
        ttl: Duration,
        builder: F,
    ) -> Result<Arc<V>, EpicastError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, EpicastError>> + Send + 'static,
    {
        let slots = self.slots.clone();
        let mut guard = self.slot(&key).lock_owned().await;
        if let Some(entry) = guard.as_ref() {
            if entry.is_fresh(Instant::now()) {
                debug!("Cache hit for {}", key);
                return Ok(entry.value.clone());
            }
            info!("Cache entry for {} expired, rebuilding", key);
        } else {
            info!("Cache miss for {}, building", key);
        }

        let panicked_key = key.clone();
        let build = tokio::spawn(async move {
            let started = Instant::now();
            match builder().await {
                Ok(value) => {
                    let entry = CacheEntry::new(key, value, ttl);
                    let value = entry.value.clone();
                    info!(
                        "Built {} in {:.2}s",
                        entry.key,
                        started.elapsed().as_secs_f64()
                    );
                    *guard = Some(entry);
                    Ok(value)
                }
                Err(e) => {
                    warn!("Build for {} failed: {}", key, e);
                    drop(guard);
                    prune(&slots, &key);
                    Err(e)
                }
            }
        });
        build.await.map_err(|e| {
            prune(&self.slots, &panicked_key);
            EpicastError::BuildAborted(e.to_string())
        })?
    }

    /// The fresh value for `key`, if any, without building. Waits for an
    /// in-flight build of that key.
    pub async fn peek(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.slot(key).lock_owned().await;
        let value = guard
            .as_ref()
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| entry.value.clone());
        drop(guard);
        prune(&self.slots, key);
        value
    }

    pub async fn invalidate(&self, key: &K) {
        let mut guard = self.slot(key).lock_owned().await;
        if guard.take().is_some() {
            info!("Invalidated cache entry for {}", key);
        }
        drop(guard);
        prune(&self.slots, key);
    }

    /// Number of keys that currently own a slot.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops the slot for `key` if it holds no entry and nobody else holds or awaits it.
fn prune<K: Eq + Hash, V>(slots: &Mutex<HashMap<K, Slot<K, V>>>, key: &K) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    let idle = slots.get(key).is_some_and(|slot| {
        Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|entry| entry.is_none())
    });
    if idle {
        slots.remove(key);
    }
}

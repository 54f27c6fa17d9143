use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Implemented by every cache the Synchronizer must clear after writing to the store.
#[async_trait::async_trait]
pub trait Invalidate: Send + Sync {
    fn cache_name(&self) -> &'static str;

    async fn invalidate(&self);
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    refreshed_at: Instant,
}

/// Single value that is fresh for `ttl` after it was last put. Values are replaced whole.
#[derive(Debug)]
pub struct TtlSlot<T> {
    ttl: Duration,
    slot: RwLock<Option<Slot<T>>>,
}

impl<T: Clone + Send + Sync> TtlSlot<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the value when it is fresh and `accept` agrees it is usable.
    pub async fn get_if(&self, accept: impl FnOnce(&T) -> bool) -> Option<T> {
        let guard = self.slot.read().await;
        let slot = guard.as_ref()?;
        if slot.refreshed_at.elapsed() >= self.ttl || !accept(&slot.value) {
            return None;
        }
        Some(slot.value.clone())
    }

    pub async fn get(&self) -> Option<T> {
        self.get_if(|_| true).await
    }

    pub async fn put(&self, value: T) {
        *self.slot.write().await = Some(Slot {
            value,
            refreshed_at: Instant::now(),
        });
    }

    pub async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

/// One value per key, kept until `clear`.
#[derive(Debug)]
pub struct KeyedCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: K, value: V) {
        self.entries.write().await.insert(key, value);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

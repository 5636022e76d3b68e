//! Server-side object store
//!
//! Maps cache ids to live objects (data values or callables). One store is
//! shared by every connection of a server process, so implementations must
//! be safe for concurrent insert and lookup. Entries are never freed
//! explicitly; an [`EvictionPolicy`] can bound growth.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::codec::{CacheId, Value};
use crate::function::RemoteFunction;

/// Object held by the store
#[derive(Clone)]
pub enum StoredObject {
    Data(Value),
    Function(Arc<dyn RemoteFunction>),
}

impl StoredObject {
    pub fn is_function(&self) -> bool {
        matches!(self, StoredObject::Function(_))
    }
}

impl fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredObject::Data(value) => f.debug_tuple("Data").field(value).finish(),
            StoredObject::Function(_) => f.write_str("Function(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Never issued by this store, or already evicted
    #[error("Unknown cache id: {0}")]
    UnknownId(CacheId),
}

/// Eviction behaviour of a [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Entries live until the process exits
    #[default]
    Unbounded,
    /// Entries expire once unused for `ttl_ms` milliseconds
    Ttl { ttl_ms: u64 },
    /// At most `capacity` entries; the least recently used one is evicted
    Lru { capacity: usize },
}

/// Concurrent id → object mapping
pub trait ObjectStore: Send + Sync {
    /// Store `object` under `id`, or under a freshly generated id
    fn insert(&self, id: Option<CacheId>, object: StoredObject) -> CacheId;

    fn get(&self, id: &CacheId) -> Result<StoredObject, StoreError>;

    fn contains(&self, id: &CacheId) -> bool {
        self.get(id).is_ok()
    }

    /// Number of live entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    object: StoredObject,
    last_access: Instant,
    tick: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<CacheId, Entry>,
    /// access tick → id, oldest first
    order: BTreeMap<u64, CacheId>,
    next_tick: u64,
}

impl Entries {
    fn touch(&mut self, id: &CacheId) {
        let tick = self.next_tick;
        if let Some(entry) = self.map.get_mut(id) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            entry.last_access = Instant::now();
            self.order.insert(tick, id.clone());
            self.next_tick += 1;
        }
    }

    fn remove(&mut self, id: &CacheId) {
        if let Some(entry) = self.map.remove(id) {
            self.order.remove(&entry.tick);
        }
    }

    fn purge_expired(&mut self, ttl: Duration) {
        let expired: Vec<CacheId> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.last_access.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            debug!("Evicting expired cache entry {}", id);
            self.remove(&id);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, id)) = self.order.pop_first() {
            debug!("Evicting least recently used cache entry {}", id);
            self.map.remove(&id);
        }
    }
}

/// In-memory store with a configurable eviction policy
pub struct MemoryStore {
    entries: Mutex<Entries>,
    policy: EvictionPolicy,
}

impl MemoryStore {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            policy,
        }
    }

    /// Store that never evicts
    pub fn unbounded() -> Self {
        Self::new(EvictionPolicy::Unbounded)
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // A panic while holding the lock cannot leave the map half-updated
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ObjectStore for MemoryStore {
    fn insert(&self, id: Option<CacheId>, object: StoredObject) -> CacheId {
        let id = id.unwrap_or_else(CacheId::generate);
        let mut entries = self.lock();

        if let EvictionPolicy::Ttl { ttl_ms } = self.policy {
            entries.purge_expired(Duration::from_millis(ttl_ms));
        }

        entries.remove(&id);
        let tick = entries.next_tick;
        entries.next_tick += 1;
        entries.map.insert(
            id.clone(),
            Entry {
                object,
                last_access: Instant::now(),
                tick,
            },
        );
        entries.order.insert(tick, id.clone());

        if let EvictionPolicy::Lru { capacity } = self.policy {
            while entries.map.len() > capacity.max(1) {
                entries.evict_oldest();
            }
        }

        id
    }

    fn get(&self, id: &CacheId) -> Result<StoredObject, StoreError> {
        let mut entries = self.lock();

        if let EvictionPolicy::Ttl { ttl_ms } = self.policy {
            let expired = entries
                .map
                .get(id)
                .is_some_and(|entry| entry.last_access.elapsed() > Duration::from_millis(ttl_ms));
            if expired {
                entries.remove(id);
            }
        }

        let object = entries
            .map
            .get(id)
            .map(|entry| entry.object.clone())
            .ok_or_else(|| StoreError::UnknownId(id.clone()))?;
        entries.touch(id);
        Ok(object)
    }

    fn len(&self) -> usize {
        let mut entries = self.lock();
        if let EvictionPolicy::Ttl { ttl_ms } = self.policy {
            entries.purge_expired(Duration::from_millis(ttl_ms));
        }
        entries.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(i: i64) -> StoredObject {
        StoredObject::Data(Value::from(i))
    }

    fn value_of(store: &MemoryStore, id: &CacheId) -> Value {
        match store.get(id).unwrap() {
            StoredObject::Data(value) => value,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = MemoryStore::unbounded();
        let id = store.insert(None, data(7));
        assert_eq!(value_of(&store, &id), Value::from(7));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_caller_supplied_id_overwrites() {
        let store = MemoryStore::unbounded();
        let id = CacheId::new("points");
        assert_eq!(store.insert(Some(id.clone()), data(1)), id);
        store.insert(Some(id.clone()), data(2));
        assert_eq!(value_of(&store, &id), Value::from(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_id() {
        let store = MemoryStore::unbounded();
        let missing = CacheId::new("never-issued");
        assert_eq!(
            store.get(&missing).unwrap_err(),
            StoreError::UnknownId(missing.clone())
        );
        assert!(!store.contains(&missing));
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let store = MemoryStore::unbounded();
        for i in 0..500 {
            store.insert(None, data(i));
        }
        assert_eq!(store.len(), 500);
    }

    #[test]
    fn test_lru_bounds_size() {
        let store = MemoryStore::new(EvictionPolicy::Lru { capacity: 3 });
        let ids: Vec<CacheId> = (0..10).map(|i| store.insert(None, data(i))).collect();
        assert_eq!(store.len(), 3);
        assert!(store.get(&ids[0]).is_err());
        assert!(store.get(&ids[9]).is_ok());
    }

    #[test]
    fn test_lru_keeps_recently_used() {
        let store = MemoryStore::new(EvictionPolicy::Lru { capacity: 2 });
        let a = store.insert(None, data(1));
        let b = store.insert(None, data(2));
        // Touch `a` so `b` becomes the eviction candidate
        store.get(&a).unwrap();
        let c = store.insert(None, data(3));

        assert!(store.contains(&a));
        assert!(!store.contains(&b));
        assert!(store.contains(&c));
    }

    #[test]
    fn test_ttl_expires_entries() {
        let store = MemoryStore::new(EvictionPolicy::Ttl { ttl_ms: 20 });
        let id = store.insert(None, data(1));
        assert!(store.contains(&id));

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(store.get(&id), Err(StoreError::UnknownId(_))));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = Arc::new(MemoryStore::unbounded());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = store.insert(None, data(t * 1000 + i));
                        assert!(store.contains(&id));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }

    #[test]
    fn test_eviction_policy_serde() {
        let policy: EvictionPolicy =
            serde_json::from_str(r#"{"policy": "lru", "capacity": 64}"#).unwrap();
        assert_eq!(policy, EvictionPolicy::Lru { capacity: 64 });
        assert_eq!(EvictionPolicy::default(), EvictionPolicy::Unbounded);
    }
}

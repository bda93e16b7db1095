// cache.rs — Context-aware output cache
//
// Maps (symbol, call context) to the outputs computed for it, tagged with the
// revision they were computed at. Entries are validated lazily: a lookup with
// a different revision drops the entry and reports a miss.
//
// Storage is split into shards selected by key hash, each an LRU behind its
// own lock, so parallel passes over disjoint subgraphs rarely contend.
//
// Postconditions: a hit never invokes the compute function; the shard lock is
//   never held while computing.
// Entries are never dropped just for aging. Keys of removed instances are
// evicted by the engine, keys of iterations a region no longer runs by the
// region evaluator; `shard_capacity` bounds whatever else accumulates.
// Side effects: updates hit/miss/stale counters.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

use crate::context::{CallContext, Frame};
use crate::dirty::Revision;
use crate::id::{InstanceId, SymbolId};
use crate::value::Value;

pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: SymbolId,
    /// Call context including the call site as its last frame.
    pub context: CallContext,
}

impl CacheKey {
    pub fn new(symbol: SymbolId, context: CallContext) -> Self {
        Self { symbol, context }
    }

    /// The instance this entry was computed for.
    pub fn site(&self) -> Option<InstanceId> {
        match self.context.frames().last() {
            Some(Frame::Site(instance)) => Some(*instance),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.context)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    revision: Revision,
    values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because their revision no longer matched.
    pub stale: u64,
}

pub struct CacheManager {
    shards: Vec<Mutex<LruCache<CacheKey, Entry>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS, None)
    }
}

impl CacheManager {
    /// `capacity` bounds each shard; `None` leaves shards unbounded.
    pub fn new(shards: usize, capacity: Option<NonZeroUsize>) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| {
                Mutex::new(match capacity {
                    Some(cap) => LruCache::new(cap),
                    None => LruCache::unbounded(),
                })
            })
            .collect();
        CacheManager {
            shards,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Look up `key` as of `revision`. A mismatched entry is dropped.
    pub fn get(&self, key: &CacheKey, revision: Revision) -> Option<Vec<Value>> {
        let mut shard = self.shard(key).lock();
        let found = match shard.get(key) {
            Some(entry) if entry.revision == revision => Some(entry.values.clone()),
            Some(_) => {
                shard.pop(key);
                self.stale.fetch_add(1, Ordering::Relaxed);
                log::trace!("cache stale {}", key);
                None
            }
            None => None,
        };
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: CacheKey, revision: Revision, values: Vec<Value>) {
        self.shard(&key).lock().put(key, Entry { revision, values });
    }

    /// Return the cached outputs for `key`, or compute, store and return
    /// them. The flag is true on a hit.
    pub fn get_or_compute<E>(
        &self,
        key: CacheKey,
        revision: Revision,
        compute: impl FnOnce() -> Result<Vec<Value>, E>,
    ) -> Result<(Vec<Value>, bool), E> {
        if let Some(values) = self.get(&key, revision) {
            return Ok((values, true));
        }
        let values = compute()?;
        self.insert(key, revision, values.clone());
        Ok((values, false))
    }

    /// Drop every entry computed for `instance`. Returns how many went.
    pub fn evict_site(&self, instance: InstanceId) -> usize {
        let evicted = self.evict_where(|key| key.site() == Some(instance));
        if evicted > 0 {
            log::debug!("evicted {} cache entries for {}", evicted, instance);
        }
        evicted
    }

    /// Drop every entry whose key matches `stale`. Returns how many went.
    pub fn evict_where(&self, stale: impl Fn(&CacheKey) -> bool) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let keys: Vec<CacheKey> = shard
                .iter()
                .filter(|(key, _)| stale(key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                shard.pop(&key);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("shards", &self.shards.len())
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RegionId;

    fn key(symbol: u32, site: u32) -> CacheKey {
        CacheKey::new(SymbolId(symbol), CallContext::root().with_site(InstanceId(site)))
    }

    #[test]
    fn hit_skips_compute() {
        let cache = CacheManager::default();
        let mut calls = 0;
        let (first, hit) = cache
            .get_or_compute::<()>(key(0, 1), Revision(1), || {
                calls += 1;
                Ok(vec![Value::Int(1)])
            })
            .unwrap();
        assert!(!hit);
        assert_eq!(first, vec![Value::Int(1)]);
        let (second, hit) = cache
            .get_or_compute::<()>(key(0, 1), Revision(1), || {
                calls += 1;
                Ok(vec![Value::Int(2)])
            })
            .unwrap();
        assert!(hit);
        assert_eq!(second, vec![Value::Int(1)]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn revision_mismatch_drops_entry() {
        let cache = CacheManager::default();
        cache.insert(key(0, 1), Revision(1), vec![Value::Int(1)]);
        assert!(cache.get(&key(0, 1), Revision(2)).is_none());
        assert_eq!(cache.stats().stale, 1);
        // Dropped, so even the old revision misses now.
        assert!(cache.get(&key(0, 1), Revision(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn contexts_are_separate_entries() {
        let cache = CacheManager::default();
        let a = CacheKey::new(
            SymbolId(0),
            CallContext::root().push_iteration(RegionId(0), 0).with_site(InstanceId(3)),
        );
        let b = CacheKey::new(
            SymbolId(0),
            CallContext::root().push_iteration(RegionId(0), 1).with_site(InstanceId(3)),
        );
        cache.insert(a.clone(), Revision(1), vec![Value::Int(20)]);
        cache.insert(b.clone(), Revision(1), vec![Value::Int(40)]);
        assert_eq!(cache.get(&a, Revision(1)), Some(vec![Value::Int(20)]));
        assert_eq!(cache.get(&b, Revision(1)), Some(vec![Value::Int(40)]));
    }

    #[test]
    fn compute_error_is_not_stored() {
        let cache = CacheManager::default();
        let result = cache.get_or_compute(key(0, 1), Revision(1), || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_site_removes_only_that_instance() {
        let cache = CacheManager::new(4, None);
        cache.insert(key(0, 1), Revision(1), vec![]);
        cache.insert(key(0, 2), Revision(1), vec![]);
        cache.insert(key(1, 1), Revision(1), vec![]);
        assert_eq!(cache.evict_site(InstanceId(1)), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bounded_shards_evict_least_recent() {
        let cache = CacheManager::new(1, NonZeroUsize::new(2));
        cache.insert(key(0, 1), Revision(1), vec![]);
        cache.insert(key(0, 2), Revision(1), vec![]);
        cache.get(&key(0, 1), Revision(1));
        cache.insert(key(0, 3), Revision(1), vec![]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(0, 2), Revision(1)).is_none());
        assert!(cache.get(&key(0, 1), Revision(1)).is_some());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Read cache of shallow resource bodies (properties and references).
//!
//! Children and back-references are always read fresh, so only writes to the resource itself,
//! to its parent or to a referenced peer need to invalidate an entry.

use id::Uuid;
use ordermap::OrderMap;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner {
    /// Least recently used first.
    entries: OrderMap<Uuid, (&'static str, Map<String, Value>)>,
    stats: CacheStats,
}

pub struct ObjectCache {
    capacity: usize,
    exclude: HashSet<String>,
    inner: Mutex<Inner>,
}

impl ObjectCache {
    /// A cache of at most `capacity` entries. A zero capacity disables caching.
    #[must_use]
    pub fn new(capacity: usize, exclude_types: &[String]) -> Self {
        Self {
            capacity,
            exclude: exclude_types.iter().map(|t| t.replace('_', "-")).collect(),
            inner: Mutex::new(Inner {
                entries: OrderMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    fn cacheable(&self, resource_type: &str) -> bool {
        self.capacity > 0 && !self.exclude.contains(resource_type)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Map<String, Value>> {
        let mut inner = self.inner.lock();
        match inner.entries.remove(uuid) {
            Some(entry) => {
                let body = entry.1.clone();
                inner.entries.insert(*uuid, entry);
                inner.stats.hits += 1;
                Some(body)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, resource_type: &'static str, uuid: Uuid, body: Map<String, Value>) {
        if !self.cacheable(resource_type) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.entries.remove(&uuid);
        inner.entries.insert(uuid, (resource_type, body));
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.entries.keys().next().copied() else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.stats.evictions += 1;
        }
    }

    pub fn invalidate(&self, uuid: &Uuid) {
        self.inner.lock().entries.remove(uuid);
    }

    pub fn invalidate_all(&self, uuids: impl IntoIterator<Item = Uuid>) {
        let mut inner = self.inner.lock();
        for uuid in uuids {
            inner.entries.remove(&uuid);
        }
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Statistics as rendered by the obj-cache action.
    #[must_use]
    pub fn stats_value(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "capacity": self.capacity,
            "size": inner.entries.len(),
            "hits": inner.stats.hits,
            "misses": inner.stats.misses,
            "evictions": inner.stats.evictions,
            "exclude_types": self.exclude.iter().collect::<Vec<_>>(),
        })
    }

    /// Entries, most recently used first, restricted to `uuids` if given.
    #[must_use]
    pub fn dump(&self, uuids: Option<&[Uuid]>, count: Option<usize>) -> Vec<Value> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .rev()
            .filter(|(uuid, _)| uuids.is_none_or(|wanted| wanted.contains(uuid)))
            .take(count.unwrap_or(usize::MAX))
            .map(|(uuid, (ty, body))| json!({"uuid": uuid, "type": ty, "body": body}))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn body(name: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("name".into(), Value::from(name));
        m
    }

    #[test]
    fn lru_eviction_and_stats() {
        let cache = ObjectCache::new(2, &[]);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        cache.insert("virtual-network", a, body("a"));
        cache.insert("virtual-network", b, body("b"));
        // touch a so that b is the oldest
        assert!(cache.get(&a).is_some());
        cache.insert("virtual-network", c, body("c"));
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&c).is_some());
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 3,
                misses: 1,
                evictions: 1
            }
        );
        let dump = cache.dump(None, Some(1));
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0]["uuid"], Value::from(c.to_string()));
    }

    #[test]
    fn excluded_types_and_invalidation() {
        let cache = ObjectCache::new(10, &["instance_ip".to_string()]);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.insert("instance-ip", a, body("a"));
        cache.insert("project", b, body("b"));
        assert_eq!(cache.len(), 1);
        cache.invalidate(&b);
        assert!(cache.is_empty());
    }
}

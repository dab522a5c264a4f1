//! Bounded lookup-or-create store shared by the sampler and pipeline caches.
//!
//! Entries are never evicted. Hitting the limit follows the configured
//! [`OverflowPolicy`]: `Fatal` fails the resolve, `Warn` logs and keeps
//! growing. The store itself never touches the device; owners create and
//! destroy the cached handles.

use std::collections::HashMap;
use std::hash::Hash;

use log::warn;

use crate::config::OverflowPolicy;
use crate::error::{GfxError, GfxResult};

pub(crate) struct CacheStore<K, V> {
    label: &'static str,
    entries: HashMap<K, V>,
    limit: usize,
    on_full: OverflowPolicy,
    created: u64,
}

impl<K: Eq + Hash + Copy, V: Copy> CacheStore<K, V> {
    pub fn new(label: &'static str, limit: usize, on_full: OverflowPolicy) -> Self {
        Self {
            label,
            entries: HashMap::new(),
            limit,
            on_full,
            created: 0,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).copied()
    }

    /// Check whether one more entry may be created.
    pub fn admit(&self) -> GfxResult<()> {
        if self.entries.len() < self.limit {
            return Ok(());
        }
        match self.on_full {
            OverflowPolicy::Fatal => Err(GfxError::CacheFull {
                cache: self.label,
                capacity: self.limit,
            }),
            OverflowPolicy::Warn => {
                warn!("{} cache exceeding soft limit of {} entries", self.label, self.limit);
                Ok(())
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, value);
        self.created += 1;
    }

    pub fn get_or_insert_with(
        &mut self,
        key: K,
        make: impl FnOnce() -> GfxResult<V>,
    ) -> GfxResult<V> {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        self.admit()?;
        let v = make()?;
        self.insert(key, v);
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total entries created over the store's lifetime, across clears.
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.entries.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(counter: &mut u32) -> impl FnOnce() -> GfxResult<u64> + '_ {
        move || {
            *counter += 1;
            Ok(u64::from(*counter))
        }
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut store: CacheStore<u32, u64> = CacheStore::new("test", 8, OverflowPolicy::Fatal);
        let mut made = 0;
        let a = store.get_or_insert_with(7, counting(&mut made)).unwrap();
        let b = store.get_or_insert_with(7, counting(&mut made)).unwrap();
        assert_eq!(a, b);
        assert_eq!(made, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.created(), 1);
    }

    #[test]
    fn distinct_keys_create_distinct_entries() {
        let mut store: CacheStore<u32, u64> = CacheStore::new("test", 8, OverflowPolicy::Fatal);
        let mut made = 0;
        store.get_or_insert_with(1, counting(&mut made)).unwrap();
        store.get_or_insert_with(2, counting(&mut made)).unwrap();
        assert_eq!(made, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn fatal_policy_fails_past_capacity() {
        let mut store: CacheStore<u32, u64> = CacheStore::new("test", 2, OverflowPolicy::Fatal);
        let mut made = 0;
        store.get_or_insert_with(1, counting(&mut made)).unwrap();
        store.get_or_insert_with(2, counting(&mut made)).unwrap();
        // At capacity, hits still resolve.
        assert!(store.get_or_insert_with(2, counting(&mut made)).is_ok());
        // Capacity + 1 fails without invoking the constructor.
        let err = store.get_or_insert_with(3, counting(&mut made)).unwrap_err();
        assert!(matches!(err, GfxError::CacheFull { capacity: 2, .. }));
        assert_eq!(made, 2);
    }

    #[test]
    fn warn_policy_keeps_serving() {
        let mut store: CacheStore<u32, u64> = CacheStore::new("test", 1, OverflowPolicy::Warn);
        let mut made = 0;
        store.get_or_insert_with(1, counting(&mut made)).unwrap();
        store.get_or_insert_with(2, counting(&mut made)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(made, 2);
    }

    #[test]
    fn created_survives_drain() {
        let mut store: CacheStore<u32, u64> = CacheStore::new("test", 8, OverflowPolicy::Fatal);
        let mut made = 0;
        store.get_or_insert_with(1, counting(&mut made)).unwrap();
        store.get_or_insert_with(2, counting(&mut made)).unwrap();
        let drained: Vec<_> = store.drain().collect();
        assert_eq!(drained.len(), 2);
        assert_eq!(store.len(), 0);
        assert_eq!(store.created(), 2);
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! The ordered byte-oriented engine the typed layer sits on. In production
//! this seam is backed by an LSM store; [`MemKvEngine`] is the in-memory
//! implementation used here and by the test suites.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::compaction::{CompactionFilter, FilterDecision};

pub trait KvEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    fn put(&self, key: &[u8], value: Bytes);

    /// Returns true iff the key was present.
    fn delete(&self, key: &[u8]) -> bool;

    /// Visits every record whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8], visit: &mut dyn FnMut(&[u8], &[u8]));

    /// Runs `filter` over every record and drops the ones it rejects.
    /// Returns the number of dropped records.
    fn compact(&self, filter: &mut dyn CompactionFilter) -> usize;

    fn clear(&self);

    fn record_count(&self) -> usize;
}

pub struct MemKvEngine {
    map: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl Default for MemKvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKvEngine {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl KvEngine for MemKvEngine {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: Bytes) {
        self.map.write().insert(key.to_vec(), value);
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.map.write().remove(key).is_some()
    }

    fn scan_prefix(&self, prefix: &[u8], visit: &mut dyn FnMut(&[u8], &[u8])) {
        let map = self.map.read();
        for (key, value) in map.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            visit(key, value);
        }
    }

    fn compact(&self, filter: &mut dyn CompactionFilter) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|key, value| matches!(filter.filter(key, value), FilterDecision::Keep));
        before - map.len()
    }

    fn clear(&self) {
        self.map.write().clear();
    }

    fn record_count(&self) -> usize {
        self.map.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_ops() {
        let kv = MemKvEngine::new();
        assert!(kv.get(b"a").is_none());
        kv.put(b"a", Bytes::from_static(b"1"));
        assert_eq!(kv.get(b"a").unwrap(), Bytes::from_static(b"1"));
        assert!(kv.delete(b"a"));
        assert!(!kv.delete(b"a"));
        assert_eq!(kv.record_count(), 0);
    }

    #[test]
    fn scan_prefix_stays_in_prefix() {
        let kv = MemKvEngine::new();
        kv.put(b"a/1", Bytes::from_static(b"x"));
        kv.put(b"a/2", Bytes::from_static(b"y"));
        kv.put(b"b/1", Bytes::from_static(b"z"));
        let mut seen = Vec::new();
        kv.scan_prefix(b"a/", &mut |k, _| seen.push(k.to_vec()));
        assert_eq!(seen, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }

    struct DropAll;
    impl CompactionFilter for DropAll {
        fn filter(&mut self, _key: &[u8], _value: &[u8]) -> FilterDecision {
            FilterDecision::Remove
        }
    }

    #[test]
    fn compact_drops_rejected_records() {
        let kv = MemKvEngine::new();
        kv.put(b"a", Bytes::from_static(b"1"));
        kv.put(b"b", Bytes::from_static(b"2"));
        assert_eq!(kv.compact(&mut DropAll), 2);
        assert_eq!(kv.record_count(), 0);
    }
}

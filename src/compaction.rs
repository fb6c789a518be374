// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! Background reclamation of logically dead records. Filters only read the
//! stored byte slices; they never mutate a record in place.
//!
//! A sweep runs in two passes per database. The meta pass drops expired,
//! empty, and corrupt root records while snapshotting the current version of
//! every live container. The member pass then drops member records whose
//! parent is gone or whose embedded version no longer matches, i.e. the
//! records orphaned by a version bump.

use std::collections::HashMap;

use log::debug;

use crate::db::{decode_member_key, META_KEY_PREFIX, MEMBER_KEY_PREFIX};
use crate::meta_value::{DataType, ParsedBaseMetaValue, ParsedStringMetaValue};
use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Remove,
}

pub trait CompactionFilter {
    fn filter(&mut self, key: &[u8], value: &[u8]) -> FilterDecision;
}

/// Pass 1: root records. Anything outside the meta namespace is kept
/// untouched.
pub struct MetaCompactionFilter {
    now: u64,
    live_versions: HashMap<Vec<u8>, u64>,
}

impl MetaCompactionFilter {
    pub fn new(now: u64) -> Self {
        Self {
            now,
            live_versions: HashMap::new(),
        }
    }

    /// The versions of container roots that survived the pass, keyed by user
    /// key. Feeds the member pass.
    pub fn into_live_versions(self) -> HashMap<Vec<u8>, u64> {
        self.live_versions
    }

    fn drop_with_reason(key: &[u8], reason: &'static str) -> FilterDecision {
        debug!(
            "drop[{}] meta key: {}",
            reason,
            String::from_utf8_lossy(key)
        );
        metrics::COMPACTION_DROPPED_COUNT
            .with_label_values(&[reason])
            .inc();
        FilterDecision::Remove
    }
}

impl CompactionFilter for MetaCompactionFilter {
    fn filter(&mut self, key: &[u8], value: &[u8]) -> FilterDecision {
        if key.first() != Some(&META_KEY_PREFIX) {
            return FilterDecision::Keep;
        }
        let user_key = &key[1..];
        let Some(data_type) = value.first().copied().and_then(DataType::from_byte) else {
            return Self::drop_with_reason(user_key, "corrupt");
        };
        if data_type == DataType::String {
            return match ParsedStringMetaValue::parse(value) {
                Err(_) => Self::drop_with_reason(user_key, "corrupt"),
                Ok(parsed) if parsed.is_stale(self.now) => {
                    Self::drop_with_reason(user_key, "stale")
                }
                Ok(_) => FilterDecision::Keep,
            };
        }
        match ParsedBaseMetaValue::parse(value) {
            Err(_) => Self::drop_with_reason(user_key, "corrupt"),
            Ok(parsed) if parsed.is_stale(self.now) => Self::drop_with_reason(user_key, "stale"),
            Ok(parsed) if parsed.count() == 0 => Self::drop_with_reason(user_key, "empty"),
            Ok(parsed) => {
                self.live_versions
                    .insert(user_key.to_vec(), parsed.version());
                FilterDecision::Keep
            }
        }
    }
}

/// Pass 2: member records, judged against the meta snapshot taken by pass 1.
pub struct MemberCompactionFilter<'a> {
    live_versions: &'a HashMap<Vec<u8>, u64>,
}

impl<'a> MemberCompactionFilter<'a> {
    pub fn new(live_versions: &'a HashMap<Vec<u8>, u64>) -> Self {
        Self { live_versions }
    }

    fn drop_with_reason(key: &[u8], reason: &'static str) -> FilterDecision {
        debug!(
            "drop[{}] member key: {}",
            reason,
            String::from_utf8_lossy(key)
        );
        metrics::COMPACTION_DROPPED_COUNT
            .with_label_values(&[reason])
            .inc();
        FilterDecision::Remove
    }
}

impl CompactionFilter for MemberCompactionFilter<'_> {
    fn filter(&mut self, key: &[u8], _value: &[u8]) -> FilterDecision {
        if key.first() != Some(&MEMBER_KEY_PREFIX) {
            return FilterDecision::Keep;
        }
        let Some((user_key, version, _member)) = decode_member_key(key) else {
            return Self::drop_with_reason(key, "corrupt");
        };
        match self.live_versions.get(user_key) {
            None => Self::drop_with_reason(user_key, "orphan"),
            Some(live) if *live != version => Self::drop_with_reason(user_key, "orphan"),
            Some(_) => FilterDecision::Keep,
        }
    }
}

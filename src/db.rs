// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! Typed operations layered over the ordered KV engine. Each logical key has
//! one meta record; container members live in separate records carrying the
//! parent's version at write time, so bumping the parent version invalidates
//! them all without touching them.
//!
//! Every mutating path here must call `TxnCoordinator::notify_dirty` for
//! each key it changed before reporting success; WATCH/EXEC abort semantics
//! depend on that contract being complete.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use parking_lot::{Mutex, MutexGuard};

use crate::clock::Clock;
use crate::codec::{decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64};
use crate::compaction::{MemberCompactionFilter, MetaCompactionFilter};
use crate::errors::StoreError;
use crate::kv::{KvEngine, MemKvEngine};
use crate::meta_value::{
    BaseMetaRecord, BaseMetaValue, DataType, StringMetaRecord, StringMetaValue,
};
use crate::transaction::TxnCoordinator;

pub const META_KEY_PREFIX: u8 = b'm';
pub const MEMBER_KEY_PREFIX: u8 = b's';

/// Root record key: `m | user_key`.
pub fn meta_key(user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + user_key.len());
    out.push(META_KEY_PREFIX);
    out.extend_from_slice(user_key);
    out
}

/// Member record key: `s | keylen:u32 | user_key | version:u64 | member`.
pub fn member_key(user_key: &[u8], version: u64, member: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 1 + 4 + user_key.len() + 8 + member.len()];
    out[0] = MEMBER_KEY_PREFIX;
    encode_fixed32(&mut out, 1, user_key.len() as u32);
    out[5..5 + user_key.len()].copy_from_slice(user_key);
    encode_fixed64(&mut out, 5 + user_key.len(), version);
    out[5 + user_key.len() + 8..].copy_from_slice(member);
    out
}

fn member_prefix(user_key: &[u8], version: u64) -> Vec<u8> {
    member_key(user_key, version, b"")
}

/// Splits a member record key into `(user_key, version, member)`.
pub fn decode_member_key(raw: &[u8]) -> Option<(&[u8], u64, &[u8])> {
    if raw.len() < 1 + 4 || raw[0] != MEMBER_KEY_PREFIX {
        return None;
    }
    let key_len = decode_fixed32(raw, 1) as usize;
    if raw.len() < 1 + 4 + key_len + 8 {
        return None;
    }
    let user_key = &raw[5..5 + key_len];
    let version = decode_fixed64(raw, 5 + key_len);
    let member = &raw[5 + key_len + 8..];
    Some((user_key, version, member))
}

/// Whichever shape is stored under a meta key.
enum MetaProbe {
    Str(StringMetaRecord),
    Container(DataType, BaseMetaRecord),
}

impl MetaProbe {
    fn is_valid(&self, now: u64) -> bool {
        match self {
            MetaProbe::Str(rec) => rec.is_valid(now),
            MetaProbe::Container(_, rec) => rec.is_valid(now),
        }
    }

    fn etime(&self) -> u64 {
        match self {
            MetaProbe::Str(rec) => rec.etime(),
            MetaProbe::Container(_, rec) => rec.etime(),
        }
    }

    fn set_etime(&mut self, etime: u64) {
        match self {
            MetaProbe::Str(rec) => rec.set_etime(etime),
            MetaProbe::Container(_, rec) => rec.set_etime(etime),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            MetaProbe::Str(_) => DataType::String,
            MetaProbe::Container(dt, _) => *dt,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            MetaProbe::Str(rec) => rec.into_bytes(),
            MetaProbe::Container(_, rec) => rec.into_bytes(),
        }
    }
}

/// What a container write path found under the meta key.
enum ContainerState {
    /// No usable record. `prev_version` carries the version clock of a dead
    /// container record so a recreated key keeps versions strictly
    /// increasing and old member records stay orphaned.
    Missing { prev_version: u64 },
    Live(BaseMetaRecord),
}

pub struct Db {
    engines: Vec<Arc<dyn KvEngine>>,
    clock: Arc<dyn Clock>,
    txn: Arc<TxnCoordinator>,
    cmd_lock: Mutex<()>,
}

impl Db {
    pub fn new(num_dbs: usize, clock: Arc<dyn Clock>, txn: Arc<TxnCoordinator>) -> Self {
        let engines = (0..num_dbs)
            .map(|_| Arc::new(MemKvEngine::new()) as Arc<dyn KvEngine>)
            .collect();
        Self {
            engines,
            clock,
            txn,
            cmd_lock: Mutex::new(()),
        }
    }

    pub fn num_dbs(&self) -> usize {
        self.engines.len()
    }

    /// Serializes command execution: one command at a time runs against the
    /// store, and EXEC holds this for its whole queued block.
    pub fn command_lock(&self) -> MutexGuard<'_, ()> {
        self.cmd_lock.lock()
    }

    pub fn record_count(&self) -> usize {
        self.engines.iter().map(|e| e.record_count()).sum()
    }

    pub fn db_record_count(&self, dbno: i32) -> usize {
        self.engine(dbno).record_count()
    }

    fn engine(&self, dbno: i32) -> &dyn KvEngine {
        self.engines[dbno as usize].as_ref()
    }

    fn now(&self) -> u64 {
        self.clock.now_seconds()
    }

    /// Loads and parses whatever meta record exists for `user_key`. Corrupt
    /// or unknown-typed records are reported as nonexistent; the compaction
    /// filter reclaims them.
    fn probe(&self, engine: &dyn KvEngine, user_key: &[u8]) -> Option<MetaProbe> {
        let raw = engine.get(&meta_key(user_key))?;
        let Some(data_type) = raw.first().copied().and_then(DataType::from_byte) else {
            warn!(
                "meta record with unknown type byte treated as missing: key [{}]",
                String::from_utf8_lossy(user_key)
            );
            return None;
        };
        let result = if data_type == DataType::String {
            StringMetaRecord::from_bytes(raw.to_vec()).map(MetaProbe::Str)
        } else {
            BaseMetaRecord::from_bytes(raw.to_vec()).map(|rec| MetaProbe::Container(data_type, rec))
        };
        match result {
            Ok(probe) => Some(probe),
            Err(err) => {
                warn!(
                    "corrupt meta record treated as missing: key [{}]: {}",
                    String::from_utf8_lossy(user_key),
                    err
                );
                None
            }
        }
    }

    fn container_meta(
        &self,
        engine: &dyn KvEngine,
        user_key: &[u8],
        want: DataType,
        now: u64,
    ) -> Result<ContainerState, StoreError> {
        match self.probe(engine, user_key) {
            None => Ok(ContainerState::Missing { prev_version: 0 }),
            Some(MetaProbe::Str(rec)) => {
                if rec.is_valid(now) {
                    Err(StoreError::WrongType)
                } else {
                    Ok(ContainerState::Missing { prev_version: 0 })
                }
            }
            Some(MetaProbe::Container(data_type, rec)) => {
                if rec.is_valid(now) {
                    if data_type == want {
                        Ok(ContainerState::Live(rec))
                    } else {
                        Err(StoreError::WrongType)
                    }
                } else {
                    Ok(ContainerState::Missing {
                        prev_version: rec.version(),
                    })
                }
            }
        }
    }

    // --- strings ---

    /// SET. Overwrites any previous value regardless of type; member records
    /// of a replaced container become orphans for compaction.
    pub fn set(&self, dbno: i32, key: &[u8], value: Bytes, expire_secs: Option<u64>) {
        let now = self.now();
        let mut meta = StringMetaValue::new(value);
        meta.set_ctime(now);
        if let Some(secs) = expire_secs {
            meta.set_etime(now + secs);
        }
        self.engine(dbno)
            .put(&meta_key(key), Bytes::copy_from_slice(meta.encode()));
        self.txn.notify_dirty(dbno, key);
    }

    pub fn get(&self, dbno: i32, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let now = self.now();
        match self.probe(self.engine(dbno), key) {
            None => Ok(None),
            Some(MetaProbe::Str(rec)) => {
                if rec.is_valid(now) {
                    Ok(Some(Bytes::copy_from_slice(rec.user_value())))
                } else {
                    Ok(None)
                }
            }
            Some(MetaProbe::Container(_, rec)) => {
                if rec.is_valid(now) {
                    Err(StoreError::WrongType)
                } else {
                    Ok(None)
                }
            }
        }
    }

    // --- generic ---

    /// DEL. Strings are removed physically; containers are logically deleted
    /// by resetting the meta record, which bumps the version and orphans
    /// every member record written under the old one.
    pub fn del(&self, dbno: i32, keys: &[Bytes]) -> i64 {
        let now = self.now();
        let engine = self.engine(dbno);
        let mut removed = 0;
        for key in keys {
            match self.probe(engine, key) {
                Some(MetaProbe::Str(rec)) if rec.is_valid(now) => {
                    engine.delete(&meta_key(key));
                }
                Some(MetaProbe::Container(_, mut rec)) if rec.is_valid(now) => {
                    rec.initial_meta_value(now);
                    engine.put(&meta_key(key), Bytes::from(rec.into_bytes()));
                }
                _ => continue,
            }
            removed += 1;
            self.txn.notify_dirty(dbno, key);
        }
        removed
    }

    pub fn exists(&self, dbno: i32, keys: &[Bytes]) -> i64 {
        let now = self.now();
        let engine = self.engine(dbno);
        keys.iter()
            .filter(|key| {
                self.probe(engine, key)
                    .is_some_and(|probe| probe.is_valid(now))
            })
            .count() as i64
    }

    pub fn key_type(&self, dbno: i32, key: &[u8]) -> Option<DataType> {
        let now = self.now();
        self.probe(self.engine(dbno), key)
            .filter(|probe| probe.is_valid(now))
            .map(|probe| probe.data_type())
    }

    /// EXPIRE. A non-positive `seconds` removes the key immediately, like
    /// DEL. Returns false when the key does not exist.
    pub fn expire(&self, dbno: i32, key: &[u8], seconds: i64) -> bool {
        let now = self.now();
        let engine = self.engine(dbno);
        let Some(mut probe) = self.probe(engine, key) else {
            return false;
        };
        if !probe.is_valid(now) {
            return false;
        }
        if seconds <= 0 {
            return self.del(dbno, &[Bytes::copy_from_slice(key)]) == 1;
        }
        probe.set_etime(now + seconds as u64);
        engine.put(&meta_key(key), Bytes::from(probe.into_bytes()));
        self.txn.notify_dirty(dbno, key);
        true
    }

    /// TTL in seconds: -2 when the key does not exist, -1 when it carries no
    /// expiry.
    pub fn ttl(&self, dbno: i32, key: &[u8]) -> i64 {
        let now = self.now();
        match self.probe(self.engine(dbno), key) {
            Some(probe) if probe.is_valid(now) => {
                let etime = probe.etime();
                if etime == 0 {
                    -1
                } else {
                    (etime - now) as i64
                }
            }
            _ => -2,
        }
    }

    /// PERSIST. Returns true iff an expiry was removed.
    pub fn persist(&self, dbno: i32, key: &[u8]) -> bool {
        let now = self.now();
        let engine = self.engine(dbno);
        let Some(mut probe) = self.probe(engine, key) else {
            return false;
        };
        if !probe.is_valid(now) || probe.etime() == 0 {
            return false;
        }
        probe.set_etime(0);
        engine.put(&meta_key(key), Bytes::from(probe.into_bytes()));
        self.txn.notify_dirty(dbno, key);
        true
    }

    pub fn flush_db(&self, dbno: i32) {
        self.engine(dbno).clear();
        self.txn.notify_dirty_all(dbno);
    }

    pub fn flush_all(&self) {
        for engine in &self.engines {
            engine.clear();
        }
        self.txn.notify_dirty_all(-1);
    }

    // --- containers, shared plumbing ---

    /// Inserts or overwrites member records. Returns the number of members
    /// that did not exist before. Creates the container when absent, seeding
    /// the version clock from any dead record found under the key.
    fn container_add(
        &self,
        dbno: i32,
        key: &[u8],
        want: DataType,
        entries: &[(Bytes, Bytes)],
    ) -> Result<i64, StoreError> {
        let now = self.now();
        let engine = self.engine(dbno);
        let (mut rec, fresh) = match self.container_meta(engine, key, want, now)? {
            ContainerState::Missing { prev_version } => {
                let mut meta = BaseMetaValue::new(want);
                meta.set_version(prev_version);
                meta.update_version(now);
                meta.set_ctime(now);
                (BaseMetaRecord::from_bytes(meta.encode().to_vec())?, true)
            }
            ContainerState::Live(rec) => (rec, false),
        };
        let version = rec.version();

        let new_members: i32 = {
            let mut seen: HashSet<&[u8]> = HashSet::new();
            entries
                .iter()
                .filter(|(member, _)| {
                    seen.insert(member.as_ref())
                        && engine.get(&member_key(key, version, member)).is_none()
                })
                .count() as i32
        };
        if new_members > 0 && !rec.check_modify_count(new_members) {
            return Err(StoreError::CountOutOfRange);
        }
        for (member, value) in entries {
            engine.put(&member_key(key, version, member), value.clone());
        }
        if new_members > 0 {
            rec.modify_count(new_members)?;
        }
        if fresh || new_members > 0 {
            engine.put(&meta_key(key), Bytes::copy_from_slice(rec.as_bytes()));
        }
        self.txn.notify_dirty(dbno, key);
        Ok(new_members as i64)
    }

    /// Deletes member records. Returns the number removed.
    fn container_remove(
        &self,
        dbno: i32,
        key: &[u8],
        want: DataType,
        members: &[Bytes],
    ) -> Result<i64, StoreError> {
        let now = self.now();
        let engine = self.engine(dbno);
        let mut rec = match self.container_meta(engine, key, want, now)? {
            ContainerState::Missing { .. } => return Ok(0),
            ContainerState::Live(rec) => rec,
        };
        let version = rec.version();
        let mut removed = 0i32;
        for member in members {
            if engine.delete(&member_key(key, version, member)) {
                removed += 1;
            }
        }
        if removed > 0 {
            rec.modify_count(-removed)?;
            engine.put(&meta_key(key), Bytes::copy_from_slice(rec.as_bytes()));
            self.txn.notify_dirty(dbno, key);
        }
        Ok(removed as i64)
    }

    fn container_get(
        &self,
        dbno: i32,
        key: &[u8],
        want: DataType,
        member: &[u8],
    ) -> Result<Option<Bytes>, StoreError> {
        let now = self.now();
        let engine = self.engine(dbno);
        match self.container_meta(engine, key, want, now)? {
            ContainerState::Missing { .. } => Ok(None),
            ContainerState::Live(rec) => {
                Ok(engine.get(&member_key(key, rec.version(), member)))
            }
        }
    }

    fn container_len(&self, dbno: i32, key: &[u8], want: DataType) -> Result<i64, StoreError> {
        let now = self.now();
        match self.container_meta(self.engine(dbno), key, want, now)? {
            ContainerState::Missing { .. } => Ok(0),
            ContainerState::Live(rec) => Ok(rec.count() as i64),
        }
    }

    /// Collects `(member, value)` pairs in member byte order.
    fn container_scan(
        &self,
        dbno: i32,
        key: &[u8],
        want: DataType,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let now = self.now();
        let engine = self.engine(dbno);
        match self.container_meta(engine, key, want, now)? {
            ContainerState::Missing { .. } => Ok(Vec::new()),
            ContainerState::Live(rec) => {
                let prefix = member_prefix(key, rec.version());
                let mut out = Vec::with_capacity(rec.count().max(0) as usize);
                engine.scan_prefix(&prefix, &mut |record_key, value| {
                    let member = &record_key[prefix.len()..];
                    out.push((Bytes::copy_from_slice(member), Bytes::copy_from_slice(value)));
                });
                Ok(out)
            }
        }
    }

    // --- hashes ---

    pub fn hset(&self, dbno: i32, key: &[u8], pairs: &[(Bytes, Bytes)]) -> Result<i64, StoreError> {
        self.container_add(dbno, key, DataType::Hash, pairs)
    }

    pub fn hget(&self, dbno: i32, key: &[u8], field: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.container_get(dbno, key, DataType::Hash, field)
    }

    pub fn hdel(&self, dbno: i32, key: &[u8], fields: &[Bytes]) -> Result<i64, StoreError> {
        self.container_remove(dbno, key, DataType::Hash, fields)
    }

    pub fn hlen(&self, dbno: i32, key: &[u8]) -> Result<i64, StoreError> {
        self.container_len(dbno, key, DataType::Hash)
    }

    pub fn hexists(&self, dbno: i32, key: &[u8], field: &[u8]) -> Result<bool, StoreError> {
        Ok(self.hget(dbno, key, field)?.is_some())
    }

    pub fn hgetall(&self, dbno: i32, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        self.container_scan(dbno, key, DataType::Hash)
    }

    // --- sets ---

    pub fn sadd(&self, dbno: i32, key: &[u8], members: &[Bytes]) -> Result<i64, StoreError> {
        let entries: Vec<(Bytes, Bytes)> = members
            .iter()
            .map(|m| (m.clone(), Bytes::new()))
            .collect();
        self.container_add(dbno, key, DataType::Set, &entries)
    }

    pub fn srem(&self, dbno: i32, key: &[u8], members: &[Bytes]) -> Result<i64, StoreError> {
        self.container_remove(dbno, key, DataType::Set, members)
    }

    pub fn sismember(&self, dbno: i32, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
        Ok(self
            .container_get(dbno, key, DataType::Set, member)?
            .is_some())
    }

    pub fn scard(&self, dbno: i32, key: &[u8]) -> Result<i64, StoreError> {
        self.container_len(dbno, key, DataType::Set)
    }

    pub fn smembers(&self, dbno: i32, key: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        Ok(self
            .container_scan(dbno, key, DataType::Set)?
            .into_iter()
            .map(|(member, _)| member)
            .collect())
    }

    // --- sorted sets ---

    pub fn zadd(&self, dbno: i32, key: &[u8], pairs: &[(f64, Bytes)]) -> Result<i64, StoreError> {
        let entries: Vec<(Bytes, Bytes)> = pairs
            .iter()
            .map(|(score, member)| (member.clone(), encode_score(*score)))
            .collect();
        self.container_add(dbno, key, DataType::ZSet, &entries)
    }

    pub fn zscore(&self, dbno: i32, key: &[u8], member: &[u8]) -> Result<Option<f64>, StoreError> {
        Ok(self
            .container_get(dbno, key, DataType::ZSet, member)?
            .as_deref()
            .and_then(decode_score))
    }

    pub fn zincrby(
        &self,
        dbno: i32,
        key: &[u8],
        delta: f64,
        member: &[u8],
    ) -> Result<f64, StoreError> {
        let now = self.now();
        let engine = self.engine(dbno);
        match self.container_meta(engine, key, DataType::ZSet, now)? {
            ContainerState::Missing { prev_version } => {
                let mut meta = BaseMetaValue::new(DataType::ZSet);
                meta.set_version(prev_version);
                let version = meta.update_version(now);
                meta.set_ctime(now);
                meta.set_count(1);
                engine.put(&member_key(key, version, member), encode_score(delta));
                engine.put(&meta_key(key), Bytes::copy_from_slice(meta.encode()));
                self.txn.notify_dirty(dbno, key);
                Ok(delta)
            }
            ContainerState::Live(mut rec) => {
                let version = rec.version();
                let mkey = member_key(key, version, member);
                let old = engine.get(&mkey).as_deref().and_then(decode_score);
                let score = old.unwrap_or(0.0) + delta;
                engine.put(&mkey, encode_score(score));
                if old.is_none() {
                    rec.modify_count(1)?;
                    engine.put(&meta_key(key), Bytes::copy_from_slice(rec.as_bytes()));
                }
                self.txn.notify_dirty(dbno, key);
                Ok(score)
            }
        }
    }

    pub fn zrem(&self, dbno: i32, key: &[u8], members: &[Bytes]) -> Result<i64, StoreError> {
        self.container_remove(dbno, key, DataType::ZSet, members)
    }

    pub fn zcard(&self, dbno: i32, key: &[u8]) -> Result<i64, StoreError> {
        self.container_len(dbno, key, DataType::ZSet)
    }

    // --- maintenance ---

    /// Runs the two compaction passes over every database. Returns the
    /// number of dropped meta and member records.
    pub fn compact(&self) -> (usize, usize) {
        let _guard = self.cmd_lock.lock();
        let now = self.now();
        let mut metas = 0;
        let mut members = 0;
        for engine in &self.engines {
            let mut meta_filter = MetaCompactionFilter::new(now);
            metas += engine.compact(&mut meta_filter);
            let live_versions = meta_filter.into_live_versions();
            let mut member_filter = MemberCompactionFilter::new(&live_versions);
            members += engine.compact(&mut member_filter);
        }
        (metas, members)
    }
}

fn encode_score(score: f64) -> Bytes {
    Bytes::copy_from_slice(&score.to_le_bytes())
}

fn decode_score(raw: &[u8]) -> Option<f64> {
    raw.try_into().ok().map(f64::from_le_bytes)
}

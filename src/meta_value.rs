// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! Meta-value layout: the byte-encoded root record stored for every logical
//! key, in two shapes.
//!
//! String shape:
//! ```text
//! | type | user_value | reserve | ctime | timestamp |
//! |  1B  |     NB     |   16B   |  8B   |    8B     |
//! ```
//!
//! Container shape (hash / set / zset root):
//! ```text
//! | type | count | user_value | version | reserve | ctime | timestamp |
//! |  1B  |  4B   |     NB     |   8B    |   16B   |  8B   |    8B     |
//! ```
//!
//! All integers are fixed-width little-endian. The trailing suffix sits at
//! fixed offsets from the end so the payload length never has to be known to
//! find a field. `etime == 0` means no expiry. A container whose `count` is 0
//! is logically nonexistent; its `version` still drives invalidation of the
//! member records written under older versions.

use bytes::Bytes;

use crate::codec::{decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64, ByteBuf};
use crate::errors::StoreError;

pub const TYPE_LENGTH: usize = 1;
pub const COUNT_LENGTH: usize = 4;
pub const VERSION_LENGTH: usize = 8;
pub const RESERVE_LENGTH: usize = 16;
pub const TIMESTAMP_LENGTH: usize = 8;

/// reserve + ctime + etime
pub const STRING_META_SUFFIX_LENGTH: usize = RESERVE_LENGTH + 2 * TIMESTAMP_LENGTH;
/// version + reserve + ctime + etime
pub const BASE_META_SUFFIX_LENGTH: usize = VERSION_LENGTH + RESERVE_LENGTH + 2 * TIMESTAMP_LENGTH;

/// Minimum total length of each shape.
pub const STRING_META_MIN_LENGTH: usize = TYPE_LENGTH + STRING_META_SUFFIX_LENGTH;
pub const BASE_META_MIN_LENGTH: usize = TYPE_LENGTH + COUNT_LENGTH + BASE_META_SUFFIX_LENGTH;

/// The type byte. Immutable for the life of a logical key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    String = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
    List = 5,
}

impl DataType {
    pub fn from_byte(b: u8) -> Option<DataType> {
        match b {
            1 => Some(DataType::String),
            2 => Some(DataType::Hash),
            3 => Some(DataType::Set),
            4 => Some(DataType::ZSet),
            5 => Some(DataType::List),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Hash => "hash",
            DataType::Set => "set",
            DataType::ZSet => "zset",
            DataType::List => "list",
        }
    }

    pub fn is_container(self) -> bool {
        !matches!(self, DataType::String)
    }
}

/// `true` iff the record has an expiry and it has passed.
pub fn is_stale(etime: u64, now: u64) -> bool {
    etime != 0 && etime <= now
}

/// `true` iff `count + delta` stays within `[0, i32::MAX]`.
pub fn check_modify_count(count: i32, delta: i32) -> bool {
    let next = count as i64 + delta as i64;
    (0..=i32::MAX as i64).contains(&next)
}

/// Advances a version clock: the new version embeds the wall clock when it
/// has moved past the previous version, and increments otherwise so repeated
/// bumps within one second stay strictly increasing.
fn next_version(prev: u64, now: u64) -> u64 {
    if now > prev {
        now
    } else {
        prev + 1
    }
}

/// Encoder for fresh string records.
pub struct StringMetaValue {
    user_value: Bytes,
    reserve: [u8; RESERVE_LENGTH],
    ctime: u64,
    etime: u64,
    buf: ByteBuf,
}

impl StringMetaValue {
    pub fn new(user_value: Bytes) -> Self {
        Self {
            user_value,
            reserve: [0; RESERVE_LENGTH],
            ctime: 0,
            etime: 0,
            buf: ByteBuf::new(),
        }
    }

    pub fn set_ctime(&mut self, ctime: u64) {
        self.ctime = ctime;
    }

    pub fn set_etime(&mut self, etime: u64) {
        self.etime = etime;
    }

    /// Lays the record out in declared field order into a single span.
    pub fn encode(&mut self) -> &[u8] {
        let needed = TYPE_LENGTH + self.user_value.len() + STRING_META_SUFFIX_LENGTH;
        let dst = self.buf.alloc(needed);
        let mut offset = 0;
        dst[offset] = DataType::String.as_byte();
        offset += TYPE_LENGTH;
        dst[offset..offset + self.user_value.len()].copy_from_slice(&self.user_value);
        offset += self.user_value.len();
        dst[offset..offset + RESERVE_LENGTH].copy_from_slice(&self.reserve);
        offset += RESERVE_LENGTH;
        encode_fixed64(dst, offset, self.ctime);
        offset += TIMESTAMP_LENGTH;
        encode_fixed64(dst, offset, self.etime);
        self.buf.span(needed)
    }
}

/// Encoder for fresh container records.
pub struct BaseMetaValue {
    data_type: DataType,
    user_value: Bytes,
    count: i32,
    version: u64,
    reserve: [u8; RESERVE_LENGTH],
    ctime: u64,
    etime: u64,
    buf: ByteBuf,
}

impl BaseMetaValue {
    pub fn new(data_type: DataType) -> Self {
        Self::with_user_value(data_type, Bytes::new())
    }

    pub fn with_user_value(data_type: DataType, user_value: Bytes) -> Self {
        Self {
            data_type,
            user_value,
            count: 0,
            version: 0,
            reserve: [0; RESERVE_LENGTH],
            ctime: 0,
            etime: 0,
            buf: ByteBuf::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_count(&mut self, count: i32) {
        self.count = count;
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn set_ctime(&mut self, ctime: u64) {
        self.ctime = ctime;
    }

    pub fn set_etime(&mut self, etime: u64) {
        self.etime = etime;
    }

    /// Bumps the version clock and returns the new version.
    pub fn update_version(&mut self, now: u64) -> u64 {
        self.version = next_version(self.version, now);
        self.version
    }

    /// Lays the record out in declared field order into a single span.
    pub fn encode(&mut self) -> &[u8] {
        let needed =
            TYPE_LENGTH + COUNT_LENGTH + self.user_value.len() + BASE_META_SUFFIX_LENGTH;
        let dst = self.buf.alloc(needed);
        let mut offset = 0;
        dst[offset] = self.data_type.as_byte();
        offset += TYPE_LENGTH;
        encode_fixed32(dst, offset, self.count as u32);
        offset += COUNT_LENGTH;
        dst[offset..offset + self.user_value.len()].copy_from_slice(&self.user_value);
        offset += self.user_value.len();
        encode_fixed64(dst, offset, self.version);
        offset += VERSION_LENGTH;
        dst[offset..offset + RESERVE_LENGTH].copy_from_slice(&self.reserve);
        offset += RESERVE_LENGTH;
        encode_fixed64(dst, offset, self.ctime);
        offset += TIMESTAMP_LENGTH;
        encode_fixed64(dst, offset, self.etime);
        self.buf.span(needed)
    }
}

/// Borrowed view of a stored string record. Used on read paths and by the
/// compaction filter, where the caller's buffer outlives the parse; the
/// payload and reserve are slices into it, not copies.
pub struct ParsedStringMetaValue<'a> {
    value: &'a [u8],
    ctime: u64,
    etime: u64,
}

impl<'a> ParsedStringMetaValue<'a> {
    pub fn parse(value: &'a [u8]) -> Result<Self, StoreError> {
        if value.len() < STRING_META_MIN_LENGTH {
            return Err(StoreError::CorruptMeta(value.len()));
        }
        let ctime = decode_fixed64(value, value.len() - 2 * TIMESTAMP_LENGTH);
        let etime = decode_fixed64(value, value.len() - TIMESTAMP_LENGTH);
        Ok(Self { value, ctime, etime })
    }

    pub fn is_type(&self, t: DataType) -> bool {
        self.value[0] == t.as_byte()
    }

    pub fn user_value(&self) -> &'a [u8] {
        &self.value[TYPE_LENGTH..self.value.len() - STRING_META_SUFFIX_LENGTH]
    }

    pub fn reserve(&self) -> &'a [u8] {
        let end = self.value.len() - 2 * TIMESTAMP_LENGTH;
        &self.value[end - RESERVE_LENGTH..end]
    }

    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn etime(&self) -> u64 {
        self.etime
    }

    pub fn is_stale(&self, now: u64) -> bool {
        is_stale(self.etime, now)
    }

    pub fn is_valid(&self, now: u64) -> bool {
        !self.is_stale(now)
    }
}

/// Borrowed view of a stored container record.
pub struct ParsedBaseMetaValue<'a> {
    value: &'a [u8],
    count: i32,
    version: u64,
    ctime: u64,
    etime: u64,
}

impl<'a> ParsedBaseMetaValue<'a> {
    pub fn parse(value: &'a [u8]) -> Result<Self, StoreError> {
        if value.len() < BASE_META_MIN_LENGTH {
            return Err(StoreError::CorruptMeta(value.len()));
        }
        let count = decode_fixed32(value, TYPE_LENGTH) as i32;
        let version = decode_fixed64(value, value.len() - BASE_META_SUFFIX_LENGTH);
        let ctime = decode_fixed64(value, value.len() - 2 * TIMESTAMP_LENGTH);
        let etime = decode_fixed64(value, value.len() - TIMESTAMP_LENGTH);
        Ok(Self {
            value,
            count,
            version,
            ctime,
            etime,
        })
    }

    pub fn is_type(&self, t: DataType) -> bool {
        self.value[0] == t.as_byte()
    }

    pub fn user_value(&self) -> &'a [u8] {
        &self.value[TYPE_LENGTH + COUNT_LENGTH..self.value.len() - BASE_META_SUFFIX_LENGTH]
    }

    pub fn reserve(&self) -> &'a [u8] {
        let end = self.value.len() - 2 * TIMESTAMP_LENGTH;
        &self.value[end - RESERVE_LENGTH..end]
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn etime(&self) -> u64 {
        self.etime
    }

    pub fn is_stale(&self, now: u64) -> bool {
        is_stale(self.etime, now)
    }

    pub fn is_valid(&self, now: u64) -> bool {
        !self.is_stale(now) && self.count != 0
    }
}

/// Owned string record for read-modify-write paths. Mutators write single
/// fields in place at fixed offsets from the end of the buffer.
pub struct StringMetaRecord {
    buf: Vec<u8>,
    ctime: u64,
    etime: u64,
}

impl StringMetaRecord {
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, StoreError> {
        let parsed = ParsedStringMetaValue::parse(&buf)?;
        let (ctime, etime) = (parsed.ctime(), parsed.etime());
        Ok(Self { buf, ctime, etime })
    }

    pub fn is_type(&self, t: DataType) -> bool {
        self.buf[0] == t.as_byte()
    }

    pub fn user_value(&self) -> &[u8] {
        &self.buf[TYPE_LENGTH..self.buf.len() - STRING_META_SUFFIX_LENGTH]
    }

    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn etime(&self) -> u64 {
        self.etime
    }

    pub fn set_ctime(&mut self, ctime: u64) {
        self.ctime = ctime;
        let offset = self.buf.len() - 2 * TIMESTAMP_LENGTH;
        encode_fixed64(&mut self.buf, offset, ctime);
    }

    pub fn set_etime(&mut self, etime: u64) {
        self.etime = etime;
        let offset = self.buf.len() - TIMESTAMP_LENGTH;
        encode_fixed64(&mut self.buf, offset, etime);
    }

    pub fn is_stale(&self, now: u64) -> bool {
        is_stale(self.etime, now)
    }

    pub fn is_valid(&self, now: u64) -> bool {
        !self.is_stale(now)
    }

    /// Truncates the trailing suffix, leaving only the type byte and payload.
    pub fn strip_suffix(&mut self) {
        let len = self.buf.len() - STRING_META_SUFFIX_LENGTH;
        self.buf.truncate(len);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Owned container record for read-modify-write paths.
pub struct BaseMetaRecord {
    buf: Vec<u8>,
    count: i32,
    version: u64,
    ctime: u64,
    etime: u64,
}

impl BaseMetaRecord {
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, StoreError> {
        let parsed = ParsedBaseMetaValue::parse(&buf)?;
        let (count, version, ctime, etime) = (
            parsed.count(),
            parsed.version(),
            parsed.ctime(),
            parsed.etime(),
        );
        Ok(Self {
            buf,
            count,
            version,
            ctime,
            etime,
        })
    }

    pub fn is_type(&self, t: DataType) -> bool {
        self.buf[0] == t.as_byte()
    }

    pub fn user_value(&self) -> &[u8] {
        &self.buf[TYPE_LENGTH + COUNT_LENGTH..self.buf.len() - BASE_META_SUFFIX_LENGTH]
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn etime(&self) -> u64 {
        self.etime
    }

    pub fn set_count(&mut self, count: i32) {
        self.count = count;
        encode_fixed32(&mut self.buf, TYPE_LENGTH, count as u32);
    }

    pub fn check_modify_count(&self, delta: i32) -> bool {
        check_modify_count(self.count, delta)
    }

    /// Applies `delta` to the element count, rejecting any result outside
    /// `[0, i32::MAX]`.
    pub fn modify_count(&mut self, delta: i32) -> Result<(), StoreError> {
        if !self.check_modify_count(delta) {
            return Err(StoreError::CountOutOfRange);
        }
        self.set_count(self.count + delta);
        Ok(())
    }

    pub fn set_version_to_value(&mut self) {
        let offset = self.buf.len() - BASE_META_SUFFIX_LENGTH;
        encode_fixed64(&mut self.buf, offset, self.version);
    }

    pub fn set_ctime(&mut self, ctime: u64) {
        self.ctime = ctime;
        let offset = self.buf.len() - 2 * TIMESTAMP_LENGTH;
        encode_fixed64(&mut self.buf, offset, ctime);
    }

    pub fn set_etime(&mut self, etime: u64) {
        self.etime = etime;
        let offset = self.buf.len() - TIMESTAMP_LENGTH;
        encode_fixed64(&mut self.buf, offset, etime);
    }

    /// Bumps the version clock, writes it into the buffer, and returns it.
    pub fn update_version(&mut self, now: u64) -> u64 {
        self.version = next_version(self.version, now);
        self.set_version_to_value();
        self.version
    }

    /// Resets the record to a logically empty state while advancing the
    /// version, so member records written under the old version are dead.
    /// Returns the new version.
    pub fn initial_meta_value(&mut self, now: u64) -> u64 {
        self.set_count(0);
        self.set_etime(0);
        self.set_ctime(0);
        self.update_version(now)
    }

    pub fn is_stale(&self, now: u64) -> bool {
        is_stale(self.etime, now)
    }

    pub fn is_valid(&self, now: u64) -> bool {
        !self.is_stale(now) && self.count != 0
    }

    pub fn strip_suffix(&mut self) {
        let len = self.buf.len() - BASE_META_SUFFIX_LENGTH;
        self.buf.truncate(len);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_encode_layout() {
        let mut v = StringMetaValue::new(Bytes::from_static(b"hi"));
        v.set_ctime(10);
        let encoded = v.encode();
        assert_eq!(encoded.len(), 35);
        let mut expected = vec![1u8, b'h', b'i'];
        expected.extend_from_slice(&[0u8; 16]);
        expected.extend_from_slice(&10u64.to_le_bytes());
        expected.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(encoded, &expected[..]);
    }

    #[test]
    fn container_roundtrip() {
        let mut v = BaseMetaValue::new(DataType::Hash);
        v.set_count(3);
        v.set_version(100);
        v.set_ctime(5);
        let encoded = v.encode().to_vec();
        assert_eq!(encoded.len(), BASE_META_MIN_LENGTH);

        let parsed = ParsedBaseMetaValue::parse(&encoded).unwrap();
        assert!(parsed.is_type(DataType::Hash));
        assert_eq!(parsed.count(), 3);
        assert_eq!(parsed.user_value(), b"");
        assert_eq!(parsed.version(), 100);
        assert_eq!(parsed.ctime(), 5);
        assert_eq!(parsed.etime(), 0);
    }

    #[test]
    fn suffix_alignment() {
        let mut v = BaseMetaValue::with_user_value(DataType::Set, Bytes::from_static(b"hdr"));
        let encoded = v.encode().to_vec();
        let parsed = ParsedBaseMetaValue::parse(&encoded).unwrap();
        assert_eq!(
            parsed.user_value().len(),
            encoded.len() - TYPE_LENGTH - COUNT_LENGTH - BASE_META_SUFFIX_LENGTH
        );
        assert_eq!(parsed.user_value(), b"hdr");
    }

    #[test]
    fn version_bump_within_one_second() {
        let mut v = BaseMetaValue::new(DataType::Hash);
        v.set_version(1000);
        assert_eq!(v.update_version(1000), 1001);
        assert_eq!(v.update_version(1000), 1002);
    }

    #[test]
    fn version_monotone_and_at_least_now() {
        let mut v = BaseMetaValue::new(DataType::Set);
        let mut prev = 0;
        for now in [5u64, 5, 5, 100, 100, 40] {
            let next = v.update_version(now);
            assert!(next > prev, "version must be strictly increasing");
            assert!(next >= now, "version must be >= wall clock at call time");
            prev = next;
        }
    }

    #[test]
    fn staleness_boundaries() {
        assert!(!is_stale(50, 49));
        assert!(is_stale(50, 50));
        assert!(is_stale(50, 51));
        assert!(!is_stale(0, 1_000_000_000));
    }

    #[test]
    fn count_bounds() {
        assert!(check_modify_count(0, 0));
        assert!(check_modify_count(0, i32::MAX));
        assert!(!check_modify_count(1, i32::MAX));
        assert!(check_modify_count(1, -1));
        assert!(!check_modify_count(0, -1));
        assert!(!check_modify_count(i32::MAX, 1));
    }

    #[test]
    fn modify_count_writes_in_place() {
        let mut v = BaseMetaValue::new(DataType::Hash);
        v.set_count(2);
        let mut rec = BaseMetaRecord::from_bytes(v.encode().to_vec()).unwrap();
        rec.modify_count(3).unwrap();
        assert_eq!(rec.count(), 5);
        let parsed = ParsedBaseMetaValue::parse(rec.as_bytes()).unwrap();
        assert_eq!(parsed.count(), 5);
        assert_eq!(rec.modify_count(-6), Err(StoreError::CountOutOfRange));
        assert_eq!(rec.count(), 5);
    }

    #[test]
    fn mutators_hit_fixed_offsets() {
        let mut v = BaseMetaValue::with_user_value(DataType::ZSet, Bytes::from_static(b"xy"));
        v.set_version(7);
        let mut rec = BaseMetaRecord::from_bytes(v.encode().to_vec()).unwrap();
        rec.set_etime(123);
        rec.set_ctime(45);
        rec.update_version(1_000);
        let parsed = ParsedBaseMetaValue::parse(rec.as_bytes()).unwrap();
        assert_eq!(parsed.etime(), 123);
        assert_eq!(parsed.ctime(), 45);
        assert_eq!(parsed.version(), 1_000);
        assert_eq!(parsed.user_value(), b"xy");
    }

    #[test]
    fn initial_meta_value_resets_and_bumps() {
        let mut v = BaseMetaValue::new(DataType::Hash);
        v.set_count(9);
        v.set_version(2_000);
        v.set_ctime(10);
        v.set_etime(20);
        let mut rec = BaseMetaRecord::from_bytes(v.encode().to_vec()).unwrap();
        let version = rec.initial_meta_value(1_500);
        assert_eq!(version, 2_001);
        assert_eq!(rec.count(), 0);
        assert_eq!(rec.etime(), 0);
        assert_eq!(rec.ctime(), 0);
        assert!(!rec.is_valid(1_500));
    }

    #[test]
    fn strip_suffix_leaves_payload() {
        let mut v = StringMetaValue::new(Bytes::from_static(b"payload"));
        let mut rec = StringMetaRecord::from_bytes(v.encode().to_vec()).unwrap();
        rec.strip_suffix();
        assert_eq!(rec.as_bytes(), b"\x01payload");
    }

    #[test]
    fn short_buffers_are_corrupt() {
        assert_eq!(
            ParsedStringMetaValue::parse(&[1u8; STRING_META_MIN_LENGTH - 1]).err(),
            Some(StoreError::CorruptMeta(STRING_META_MIN_LENGTH - 1))
        );
        assert_eq!(
            ParsedBaseMetaValue::parse(&[2u8; BASE_META_MIN_LENGTH - 1]).err(),
            Some(StoreError::CorruptMeta(BASE_META_MIN_LENGTH - 1))
        );
        assert!(ParsedBaseMetaValue::parse(&[]).is_err());
    }
}

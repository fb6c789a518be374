// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! Per-client transaction state: the MULTI queue, the watch set, and the
//! multi/dirty flags. Mutated from the task currently dispatching this
//! client's command; `notify_dirty` can arrive from another client's write,
//! so everything lives behind the state mutex.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientFlag {
    /// Inside a MULTI block.
    Multi = 0x01,
    /// A watched key changed; the next EXEC must abort.
    Dirty = 0x02,
}

/// One deferred command: the raw argv as received off the wire.
#[derive(Clone, Debug)]
pub struct Command {
    pub argv: Vec<Bytes>,
}

impl Command {
    pub fn name(&self) -> String {
        self.argv
            .first()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default()
    }
}

struct ClientState {
    flags: u8,
    watch_keys: HashMap<i32, HashSet<Bytes>>,
    queued: Vec<Command>,
}

pub struct Client {
    id: u64,
    name: String,
    current_db: AtomicI32,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            current_db: AtomicI32::new(0),
            state: Mutex::new(ClientState {
                flags: 0,
                watch_keys: HashMap::new(),
                queued: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_db(&self) -> i32 {
        self.current_db.load(Ordering::Relaxed)
    }

    pub fn set_current_db(&self, dbno: i32) {
        self.current_db.store(dbno, Ordering::Relaxed);
    }

    pub fn set_flag(&self, flag: ClientFlag) {
        self.state.lock().flags |= flag as u8;
    }

    pub fn clear_flag(&self, flag: ClientFlag) {
        self.state.lock().flags &= !(flag as u8);
    }

    pub fn is_flag_on(&self, flag: ClientFlag) -> bool {
        self.state.lock().flags & flag as u8 != 0
    }

    /// Adds `(dbno, key)` to the watch set. Returns true iff newly added.
    pub fn watch(&self, dbno: i32, key: Bytes) -> bool {
        self.state
            .lock()
            .watch_keys
            .entry(dbno)
            .or_default()
            .insert(key)
    }

    pub fn watch_key_count(&self) -> usize {
        self.state.lock().watch_keys.values().map(HashSet::len).sum()
    }

    /// Drains the watch set, returning the pairs that were registered so the
    /// caller can drop the matching registry entries.
    pub fn clear_watch(&self) -> Vec<(i32, Bytes)> {
        let mut st = self.state.lock();
        st.watch_keys
            .drain()
            .flat_map(|(dbno, keys)| keys.into_iter().map(move |k| (dbno, k)))
            .collect()
    }

    /// Clears the MULTI flag and any queued commands.
    pub fn clear_multi(&self) {
        let mut st = self.state.lock();
        st.flags &= !(ClientFlag::Multi as u8);
        st.queued.clear();
    }

    pub fn queue(&self, cmd: Command) {
        self.state.lock().queued.push(cmd);
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn take_queued(&self) -> Vec<Command> {
        std::mem::take(&mut self.state.lock().queued)
    }

    /// Marks the client dirty if it watches `(dbno, key)`. Returns true when
    /// the flag was set, signaling the registry that further notifications
    /// for this client are redundant and its entry may be dropped.
    pub fn notify_dirty(&self, dbno: i32, key: &[u8]) -> bool {
        let mut st = self.state.lock();
        let watching = st
            .watch_keys
            .get(&dbno)
            .is_some_and(|keys| keys.contains(key));
        if watching {
            st.flags |= ClientFlag::Dirty as u8;
        }
        watching
    }
}

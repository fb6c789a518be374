// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! Optimistic transaction coordination: the process-wide watch registry and
//! the WATCH/MULTI/EXEC/DISCARD protocol.
//!
//! The registry maps `(dbno, key)` to the clients watching it, holding only
//! weak references so a disconnected client never stays pinned; dead entries
//! are reaped whenever a bucket is walked. Every mutating command reports the
//! keys it changed through [`TxnCoordinator::notify_dirty`] before replying.
//! That call is the single coupling point between the storage core and the
//! transaction core, and WATCH correctness depends on it being complete.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;

use crate::client::{Client, ClientFlag, Command};
use crate::errors::TxnError;
use crate::metrics;

type Watchers = Vec<Weak<Client>>;
type WatchedClients = HashMap<i32, HashMap<Bytes, Watchers>>;

pub struct TxnCoordinator {
    watched: Mutex<WatchedClients>,
}

impl Default for TxnCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnCoordinator {
    pub fn new() -> Self {
        Self {
            watched: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `client` as a watcher of `(dbno, key)`. Idempotent per
    /// client and key. Fails while the client is inside a MULTI block.
    pub fn watch(&self, client: &Arc<Client>, dbno: i32, key: Bytes) -> Result<(), TxnError> {
        if client.is_flag_on(ClientFlag::Multi) {
            return Err(TxnError::WatchInsideMulti);
        }
        if client.watch(dbno, key.clone()) {
            self.watched
                .lock()
                .entry(dbno)
                .or_default()
                .entry(key)
                .or_default()
                .push(Arc::downgrade(client));
        }
        Ok(())
    }

    /// Begins a MULTI block.
    pub fn multi(&self, client: &Client) -> Result<(), TxnError> {
        if client.is_flag_on(ClientFlag::Multi) {
            return Err(TxnError::MultiNested);
        }
        client.clear_multi();
        client.set_flag(ClientFlag::Multi);
        Ok(())
    }

    /// Runs the queued block. Aborts with `DirtyExec` when a watched key
    /// changed since WATCH. The client's watches are released before the
    /// replay so the transaction's own writes cannot dirty it; `run` is
    /// invoked once per queued command in submission order.
    pub fn exec<F, R>(&self, client: &Arc<Client>, mut run: F) -> Result<Vec<R>, TxnError>
    where
        F: FnMut(Command) -> R,
    {
        if !client.is_flag_on(ClientFlag::Multi) {
            return Err(TxnError::ExecWithoutMulti);
        }
        if client.is_flag_on(ClientFlag::Dirty) {
            self.unwatch_all(client);
            client.clear_multi();
            client.clear_flag(ClientFlag::Dirty);
            return Err(TxnError::DirtyExec);
        }
        self.unwatch_all(client);
        let queued = client.take_queued();
        let replies = queued.into_iter().map(&mut run).collect();
        client.clear_multi();
        Ok(replies)
    }

    /// Aborts the current MULTI block and releases the client's watches.
    pub fn discard(&self, client: &Arc<Client>) -> Result<(), TxnError> {
        if !client.is_flag_on(ClientFlag::Multi) {
            return Err(TxnError::DiscardWithoutMulti);
        }
        self.unwatch_all(client);
        client.clear_multi();
        client.clear_flag(ClientFlag::Dirty);
        Ok(())
    }

    /// Removes every registry entry of `client` and clears its watch set.
    /// Also called by the server when a client disconnects.
    pub fn unwatch_all(&self, client: &Arc<Client>) {
        let keys = client.clear_watch();
        if keys.is_empty() {
            return;
        }
        let mut watched = self.watched.lock();
        for (dbno, key) in keys {
            let Some(db_keys) = watched.get_mut(&dbno) else {
                continue;
            };
            if let Some(watchers) = db_keys.get_mut(&key) {
                watchers.retain(|w| {
                    w.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, client))
                });
                if watchers.is_empty() {
                    db_keys.remove(&key);
                }
            }
        }
    }

    /// Marks every live watcher of `(dbno, key)` dirty, in registration
    /// order. Dead weak references are reaped on the way, and watchers that
    /// report dirty are dropped from the bucket since further notifications
    /// for them are redundant. Empty buckets are compacted.
    pub fn notify_dirty(&self, dbno: i32, key: &[u8]) {
        let mut watched = self.watched.lock();
        let Some(db_keys) = watched.get_mut(&dbno) else {
            return;
        };
        let Some(watchers) = db_keys.get_mut(key) else {
            return;
        };
        watchers.retain(|weak| match weak.upgrade() {
            None => {
                warn!(
                    "erase gone client when notifying dirty key [{}]",
                    String::from_utf8_lossy(key)
                );
                metrics::REAPED_WATCHER_COUNT.inc();
                false
            }
            Some(client) => {
                if client.notify_dirty(dbno, key) {
                    warn!(
                        "erase dirty client {} when notifying dirty key [{}]",
                        client.name(),
                        String::from_utf8_lossy(key)
                    );
                    metrics::DIRTY_NOTIFY_COUNT.inc();
                    false
                } else {
                    true
                }
            }
        });
        if watchers.is_empty() {
            db_keys.remove(key);
        }
    }

    /// Marks every watcher in `dbno` dirty, or in all databases when
    /// `dbno == -1`. Entries are not removed; this runs on flush, where a
    /// later pass cleans up.
    pub fn notify_dirty_all(&self, dbno: i32) {
        let watched = self.watched.lock();
        let mark = |db_keys: &HashMap<Bytes, Watchers>| {
            for watchers in db_keys.values() {
                for weak in watchers {
                    if let Some(client) = weak.upgrade() {
                        client.set_flag(ClientFlag::Dirty);
                    }
                }
            }
        };
        if dbno == -1 {
            for db_keys in watched.values() {
                mark(db_keys);
            }
        } else if let Some(db_keys) = watched.get(&dbno) {
            mark(db_keys);
        }
    }

    /// Number of keys with at least one registered watcher.
    pub fn watched_key_count(&self) -> usize {
        self.watched.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: u64) -> Arc<Client> {
        Arc::new(Client::new(id, format!("client-{}", id)))
    }

    #[test]
    fn watch_registers_once() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.watch(&c, 0, Bytes::from_static(b"k")).unwrap();
        txn.watch(&c, 0, Bytes::from_static(b"k")).unwrap();
        assert_eq!(txn.watched_key_count(), 1);
        assert_eq!(c.watch_key_count(), 1);
    }

    #[test]
    fn watch_inside_multi_fails() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.multi(&c).unwrap();
        assert_eq!(
            txn.watch(&c, 0, Bytes::from_static(b"k")),
            Err(TxnError::WatchInsideMulti)
        );
    }

    #[test]
    fn notify_marks_dirty_and_drops_watcher() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.watch(&c, 0, Bytes::from_static(b"k")).unwrap();
        txn.notify_dirty(0, b"k");
        assert!(c.is_flag_on(ClientFlag::Dirty));
        // The dirty watcher was dropped and the empty bucket compacted.
        assert_eq!(txn.watched_key_count(), 0);
    }

    #[test]
    fn notify_other_db_is_a_noop() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.watch(&c, 0, Bytes::from_static(b"k")).unwrap();
        txn.notify_dirty(1, b"k");
        txn.notify_dirty(0, b"other");
        assert!(!c.is_flag_on(ClientFlag::Dirty));
        assert_eq!(txn.watched_key_count(), 1);
    }

    #[test]
    fn dead_watchers_are_reaped() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.watch(&c, 0, Bytes::from_static(b"k")).unwrap();
        drop(c);
        assert_eq!(txn.watched_key_count(), 1);
        txn.notify_dirty(0, b"k");
        assert_eq!(txn.watched_key_count(), 0);
    }

    #[test]
    fn exec_replays_in_submission_order() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.multi(&c).unwrap();
        for name in ["a", "b", "c"] {
            c.queue(Command {
                argv: vec![Bytes::copy_from_slice(name.as_bytes())],
            });
        }
        let replies = txn.exec(&c, |cmd| cmd.name()).unwrap();
        assert_eq!(replies, vec!["A", "B", "C"]);
        assert!(!c.is_flag_on(ClientFlag::Multi));
    }

    #[test]
    fn dirty_exec_aborts_and_clears_state() {
        let txn = TxnCoordinator::new();
        let c = client(1);
        txn.watch(&c, 0, Bytes::from_static(b"k")).unwrap();
        txn.multi(&c).unwrap();
        txn.notify_dirty(0, b"k");
        let mut ran = 0;
        let result = txn.exec(&c, |_| ran += 1);
        assert!(matches!(result, Err(TxnError::DirtyExec)));
        assert_eq!(ran, 0, "queued commands must not run on a dirty exec");
        assert!(!c.is_flag_on(ClientFlag::Multi));
        assert!(!c.is_flag_on(ClientFlag::Dirty));
        assert_eq!(c.watch_key_count(), 0);
    }

    #[test]
    fn notify_dirty_all_spans_databases() {
        let txn = TxnCoordinator::new();
        let a = client(1);
        let b = client(2);
        txn.watch(&a, 0, Bytes::from_static(b"x")).unwrap();
        txn.watch(&b, 3, Bytes::from_static(b"y")).unwrap();

        txn.notify_dirty_all(0);
        assert!(a.is_flag_on(ClientFlag::Dirty));
        assert!(!b.is_flag_on(ClientFlag::Dirty));

        txn.notify_dirty_all(-1);
        assert!(b.is_flag_on(ClientFlag::Dirty));
        // Flag-only sweep: entries stay for a later cleanup pass.
        assert_eq!(txn.watched_key_count(), 2);
    }
}

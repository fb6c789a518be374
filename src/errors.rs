// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors
use thiserror::Error;

/// Errors surfaced by the typed storage layer. Each maps to a Redis protocol
/// error reply; none is fatal to the server.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is out of range")]
    CountOutOfRange,

    /// Stored record shorter than the fixed suffix for its shape. The read
    /// path reports the key as nonexistent; the compaction filter drops it.
    #[error("meta value too short: {0} bytes")]
    CorruptMeta(usize),
}

/// Sequencing errors of the WATCH/MULTI/EXEC/DISCARD protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxnError {
    #[error("ERR WATCH inside MULTI is not allowed")]
    WatchInsideMulti,

    #[error("ERR MULTI calls can not be nested")]
    MultiNested,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    /// A watched key changed between WATCH and EXEC. The wire layer replies
    /// with a nil array rather than an error string.
    #[error("EXECABORT Transaction aborted because a watched key changed")]
    DirtyExec,
}

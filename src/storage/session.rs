// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Engine and session traits.
//!
//! A [`KvEngine`] is the embedded storage engine as a whole; a [`Session`] is
//! a single-threaded transactional handle into it. All transaction-shaping
//! options travel as textual configuration strings in the engine's
//! comma-separated `key=value` format, with timestamps encoded as lowercase
//! 16-digit hex (see [`Timestamp::to_config_hex`]).

use crate::time::Timestamp;

use super::error::StorageError;

/// A transactional session handle into the storage engine.
///
/// A session owns at most one open transaction at a time and is not safe to
/// share across threads; thread-safety lives in the engine behind it.
pub trait Session: Send {
    /// Opens a transaction. Accepts `ignore_prepare=true` or an empty
    /// configuration.
    fn begin_transaction(&mut self, config: &str) -> Result<(), StorageError>;

    /// Commits the open transaction.
    fn commit_transaction(&mut self) -> Result<(), StorageError>;

    /// Rolls back the open transaction.
    fn rollback_transaction(&mut self) -> Result<(), StorageError>;

    /// Prepares the open transaction for two-phase commit. Requires
    /// `prepare_timestamp=<hex>` in the configuration.
    fn prepare_transaction(&mut self, config: &str) -> Result<(), StorageError>;

    /// Attaches a timestamp to the open transaction. Accepts
    /// `commit_timestamp=<hex>`, or `read_timestamp=<hex>` optionally
    /// combined with `round_to_oldest=true`.
    fn timestamp_transaction(&mut self, config: &str) -> Result<(), StorageError>;

    /// Queries a transaction timestamp; `get=read` returns the effective
    /// read timestamp after any rounding the engine applied.
    fn query_timestamp(&mut self, config: &str) -> Result<Timestamp, StorageError>;

    /// Reads a key within the open transaction.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes a key within the open transaction.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Deletes a key within the open transaction.
    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Closes every cursor cached on this session.
    fn close_all_cursors(&mut self);

    /// Controls whether this session processes queued ident drops when it is
    /// returned to the cache. Ancillary sessions turn this off.
    fn set_drop_queued_idents_allowed(&mut self, allowed: bool);

    /// Exports session statistics; `statistics=(fast)` selects the cheap
    /// counters.
    fn statistics(&mut self, config: &str) -> Result<Vec<(String, i64)>, StorageError>;
}

/// The embedded storage engine.
pub trait KvEngine: Send + Sync {
    /// Opens a new session.
    fn open_session(&self) -> Result<Box<dyn Session>, StorageError>;

    /// Blocks until outstanding writes are durable. A plain journal flush
    /// (`force_checkpoint = false`) does not protect writes to unjournaled
    /// tables; a stable checkpoint does.
    fn wait_until_durable(
        &self,
        force_checkpoint: bool,
        stable_checkpoint: bool,
    ) -> Result<(), StorageError>;
}

// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Committed-snapshot registry.
//!
//! The replication layer publishes two timestamps here: the newest snapshot
//! known to be committed on a majority of the replica set, and the local
//! last-applied snapshot. Readers bind transactions to one of them; the bind
//! happens under the registry lock so the snapshot cannot be replaced between
//! choosing the timestamp and anchoring the read view.

use parking_lot::Mutex;

use crate::time::Timestamp;

use super::begin_txn::{BeginTxnBlock, IgnorePrepared, RoundToOldest};
use super::error::StorageError;
use super::session::Session;

/// Registry of majority-committed and local snapshots.
#[derive(Default)]
pub struct SnapshotManager {
    committed: Mutex<Option<Timestamp>>,
    local: Mutex<Option<Timestamp>>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a new majority-committed snapshot.
    pub fn set_committed_snapshot(&self, timestamp: Timestamp) {
        *self.committed.lock() = Some(timestamp);
    }

    /// Forgets the majority-committed snapshot (e.g. on rollback to stable).
    pub fn drop_all_snapshots(&self) {
        *self.committed.lock() = None;
    }

    /// The snapshot the next majority-committed read would use, if any.
    pub fn committed_snapshot(&self) -> Option<Timestamp> {
        *self.committed.lock()
    }

    /// Publishes the local last-applied snapshot.
    pub fn set_local_snapshot(&self, timestamp: Timestamp) {
        *self.local.lock() = Some(timestamp);
    }

    /// Forgets the local snapshot.
    pub fn clear_local_snapshot(&self) {
        *self.local.lock() = None;
    }

    /// The local last-applied snapshot, if any.
    pub fn local_snapshot(&self) -> Option<Timestamp> {
        *self.local.lock()
    }

    /// Opens a transaction on `session` anchored to the majority-committed
    /// snapshot and returns the timestamp it was bound to.
    pub fn begin_transaction_on_committed_snapshot(
        &self,
        session: &mut dyn Session,
        ignore_prepared: IgnorePrepared,
    ) -> Result<Timestamp, StorageError> {
        let committed = self.committed.lock();
        let read_timestamp = committed.ok_or(StorageError::SnapshotUnavailable)?;
        Self::begin_at(session, ignore_prepared, read_timestamp)?;
        Ok(read_timestamp)
    }

    /// Opens a transaction on `session` anchored to the local last-applied
    /// snapshot and returns the timestamp it was bound to.
    pub fn begin_transaction_on_local_snapshot(
        &self,
        session: &mut dyn Session,
        ignore_prepared: IgnorePrepared,
    ) -> Result<Timestamp, StorageError> {
        let local = self.local.lock();
        let read_timestamp = local.ok_or(StorageError::SnapshotUnavailable)?;
        Self::begin_at(session, ignore_prepared, read_timestamp)?;
        Ok(read_timestamp)
    }

    fn begin_at(
        session: &mut dyn Session,
        ignore_prepared: IgnorePrepared,
        read_timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        let mut block = BeginTxnBlock::new(session, ignore_prepared)?;
        block.set_read_timestamp(read_timestamp, RoundToOldest::NoRound)?;
        block.done();
        Ok(())
    }
}

// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Oplog visibility seam.

use crate::time::Timestamp;

/// Tracks how much of the oplog is safe to read and reacts to out-of-order
/// timestamped commits.
///
/// The transaction layer only ever calls into this interface; injecting it
/// keeps the replication-side machinery mockable.
pub trait OplogManager: Send + Sync {
    /// Timestamp at or before which every oplog entry is fully visible.
    /// Oplog tailers pin their read view here so they never observe holes.
    fn oplog_read_timestamp(&self) -> Timestamp;

    /// The largest timestamp such that all writes with smaller timestamps
    /// have committed.
    fn all_committed_timestamp(&self) -> Timestamp;

    /// Forces a journal flush so that an earlier commit with a later
    /// timestamp becomes externally visible in timestamp order.
    fn trigger_journal_flush(&self);
}

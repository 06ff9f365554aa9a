// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Side-effect handlers attached to a unit of work.

use crate::time::Timestamp;

/// A commit/rollback side-effect handler.
///
/// Registered during a unit of work via
/// [`RecoveryUnit::register_change`](crate::txn::RecoveryUnit::register_change);
/// the recovery unit owns the handler until the unit of work ends. On commit,
/// handlers run in registration order after the storage commit succeeded; on
/// rollback they run in reverse registration order. Handler execution is not
/// guaranteed to observe the just-committed data as visible to new readers.
///
/// Handlers must not panic. A panic while handlers run aborts the process,
/// since the side effects can be neither completed nor undone.
pub trait Change: Send {
    /// Invoked after a successful storage commit. `commit_time` is the
    /// effective commit timestamp of the unit of work, if one was set.
    fn commit(&mut self, commit_time: Option<Timestamp>);

    /// Invoked after the storage rollback.
    fn rollback(&mut self);
}

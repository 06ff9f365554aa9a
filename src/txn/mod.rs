// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Per-operation transaction layer.
//!
//! This module provides the [`RecoveryUnit`], the object a higher-level
//! operation holds for the duration of a read or a write:
//! - lazily binds a pooled engine session and opens exactly one storage
//!   transaction at a read point chosen by a [`ReadSource`];
//! - scopes writes into units of work with commit/rollback side-effect
//!   handlers ([`Change`]) run in registration order on commit and reverse
//!   order on rollback;
//! - enforces the timestamp rules replication depends on: per-write
//!   timestamps, whole-transaction commit timestamps, and two-phase prepare;
//! - wakes prepare-conflict waiters when a prepared unit of work completes,
//!   and keeps oplog visibility ordered for out-of-order timestamped commits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rubidiumdb::storage::{KvEngine, MemoryEngine, OplogManager, Session, SessionCache};
//! use rubidiumdb::time::Timestamp;
//! use rubidiumdb::txn::RecoveryUnit;
//!
//! # struct NoopOplog;
//! # impl OplogManager for NoopOplog {
//! #     fn oplog_read_timestamp(&self) -> Timestamp { Timestamp::new(0) }
//! #     fn all_committed_timestamp(&self) -> Timestamp { Timestamp::new(0) }
//! #     fn trigger_journal_flush(&self) {}
//! # }
//! # fn example() -> Result<(), rubidiumdb::txn::TxnError> {
//! let engine = Arc::new(MemoryEngine::new());
//! let cache = Arc::new(SessionCache::new(engine as Arc<dyn KvEngine>));
//! let oplog = Arc::new(NoopOplog) as Arc<dyn OplogManager>;
//!
//! let mut recovery_unit = RecoveryUnit::new(cache, oplog);
//! recovery_unit.begin_unit_of_work();
//! recovery_unit.session()?.put(b"key", b"value")?;
//! recovery_unit.set_timestamp(Timestamp::new(7))?;
//! recovery_unit.commit_unit_of_work();
//! # Ok(())
//! # }
//! ```

mod change;
mod error;
mod recovery_unit;
mod state;

pub use change::Change;
pub use error::TxnError;
pub use recovery_unit::{
    set_always_notify_prepare_conflict_waiters, set_slow_transaction_threshold_ms,
    slow_transaction_threshold_ms, ReadSource, RecoveryUnit, SnapshotId,
};
pub use state::State;

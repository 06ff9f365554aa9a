// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Storage-engine seam.
//!
//! This module defines the boundary between the transaction layer and the
//! embedded key-value engine: the [`Session`]/[`KvEngine`] traits and their
//! textual transaction-configuration format, the [`BeginTxnBlock`] guard that
//! rolls back half-opened transactions, the [`SessionCache`] pool with its
//! prepare-conflict waiter protocol, the [`SnapshotManager`] registry of
//! replication snapshots, the [`OplogManager`] visibility seam, and an
//! in-memory reference engine for tests and benchmarks.

mod begin_txn;
mod error;
mod memory;
mod oplog;
mod session;
mod session_cache;
mod snapshot;

pub use begin_txn::{BeginTxnBlock, IgnorePrepared, RoundToOldest};
pub use error::StorageError;
pub use memory::{MemoryEngine, MemorySession};
pub use oplog::OplogManager;
pub use session::{KvEngine, Session};
pub use session_cache::{SessionCache, SessionHandle};
pub use snapshot::SnapshotManager;

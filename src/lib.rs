// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! RubidiumDB storage adaptor: per-operation transactional recovery units
//! over an embedded MVCC key-value storage engine.
//!
//! This crate provides the transaction façade a database server holds per
//! logical operation: session binding, read-source selection, unit-of-work
//! scoping with side-effect handlers, two-phase prepare, and the oplog
//! visibility and durability hooks replication depends on.

pub mod storage;
pub mod time;
pub mod txn;

pub use storage::{
    BeginTxnBlock, IgnorePrepared, KvEngine, MemoryEngine, MemorySession, OplogManager,
    RoundToOldest, Session, SessionCache, SessionHandle, SnapshotManager, StorageError,
};
pub use time::Timestamp;
pub use txn::{Change, ReadSource, RecoveryUnit, SnapshotId, State, TxnError};

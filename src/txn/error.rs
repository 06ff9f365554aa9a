// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction-layer error types.

use crate::storage::StorageError;
use crate::time::Timestamp;

/// Errors surfaced by recovery-unit operations.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("read concern majority reads are currently not possible")]
    ReadConcernMajorityNotAvailableYet,

    #[error("read timestamp {requested} is older than the oldest available timestamp")]
    SnapshotTooOld { requested: Timestamp },

    #[error("storage engine error: {0}")]
    Storage(#[from] StorageError),
}

// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Scoped transaction-begin guard.
//!
//! [`BeginTxnBlock`] opens a transaction on construction and rolls it back on
//! drop unless [`BeginTxnBlock::done`] was called. Every path that opens a
//! transaction and then fails partway (setting a read timestamp, querying the
//! rounded timestamp) leaves the session clean.

use crate::time::Timestamp;

use super::error::StorageError;
use super::session::Session;

/// Whether a new transaction reads through prepared-but-uncommitted writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnorePrepared {
    /// Prepared writes are invisible and do not conflict.
    Ignore,
    /// Reads that hit a prepared write report a prepare conflict.
    #[default]
    NoIgnore,
}

/// Whether a read timestamp older than the engine's oldest timestamp is
/// rounded up or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundToOldest {
    Round,
    NoRound,
}

/// A transaction opened on a session, rolled back on drop unless finished.
pub struct BeginTxnBlock<'s> {
    session: &'s mut dyn Session,
    rollback: bool,
}

impl<'s> BeginTxnBlock<'s> {
    /// Opens a transaction on `session`.
    pub fn new(
        session: &'s mut dyn Session,
        ignore_prepared: IgnorePrepared,
    ) -> Result<Self, StorageError> {
        let config = match ignore_prepared {
            IgnorePrepared::Ignore => "ignore_prepare=true",
            IgnorePrepared::NoIgnore => "",
        };
        session.begin_transaction(config)?;
        Ok(Self {
            session,
            rollback: true,
        })
    }

    /// Anchors the transaction's read view to `read_timestamp`.
    pub fn set_read_timestamp(
        &mut self,
        read_timestamp: Timestamp,
        round: RoundToOldest,
    ) -> Result<(), StorageError> {
        let config = match round {
            RoundToOldest::Round => format!(
                "read_timestamp={},round_to_oldest=true",
                read_timestamp.to_config_hex()
            ),
            RoundToOldest::NoRound => {
                format!("read_timestamp={}", read_timestamp.to_config_hex())
            }
        };
        self.session.timestamp_transaction(&config)
    }

    /// The underlying session, for queries against the open transaction.
    pub fn session(&mut self) -> &mut dyn Session {
        &mut *self.session
    }

    /// Keeps the transaction open past the end of the block.
    pub fn done(mut self) {
        self.rollback = false;
    }
}

impl Drop for BeginTxnBlock<'_> {
    fn drop(&mut self) {
        if self.rollback {
            if let Err(err) = self.session.rollback_transaction() {
                panic!("rollback_transaction failed while abandoning a transaction begin: {err}");
            }
        }
    }
}

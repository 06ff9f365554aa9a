// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Per-operation transactional recovery unit.
//!
//! A [`RecoveryUnit`] is held by one logical operation for the duration of a
//! read or write. It lazily binds a session from the [`SessionCache`], opens
//! exactly one storage transaction at a read point chosen by its
//! [`ReadSource`], collects [`Change`] handlers during a unit of work, and
//! drives the transaction to commit or rollback under replication-compatible
//! timestamp rules (snapshot reads, point-in-time reads, two-phase prepare).
//!
//! # State machine
//!
//! ```text
//! Inactive ──begin_unit_of_work──► InactiveInUnitOfWork
//! Inactive ──session (open txn)──► ActiveNotInUnitOfWork
//! ActiveNotInUnitOfWork ──begin_unit_of_work──► Active
//! ActiveNotInUnitOfWork ──abandon_snapshot──► Inactive
//! InactiveInUnitOfWork ──session (open txn)──► Active
//! {Active, InactiveInUnitOfWork} ──commit/abort──► Committing/Aborting ──► Inactive
//! ```
//!
//! Operations issued in an illegal state, and timestamp combinations that
//! violate the invariants below, are programmer errors and panic with the
//! current state name:
//!
//! - a per-write timestamp (`set_timestamp`) and a whole-transaction commit
//!   timestamp (`set_commit_timestamp`) are never both set;
//! - a commit timestamp may join a prepare timestamp only inside a prepared
//!   unit of work;
//! - the read source may change only while no transaction is open.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, Level};

use crate::storage::{
    BeginTxnBlock, IgnorePrepared, OplogManager, RoundToOldest, Session, SessionCache,
    SessionHandle, StorageError,
};
use crate::time::Timestamp;

use super::change::Change;
use super::error::TxnError;
use super::state::State;

// Snapshot ids are compared across recovery units (a cursor surviving a batch
// boundary may be re-bound to a different recovery unit), so they come from
// one process-wide counter and are never reused.
static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

static SLOW_TRANSACTION_THRESHOLD_MS: AtomicU64 = AtomicU64::new(100);

// Test hook: notify prepare-conflict waiters on every unit of work, prepared
// or not. Needed when prepare conflicts are injected at random, since the
// recovery unit may never actually reach a prepared state.
static ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS: AtomicBool = AtomicBool::new(false);

/// Transactions alive at least this long (and at least 1 ms) are logged at
/// debug level when they close.
pub fn set_slow_transaction_threshold_ms(millis: u64) {
    SLOW_TRANSACTION_THRESHOLD_MS.store(millis, Ordering::Relaxed);
}

pub fn slow_transaction_threshold_ms() -> u64 {
    SLOW_TRANSACTION_THRESHOLD_MS.load(Ordering::Relaxed)
}

/// Test hook: when enabled, every unit of work completion notifies
/// prepare-conflict waiters, not just prepared ones.
pub fn set_always_notify_prepare_conflict_waiters(enabled: bool) {
    ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS.store(enabled, Ordering::Relaxed);
}

fn always_notify_prepare_conflict_waiters() -> bool {
    ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS.load(Ordering::Relaxed)
}

/// Opaque identifier of a recovery unit's current read view, unique within
/// the process and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(u64);

impl SnapshotId {
    fn allocate() -> Self {
        Self(NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Policy selecting the timestamp a new transaction anchors its read view to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadSource {
    /// No read source decided yet; reads the latest data.
    #[default]
    Unset,
    /// Explicitly untimestamped; reads the latest data.
    NoTimestamp,
    /// The snapshot replicated to a majority of the replica set.
    MajorityCommitted,
    /// The local last-applied snapshot when one exists, latest data otherwise.
    LastApplied,
    /// The local last-applied snapshot, chosen once and reused for every
    /// subsequent transaction on this recovery unit.
    LastAppliedSnapshot,
    /// The all-committed timestamp, chosen once and reused for every
    /// subsequent transaction on this recovery unit.
    AllCommittedSnapshot,
    /// A caller-supplied read timestamp.
    Provided(Timestamp),
}

/// The per-operation transactional façade over the storage engine.
///
/// A recovery unit is owned by exactly one logical operation at a time; its
/// methods are not safe to call concurrently. The shared state it touches
/// (session cache, snapshot registry, oplog manager, global counters) is
/// thread-safe on its own.
pub struct RecoveryUnit {
    session_cache: Arc<SessionCache>,
    oplog_manager: Arc<dyn OplogManager>,
    state: State,
    session: Option<SessionHandle>,
    snapshot_id: SnapshotId,
    changes: Vec<Box<dyn Change>>,
    commit_timestamp: Option<Timestamp>,
    last_timestamp_set: Option<Timestamp>,
    prepare_timestamp: Option<Timestamp>,
    read_at_timestamp: Option<Timestamp>,
    majority_committed_snapshot: Option<Timestamp>,
    read_source: ReadSource,
    ignore_prepared: IgnorePrepared,
    is_oplog_reader: bool,
    ordered_commit: bool,
    is_timestamped: bool,
    timer: Option<Instant>,
}

fn bound_session<'a>(
    session: &'a mut Option<SessionHandle>,
    state: State,
) -> &'a mut dyn Session {
    match session {
        Some(session) => &mut **session,
        None => unreachable!("no session bound in state {state}"),
    }
}

fn run_change_handlers<F: FnOnce()>(handlers: F) {
    // Side effects can be neither completed nor undone once a handler fails,
    // so a panic here takes the process down.
    if panic::catch_unwind(AssertUnwindSafe(handlers)).is_err() {
        tracing::error!("change handler panicked during commit or rollback");
        process::abort();
    }
}

impl RecoveryUnit {
    pub fn new(session_cache: Arc<SessionCache>, oplog_manager: Arc<dyn OplogManager>) -> Self {
        Self {
            session_cache,
            oplog_manager,
            state: State::Inactive,
            session: None,
            snapshot_id: SnapshotId::allocate(),
            changes: Vec::new(),
            commit_timestamp: None,
            last_timestamp_set: None,
            prepare_timestamp: None,
            read_at_timestamp: None,
            majority_committed_snapshot: None,
            read_source: ReadSource::Unset,
            ignore_prepared: IgnorePrepared::NoIgnore,
            is_oplog_reader: false,
            ordered_commit: true,
            is_timestamped: false,
            timer: None,
        }
    }

    /// Enters a unit of work. Illegal while already in one, and while commit
    /// or rollback handlers are running.
    pub fn begin_unit_of_work(&mut self) {
        assert!(
            !self.state.in_unit_of_work(),
            "already in a unit of work (state: {})",
            self.state
        );
        assert!(
            !self.state.is_committing_or_aborting(),
            "cannot begin a unit of work while commit or rollback handlers are running \
             (state: {})",
            self.state
        );
        let next = if self.state.is_active() {
            State::Active
        } else {
            State::InactiveInUnitOfWork
        };
        self.set_state(next);
    }

    /// Prepares the open transaction for two-phase commit. The unit of work
    /// stays open; a later commit or abort closes it.
    pub fn prepare_unit_of_work(&mut self) -> Result<(), TxnError> {
        assert!(
            self.state.in_unit_of_work(),
            "not in a unit of work (state: {})",
            self.state
        );
        let prepare_timestamp = match self.prepare_timestamp {
            Some(timestamp) => timestamp,
            None => panic!(
                "prepare_unit_of_work without a prepare timestamp (state: {})",
                self.state
            ),
        };

        self.session()?;
        debug!(timestamp = %prepare_timestamp, "preparing transaction");

        let config = format!("prepare_timestamp={}", prepare_timestamp.to_config_hex());
        let session = bound_session(&mut self.session, self.state);
        if let Err(err) = session.prepare_transaction(&config) {
            panic!("prepare_transaction failed: {err}");
        }
        Ok(())
    }

    /// Commits the unit of work: closes the transaction, notifies
    /// prepare-conflict waiters when prepared, then runs commit handlers in
    /// registration order.
    pub fn commit_unit_of_work(&mut self) {
        assert!(
            self.state.in_unit_of_work(),
            "not in a unit of work (state: {})",
            self.state
        );
        self.commit_impl();
    }

    /// Aborts the unit of work: rolls the transaction back, notifies
    /// prepare-conflict waiters when prepared, then runs rollback handlers in
    /// reverse registration order.
    pub fn abort_unit_of_work(&mut self) {
        assert!(
            self.state.in_unit_of_work(),
            "not in a unit of work (state: {})",
            self.state
        );
        self.abort_impl();
    }

    /// Registers a side-effect handler on the current unit of work.
    pub fn register_change(&mut self, change: Box<dyn Change>) {
        assert!(
            self.state.in_unit_of_work(),
            "cannot register a change outside a unit of work (state: {})",
            self.state
        );
        self.changes.push(change);
    }

    /// Returns the bound session, opening the transaction first if none is
    /// open. This is the only place transactions are opened.
    pub fn session(&mut self) -> Result<&mut dyn Session, TxnError> {
        if !self.state.is_active() {
            self.txn_open()?;
            let next = if self.state.in_unit_of_work() {
                State::Active
            } else {
                State::ActiveNotInUnitOfWork
            };
            self.set_state(next);
        }
        Ok(bound_session(&mut self.session, self.state))
    }

    /// Returns a session for ancillary use without opening a transaction.
    /// Such sessions do not process queued ident drops when released.
    pub fn session_no_txn(&mut self) -> Result<&mut dyn Session, TxnError> {
        let session = self.ensure_session()?;
        session.set_drop_queued_idents_allowed(false);
        Ok(&mut **session)
    }

    /// Closes the current read view without committing anything. Illegal
    /// inside a unit of work.
    pub fn abandon_snapshot(&mut self) {
        assert!(
            !self.state.in_unit_of_work(),
            "cannot abandon a snapshot inside a unit of work (state: {})",
            self.state
        );
        if self.state.is_active() {
            // Not in a unit of work, so rollback loses nothing.
            self.txn_close(false);
        }
        self.set_state(State::Inactive);
    }

    /// Opens the transaction now rather than at first use.
    pub fn preallocate_snapshot(&mut self) -> Result<(), TxnError> {
        self.session()?;
        Ok(())
    }

    /// Drops cached cursors on the bound session before a long idle period.
    pub fn begin_idle(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close_all_cursors();
        }
    }

    /// Panics unless a transaction is open.
    pub fn assert_in_active_txn(&self) {
        assert!(
            self.state.is_active(),
            "recovery unit is not active (state: {})",
            self.state
        );
    }

    /// Identifier of the current read view.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Captures the majority-committed snapshot for the next transaction.
    /// Fails with [`TxnError::ReadConcernMajorityNotAvailableYet`] when no
    /// such snapshot exists; no transaction is opened in that case.
    pub fn obtain_majority_committed_snapshot(&mut self) -> Result<(), TxnError> {
        assert!(
            matches!(self.read_source, ReadSource::MajorityCommitted),
            "majority snapshot requested under read source {:?}",
            self.read_source
        );
        match self.session_cache.snapshot_manager().committed_snapshot() {
            Some(timestamp) => {
                self.majority_committed_snapshot = Some(timestamp);
                Ok(())
            }
            None => Err(TxnError::ReadConcernMajorityNotAvailableYet),
        }
    }

    /// The timestamp the current read view is anchored to, when the read
    /// source pins one.
    pub fn point_in_time_read_timestamp(&self) -> Option<Timestamp> {
        match self.read_source {
            ReadSource::Provided(_)
            | ReadSource::LastAppliedSnapshot
            | ReadSource::AllCommittedSnapshot => {
                let timestamp = self.read_at_timestamp;
                assert!(
                    timestamp.is_some(),
                    "read source {:?} has no read timestamp yet",
                    self.read_source
                );
                timestamp
            }
            ReadSource::LastApplied => self.read_at_timestamp,
            ReadSource::MajorityCommitted => {
                let timestamp = self.majority_committed_snapshot;
                assert!(
                    timestamp.is_some(),
                    "majority-committed read without an obtained snapshot"
                );
                timestamp
            }
            ReadSource::Unset | ReadSource::NoTimestamp => None,
        }
    }

    /// Applies `timestamp` as the commit timestamp of the writes that follow
    /// in this unit of work, opening the transaction if needed. Engine
    /// rejections are returned, not fatal.
    pub fn set_timestamp(&mut self, timestamp: Timestamp) -> Result<(), TxnError> {
        self.ensure_session()?;
        trace!(%timestamp, "setting timestamp of future write operations");
        assert!(
            self.state.in_unit_of_work(),
            "not in a unit of work (state: {})",
            self.state
        );
        assert!(
            self.prepare_timestamp.is_none(),
            "cannot set a write timestamp to {timestamp} with the prepare timestamp set to \
             {:?}",
            self.prepare_timestamp
        );
        assert!(
            self.commit_timestamp.is_none(),
            "cannot set a write timestamp to {timestamp} with the commit timestamp set to \
             {:?}",
            self.commit_timestamp
        );

        self.last_timestamp_set = Some(timestamp);

        // Starts the storage transaction tied to this session.
        self.session()?;

        let config = format!("commit_timestamp={}", timestamp.to_config_hex());
        let session = bound_session(&mut self.session, self.state);
        match session.timestamp_transaction(&config) {
            Ok(()) => {
                self.is_timestamped = true;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fixes the commit timestamp for every commit on this recovery unit
    /// until cleared. Legal outside a unit of work, or inside a prepared one
    /// (where the set-once behavior is exactly what two-phase commit needs).
    pub fn set_commit_timestamp(&mut self, timestamp: Timestamp) {
        assert!(
            !self.state.in_unit_of_work() || self.prepare_timestamp.is_some(),
            "commit timestamp set inside a unit of work that is not prepared (state: {})",
            self.state
        );
        assert!(
            self.commit_timestamp.is_none(),
            "commit timestamp already set to {:?}, trying to set it to {timestamp}",
            self.commit_timestamp
        );
        assert!(
            self.last_timestamp_set.is_none(),
            "cannot set a commit timestamp to {timestamp} with a write timestamp set to {:?}",
            self.last_timestamp_set
        );
        assert!(!self.is_timestamped);

        self.commit_timestamp = Some(timestamp);
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_timestamp
    }

    pub fn clear_commit_timestamp(&mut self) {
        assert!(
            !self.state.in_unit_of_work(),
            "cannot clear the commit timestamp inside a unit of work (state: {})",
            self.state
        );
        assert!(self.commit_timestamp.is_some());
        assert!(
            self.last_timestamp_set.is_none(),
            "cannot clear the commit timestamp with a write timestamp set to {:?}",
            self.last_timestamp_set
        );
        assert!(!self.is_timestamped);

        self.commit_timestamp = None;
    }

    /// Sets the prepare timestamp of the current unit of work. Must precede
    /// any commit timestamp or per-write timestamp.
    pub fn set_prepare_timestamp(&mut self, timestamp: Timestamp) {
        assert!(
            self.state.in_unit_of_work(),
            "not in a unit of work (state: {})",
            self.state
        );
        assert!(
            self.prepare_timestamp.is_none(),
            "prepare timestamp already set to {:?}, trying to set it to {timestamp}",
            self.prepare_timestamp
        );
        assert!(
            self.commit_timestamp.is_none(),
            "cannot set a prepare timestamp to {timestamp} with the commit timestamp set to \
             {:?}",
            self.commit_timestamp
        );
        assert!(
            self.last_timestamp_set.is_none(),
            "cannot set a prepare timestamp to {timestamp} with a write timestamp set to {:?}",
            self.last_timestamp_set
        );

        self.prepare_timestamp = Some(timestamp);
    }

    pub fn prepare_timestamp(&self) -> Timestamp {
        assert!(
            self.state.in_unit_of_work(),
            "not in a unit of work (state: {})",
            self.state
        );
        assert!(self.prepare_timestamp.is_some());
        assert!(
            self.commit_timestamp.is_none(),
            "prepare timestamp read with the commit timestamp set to {:?}",
            self.commit_timestamp
        );
        assert!(
            self.last_timestamp_set.is_none(),
            "prepare timestamp read with a write timestamp set to {:?}",
            self.last_timestamp_set
        );
        match self.prepare_timestamp {
            Some(timestamp) => timestamp,
            None => unreachable!(),
        }
    }

    /// Controls whether future transaction opens read through prepared
    /// writes.
    pub fn set_ignore_prepared(&mut self, ignore: bool) {
        self.ignore_prepared = if ignore {
            IgnorePrepared::Ignore
        } else {
            IgnorePrepared::NoIgnore
        };
    }

    /// Chooses the read source for future transactions. Legal only while no
    /// transaction is open, or when the source kind is unchanged.
    pub fn set_timestamp_read_source(&mut self, source: ReadSource) {
        trace!(?source, "setting timestamp read source");
        assert!(
            !self.state.is_active()
                || mem::discriminant(&self.read_source) == mem::discriminant(&source),
            "cannot change the read source to {source:?} while a transaction is open \
             (state: {}, current source: {:?})",
            self.state,
            self.read_source
        );
        self.read_at_timestamp = match source {
            ReadSource::Provided(timestamp) => Some(timestamp),
            _ => None,
        };
        self.read_source = source;
    }

    pub fn timestamp_read_source(&self) -> ReadSource {
        self.read_source
    }

    /// Marks this reader as an oplog tailer; its next transaction pins the
    /// oplog read timestamp. Cleared when the transaction closes.
    pub fn set_oplog_reader(&mut self) {
        self.is_oplog_reader = true;
    }

    /// Declares whether this unit of work's commits are ordered with respect
    /// to their timestamps. When false, closing a timestamped transaction
    /// triggers a journal flush so earlier commits with later timestamps
    /// become visible in order.
    pub fn set_ordered_commit(&mut self, ordered: bool) {
        self.ordered_commit = ordered;
    }

    /// Flushes the journal. Does not protect writes to unjournaled tables.
    pub fn wait_until_durable(&mut self) -> Result<(), TxnError> {
        assert!(
            !self.state.in_unit_of_work(),
            "cannot wait for durability inside a unit of work (state: {})",
            self.state
        );
        self.session_cache.wait_until_durable(false, false)?;
        Ok(())
    }

    /// Forces a stable checkpoint, making writes to unjournaled tables
    /// durable. A plain journal flush would not protect them.
    pub fn wait_until_unjournaled_writes_durable(&mut self) -> Result<(), TxnError> {
        assert!(
            !self.state.in_unit_of_work(),
            "cannot wait for durability inside a unit of work (state: {})",
            self.state
        );
        self.session_cache.wait_until_durable(true, true)?;
        Ok(())
    }

    /// Exports the bound session's fast statistics as a document. An empty
    /// document when no session is bound; an `error`/`code`/`reason` document
    /// when the export fails.
    pub fn operation_statistics(&mut self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        let Some(session) = self.session.as_mut() else {
            return serde_json::Value::Object(doc);
        };
        match session.statistics("statistics=(fast)") {
            Ok(stats) => {
                for (name, value) in stats {
                    doc.insert(name, serde_json::Value::from(value));
                }
            }
            Err(err) => {
                doc.insert(
                    "error".to_string(),
                    "unable to retrieve storage statistics".into(),
                );
                doc.insert("code".to_string(), err.code().into());
                doc.insert("reason".to_string(), err.to_string().into());
            }
        }
        serde_json::Value::Object(doc)
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
    }

    fn ensure_session(&mut self) -> Result<&mut SessionHandle, TxnError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => SessionCache::get_session(&self.session_cache)?,
        };
        Ok(self.session.insert(session))
    }

    fn commit_impl(&mut self) {
        // A write timestamp and a commit timestamp are mutually exclusive,
        // so the effective commit time is whichever is set.
        let commit_time = self.commit_timestamp.or(self.last_timestamp_set);
        let mut notify = self.prepare_timestamp.is_some();

        if self.session.is_some() && self.state.is_active() {
            self.txn_close(true);
        }
        self.set_state(State::Committing);

        if always_notify_prepare_conflict_waiters() {
            notify = true;
        }
        if notify {
            self.session_cache
                .notify_prepared_unit_of_work_has_committed_or_aborted();
        }

        let changes = mem::take(&mut self.changes);
        run_change_handlers(move || {
            for mut change in changes {
                change.commit(commit_time);
            }
        });

        self.set_state(State::Inactive);
    }

    fn abort_impl(&mut self) {
        let mut notify = self.prepare_timestamp.is_some();

        if self.session.is_some() && self.state.is_active() {
            self.txn_close(false);
        }
        self.set_state(State::Aborting);

        if always_notify_prepare_conflict_waiters() {
            notify = true;
        }
        if notify {
            self.session_cache
                .notify_prepared_unit_of_work_has_committed_or_aborted();
        }

        let mut changes = mem::take(&mut self.changes);
        run_change_handlers(move || {
            for change in changes.iter_mut().rev() {
                debug!("rolling back change");
                change.rollback();
            }
        });

        self.set_state(State::Inactive);
    }

    fn txn_open(&mut self) -> Result<(), TxnError> {
        assert!(
            !self.state.is_active(),
            "transaction already open (state: {})",
            self.state
        );
        assert!(
            !self.state.is_committing_or_aborting(),
            "commit or rollback handler reopened a transaction (state: {})",
            self.state
        );
        self.ensure_session()?;

        // Only meter the transaction's lifetime if the close would log it.
        self.timer = tracing::enabled!(Level::DEBUG).then(Instant::now);

        match self.read_source {
            ReadSource::Unset | ReadSource::NoTimestamp => {
                let oplog_read = self
                    .is_oplog_reader
                    .then(|| self.oplog_manager.oplog_read_timestamp());
                let session = bound_session(&mut self.session, self.state);
                let mut block = BeginTxnBlock::new(session, self.ignore_prepared)
                    .map_err(TxnError::from)?;
                if let Some(read_timestamp) = oplog_read {
                    if let Err(err) =
                        block.set_read_timestamp(read_timestamp, RoundToOldest::Round)
                    {
                        panic!("failed to pin the oplog read timestamp {read_timestamp}: {err}");
                    }
                }
                block.done();
            }
            ReadSource::MajorityCommitted => {
                let snapshot_manager = self.session_cache.snapshot_manager();
                let session = bound_session(&mut self.session, self.state);
                let timestamp = snapshot_manager
                    .begin_transaction_on_committed_snapshot(session, self.ignore_prepared)?;
                // Re-record the timestamp the transaction actually bound to.
                self.majority_committed_snapshot = Some(timestamp);
            }
            ReadSource::LastApplied => {
                let snapshot_manager = self.session_cache.snapshot_manager();
                if snapshot_manager.local_snapshot().is_some() {
                    let session = bound_session(&mut self.session, self.state);
                    let timestamp = snapshot_manager
                        .begin_transaction_on_local_snapshot(session, self.ignore_prepared)?;
                    self.read_at_timestamp = Some(timestamp);
                } else {
                    self.read_at_timestamp = None;
                    let session = bound_session(&mut self.session, self.state);
                    BeginTxnBlock::new(session, self.ignore_prepared)
                        .map_err(TxnError::from)?
                        .done();
                }
            }
            ReadSource::AllCommittedSnapshot => match self.read_at_timestamp {
                None => {
                    let all_committed = self.oplog_manager.all_committed_timestamp();
                    let session = bound_session(&mut self.session, self.state);
                    let timestamp = Self::begin_at_all_committed(
                        session,
                        self.ignore_prepared,
                        all_committed,
                    )?;
                    self.read_at_timestamp = Some(timestamp);
                }
                // Reuse the timestamp chosen the first time, exactly as a
                // provided timestamp would be applied.
                Some(timestamp) => {
                    let session = bound_session(&mut self.session, self.state);
                    Self::begin_at_read_timestamp(session, self.ignore_prepared, timestamp)?;
                }
            },
            ReadSource::LastAppliedSnapshot => match self.read_at_timestamp {
                None => {
                    let snapshot_manager = self.session_cache.snapshot_manager();
                    let session = bound_session(&mut self.session, self.state);
                    let timestamp = snapshot_manager
                        .begin_transaction_on_local_snapshot(session, self.ignore_prepared)?;
                    self.read_at_timestamp = Some(timestamp);
                }
                // Reuse the timestamp chosen the first time.
                Some(timestamp) => {
                    let session = bound_session(&mut self.session, self.state);
                    Self::begin_at_read_timestamp(session, self.ignore_prepared, timestamp)?;
                }
            },
            ReadSource::Provided(timestamp) => {
                let session = bound_session(&mut self.session, self.state);
                Self::begin_at_read_timestamp(session, self.ignore_prepared, timestamp)?;
            }
        }

        trace!(snapshot_id = self.snapshot_id.as_u64(), "begin_transaction");
        Ok(())
    }

    fn begin_at_read_timestamp(
        session: &mut dyn Session,
        ignore_prepared: IgnorePrepared,
        read_timestamp: Timestamp,
    ) -> Result<(), TxnError> {
        let mut block = BeginTxnBlock::new(session, ignore_prepared)?;
        match block.set_read_timestamp(read_timestamp, RoundToOldest::NoRound) {
            Ok(()) => {
                block.done();
                Ok(())
            }
            Err(StorageError::BadValue(_)) => Err(TxnError::SnapshotTooOld {
                requested: read_timestamp,
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn begin_at_all_committed(
        session: &mut dyn Session,
        ignore_prepared: IgnorePrepared,
        all_committed: Timestamp,
    ) -> Result<Timestamp, TxnError> {
        let mut block = BeginTxnBlock::new(session, ignore_prepared)?;
        if let Err(err) = block.set_read_timestamp(all_committed, RoundToOldest::Round) {
            panic!("failed to set the all-committed read timestamp {all_committed}: {err}");
        }
        // The engine may have rounded to oldest between fetching the
        // all-committed value and setting it; ask for the timestamp it
        // actually used.
        let actual = match block.session().query_timestamp("get=read") {
            Ok(timestamp) => timestamp,
            Err(err) => panic!("query_timestamp(get=read) failed: {err}"),
        };
        block.done();
        Ok(actual)
    }

    fn txn_close(&mut self, commit: bool) {
        assert!(
            self.state.is_active(),
            "transaction close in state {}",
            self.state
        );

        if let Some(timer) = self.timer.take() {
            let elapsed_ms = timer.elapsed().as_millis() as u64;
            if elapsed_ms >= slow_transaction_threshold_ms().max(1) {
                debug!(
                    snapshot_id = self.snapshot_id.as_u64(),
                    elapsed_ms, "slow storage transaction"
                );
            }
        }

        let commit_result;
        {
            let commit_timestamp = self.commit_timestamp;
            let snapshot_id = self.snapshot_id;
            let session = bound_session(&mut self.session, self.state);
            if commit {
                if let Some(timestamp) = commit_timestamp {
                    let config =
                        format!("commit_timestamp={}", timestamp.to_config_hex());
                    if let Err(err) = session.timestamp_transaction(&config) {
                        panic!("timestamp_transaction failed while committing: {err}");
                    }
                    self.is_timestamped = true;
                }
                commit_result = session.commit_transaction();
                trace!(snapshot_id = snapshot_id.as_u64(), "commit_transaction");
            } else {
                if let Err(err) = session.rollback_transaction() {
                    panic!("rollback_transaction failed: {err}");
                }
                commit_result = Ok(());
                trace!(snapshot_id = snapshot_id.as_u64(), "rollback_transaction");
            }
        }

        if self.is_timestamped {
            if !self.ordered_commit {
                // Commits can be out of order with respect to their assigned
                // timestamps and might otherwise become visible early; a
                // journal flush restores external ordering.
                self.oplog_manager.trigger_journal_flush();
            }
            self.is_timestamped = false;
        }
        if let Err(err) = commit_result {
            panic!("commit_transaction failed: {err}");
        }

        assert!(
            self.last_timestamp_set.is_none() || self.commit_timestamp.is_none(),
            "cannot have both a write timestamp ({:?}) and a commit timestamp ({:?})",
            self.last_timestamp_set,
            self.commit_timestamp
        );

        // One transaction on this recovery unit may use set_timestamp and the
        // next set_commit_timestamp, so the write timestamp resets here.
        self.last_timestamp_set = None;
        self.prepare_timestamp = None;
        self.is_oplog_reader = false;
        self.ordered_commit = true;
        self.snapshot_id = SnapshotId::allocate();
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        // Skip only the invariant while already unwinding, to avoid a double
        // panic. The transaction must still be rolled back on every exit
        // path: the session goes back to the idle pool right after this.
        if !std::thread::panicking() {
            assert!(
                !self.state.in_unit_of_work(),
                "recovery unit dropped inside a unit of work (state: {})",
                self.state
            );
        }
        self.abort_impl();
    }
}

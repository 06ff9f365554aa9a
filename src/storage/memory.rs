// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! In-memory reference engine.
//!
//! A snapshot-isolated, timestamp-aware engine backing tests and benchmarks.
//! It speaks the same textual configuration format as a production engine:
//! `ignore_prepare=true` at begin, `read_timestamp`/`round_to_oldest`/
//! `commit_timestamp` via [`Session::timestamp_transaction`],
//! `prepare_timestamp` at prepare, and `get=read` for timestamp queries.
//!
//! Semantics:
//! - each transaction reads from a snapshot of the data taken at begin;
//! - committed versions carry an optional commit timestamp; untimestamped
//!   commits are visible to every reader;
//! - a read timestamp restricts visibility to versions committed at or
//!   before it, and is rejected with `BadValue` when older than the oldest
//!   timestamp unless `round_to_oldest=true`;
//! - reading a key prepared by another transaction reports a prepare
//!   conflict unless the transaction was opened with `ignore_prepare=true`;
//! - write-write conflicts are detected at write time, first committer wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::time::Timestamp;

use super::error::StorageError;
use super::session::{KvEngine, Session};

#[derive(Debug, Clone)]
struct Version {
    commit_timestamp: Option<Timestamp>,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct Store {
    data: BTreeMap<Vec<u8>, Vec<Version>>,
    prepared_keys: HashMap<Vec<u8>, u64>,
    oldest_timestamp: Timestamp,
    next_txn_token: u64,
    journal_flushes: u64,
    checkpoints: u64,
}

/// The in-memory engine. Cheap to clone sessions off; all shared state sits
/// behind one mutex.
pub struct MemoryEngine {
    store: Arc<Mutex<Store>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Advances the oldest timestamp; reads older than this are rejected or
    /// rounded per `round_to_oldest`.
    pub fn set_oldest_timestamp(&self, timestamp: Timestamp) {
        self.store.lock().oldest_timestamp = timestamp;
    }

    /// Number of journal flushes performed by durability barriers.
    pub fn journal_flushes(&self) -> u64 {
        self.store.lock().journal_flushes
    }

    /// Number of checkpoints performed by durability barriers.
    pub fn checkpoints(&self) -> u64 {
        self.store.lock().checkpoints
    }

    /// Latest committed value for a key, ignoring timestamps. Test aid.
    pub fn read_committed(&self, key: &[u8]) -> Option<Vec<u8>> {
        let store = self.store.lock();
        store
            .data
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|version| version.value.clone())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemoryEngine {
    fn open_session(&self) -> Result<Box<dyn Session>, StorageError> {
        Ok(Box::new(MemorySession {
            store: Arc::clone(&self.store),
            txn: None,
            drop_queued_idents_allowed: true,
            cached_cursors: 0,
            reads: 0,
            writes: 0,
        }))
    }

    fn wait_until_durable(
        &self,
        force_checkpoint: bool,
        _stable_checkpoint: bool,
    ) -> Result<(), StorageError> {
        let mut store = self.store.lock();
        store.journal_flushes += 1;
        if force_checkpoint {
            store.checkpoints += 1;
        }
        Ok(())
    }
}

struct Txn {
    token: u64,
    snapshot: BTreeMap<Vec<u8>, Vec<Version>>,
    read_timestamp: Option<Timestamp>,
    ignore_prepare: bool,
    writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    commit_timestamp: Option<Timestamp>,
    prepare_timestamp: Option<Timestamp>,
}

/// A session on the in-memory engine.
pub struct MemorySession {
    store: Arc<Mutex<Store>>,
    txn: Option<Txn>,
    drop_queued_idents_allowed: bool,
    cached_cursors: i64,
    reads: i64,
    writes: i64,
}

impl MemorySession {
    fn txn_mut(&mut self) -> Result<&mut Txn, StorageError> {
        self.txn.as_mut().ok_or(StorageError::NoTransaction)
    }

    fn write_internal(
        &mut self,
        key: &[u8],
        value: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        self.writes += 1;
        self.cached_cursors += 1;
        let store = self.store.lock();
        let txn = self.txn.as_mut().ok_or(StorageError::NoTransaction)?;
        if txn.prepare_timestamp.is_some() {
            return Err(StorageError::BadValue(
                "transaction is prepared and cannot accept further writes".into(),
            ));
        }

        // First committer wins: a version committed since our snapshot, or a
        // prepare by another transaction, conflicts with this write.
        let committed_now = store.data.get(key).map(Vec::len).unwrap_or(0);
        let committed_at_snapshot = txn.snapshot.get(key).map(Vec::len).unwrap_or(0);
        if committed_now != committed_at_snapshot {
            return Err(StorageError::WriteConflict { key: key.to_vec() });
        }
        if let Some(owner) = store.prepared_keys.get(key) {
            if *owner != txn.token {
                return Err(StorageError::WriteConflict { key: key.to_vec() });
            }
        }
        drop(store);

        txn.writes.push((key.to_vec(), value));
        Ok(())
    }
}

fn config_pairs(config: &str) -> impl Iterator<Item = (&str, &str)> {
    config
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (key, value),
            None => (part, ""),
        })
}

fn parse_timestamp(key: &str, value: &str) -> Result<Timestamp, StorageError> {
    Timestamp::from_config_hex(value)
        .ok_or_else(|| StorageError::InvalidConfig(format!("{key}={value}")))
}

impl Session for MemorySession {
    fn begin_transaction(&mut self, config: &str) -> Result<(), StorageError> {
        if self.txn.is_some() {
            return Err(StorageError::TransactionActive);
        }
        let mut ignore_prepare = false;
        for (key, value) in config_pairs(config) {
            match key {
                "ignore_prepare" => ignore_prepare = value == "true",
                _ => return Err(StorageError::InvalidConfig(format!("{key}={value}"))),
            }
        }

        let mut store = self.store.lock();
        store.next_txn_token += 1;
        let token = store.next_txn_token;
        self.txn = Some(Txn {
            token,
            snapshot: store.data.clone(),
            read_timestamp: None,
            ignore_prepare,
            writes: Vec::new(),
            commit_timestamp: None,
            prepare_timestamp: None,
        });
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), StorageError> {
        let txn = self.txn.take().ok_or(StorageError::NoTransaction)?;
        let mut store = self.store.lock();
        store.prepared_keys.retain(|_, owner| *owner != txn.token);
        for (key, value) in txn.writes {
            store.data.entry(key).or_default().push(Version {
                commit_timestamp: txn.commit_timestamp,
                value,
            });
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), StorageError> {
        let txn = self.txn.take().ok_or(StorageError::NoTransaction)?;
        let mut store = self.store.lock();
        store.prepared_keys.retain(|_, owner| *owner != txn.token);
        Ok(())
    }

    fn prepare_transaction(&mut self, config: &str) -> Result<(), StorageError> {
        let mut prepare_timestamp = None;
        for (key, value) in config_pairs(config) {
            match key {
                "prepare_timestamp" => prepare_timestamp = Some(parse_timestamp(key, value)?),
                _ => return Err(StorageError::InvalidConfig(format!("{key}={value}"))),
            }
        }
        let prepare_timestamp = prepare_timestamp.ok_or_else(|| {
            StorageError::InvalidConfig("prepare_transaction requires prepare_timestamp".into())
        })?;

        let mut store = self.store.lock();
        let txn = self.txn.as_mut().ok_or(StorageError::NoTransaction)?;
        txn.prepare_timestamp = Some(prepare_timestamp);
        for (key, _) in &txn.writes {
            store.prepared_keys.insert(key.clone(), txn.token);
        }
        Ok(())
    }

    fn timestamp_transaction(&mut self, config: &str) -> Result<(), StorageError> {
        let store = self.store.lock();
        let txn = self.txn.as_mut().ok_or(StorageError::NoTransaction)?;

        let mut read_timestamp = None;
        let mut commit_timestamp = None;
        let mut round_to_oldest = false;
        for (key, value) in config_pairs(config) {
            match key {
                "read_timestamp" => read_timestamp = Some(parse_timestamp(key, value)?),
                "commit_timestamp" => commit_timestamp = Some(parse_timestamp(key, value)?),
                "round_to_oldest" => round_to_oldest = value == "true",
                _ => return Err(StorageError::InvalidConfig(format!("{key}={value}"))),
            }
        }

        if let Some(mut read_ts) = read_timestamp {
            if read_ts < store.oldest_timestamp {
                if round_to_oldest {
                    read_ts = store.oldest_timestamp;
                } else {
                    return Err(StorageError::BadValue(format!(
                        "read timestamp {read_ts} is older than the oldest timestamp {}",
                        store.oldest_timestamp
                    )));
                }
            }
            txn.read_timestamp = Some(read_ts);
        }

        if let Some(commit_ts) = commit_timestamp {
            if let Some(prepare_ts) = txn.prepare_timestamp {
                if commit_ts < prepare_ts {
                    return Err(StorageError::BadValue(format!(
                        "commit timestamp {commit_ts} is older than the prepare timestamp \
                         {prepare_ts}"
                    )));
                }
            } else if commit_ts < store.oldest_timestamp {
                return Err(StorageError::BadValue(format!(
                    "commit timestamp {commit_ts} is older than the oldest timestamp {}",
                    store.oldest_timestamp
                )));
            }
            txn.commit_timestamp = Some(commit_ts);
        }

        Ok(())
    }

    fn query_timestamp(&mut self, config: &str) -> Result<Timestamp, StorageError> {
        if config != "get=read" {
            return Err(StorageError::InvalidConfig(config.into()));
        }
        let txn = self.txn_mut()?;
        txn.read_timestamp
            .ok_or_else(|| StorageError::BadValue("transaction has no read timestamp".into()))
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.reads += 1;
        self.cached_cursors += 1;
        let store = self.store.lock();
        let txn = self.txn.as_ref().ok_or(StorageError::NoTransaction)?;

        // Read-your-writes: the last buffered write to this key wins.
        if let Some((_, value)) = txn.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(value.clone());
        }

        if let Some(owner) = store.prepared_keys.get(key) {
            if *owner != txn.token && !txn.ignore_prepare {
                return Err(StorageError::PrepareConflict);
            }
        }

        let visible = txn.snapshot.get(key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|version| match (version.commit_timestamp, txn.read_timestamp) {
                    (Some(commit_ts), Some(read_ts)) => commit_ts <= read_ts,
                    _ => true,
                })
        });
        Ok(visible.and_then(|version| version.value.clone()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.write_internal(key, Some(value.to_vec()))
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.write_internal(key, None)
    }

    fn close_all_cursors(&mut self) {
        self.cached_cursors = 0;
    }

    fn set_drop_queued_idents_allowed(&mut self, allowed: bool) {
        self.drop_queued_idents_allowed = allowed;
    }

    fn statistics(&mut self, config: &str) -> Result<Vec<(String, i64)>, StorageError> {
        if config != "statistics=(fast)" {
            return Err(StorageError::InvalidConfig(config.into()));
        }
        Ok(vec![
            ("cursors_cached".into(), self.cached_cursors),
            ("reads".into(), self.reads),
            ("writes".into(), self.writes),
            (
                "drop_queued_idents_allowed".into(),
                i64::from(self.drop_queued_idents_allowed),
            ),
        ])
    }
}

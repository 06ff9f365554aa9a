// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Session pool and prepare-conflict waiter notification.
//!
//! The cache hands out exclusively-owned [`SessionHandle`]s and takes the
//! sessions back when the handles drop. It also owns the process-wide
//! rendezvous for prepare conflicts: a thread that ran into a prepared
//! transaction parks here until some prepared unit of work commits or aborts.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::error::StorageError;
use super::session::{KvEngine, Session};
use super::snapshot::SnapshotManager;

/// Pool of engine sessions plus the prepare-conflict waiter protocol.
pub struct SessionCache {
    engine: Arc<dyn KvEngine>,
    snapshot_manager: SnapshotManager,
    idle_sessions: Mutex<Vec<Box<dyn Session>>>,
    prepare_epoch: Mutex<u64>,
    prepare_cond: Condvar,
}

impl SessionCache {
    pub fn new(engine: Arc<dyn KvEngine>) -> Self {
        Self {
            engine,
            snapshot_manager: SnapshotManager::new(),
            idle_sessions: Mutex::new(Vec::new()),
            prepare_epoch: Mutex::new(0),
            prepare_cond: Condvar::new(),
        }
    }

    /// Takes an idle session from the pool, or opens a new one. The handle
    /// keeps the cache alive and returns the session on drop.
    pub fn get_session(cache: &Arc<SessionCache>) -> Result<SessionHandle, StorageError> {
        let pooled = cache.idle_sessions.lock().pop();
        let session = match pooled {
            Some(session) => session,
            None => cache.engine.open_session()?,
        };
        Ok(SessionHandle {
            cache: Arc::clone(cache),
            session: Some(session),
        })
    }

    fn release_session(&self, mut session: Box<dyn Session>) {
        // Ancillary sessions may have turned this off; pooled sessions start
        // from the default again.
        session.set_drop_queued_idents_allowed(true);
        self.idle_sessions.lock().push(session);
    }

    /// Number of sessions currently idle in the pool.
    pub fn idle_session_count(&self) -> usize {
        self.idle_sessions.lock().len()
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshot_manager
    }

    /// Blocks until outstanding writes are durable. See
    /// [`KvEngine::wait_until_durable`] for the checkpoint flags.
    pub fn wait_until_durable(
        &self,
        force_checkpoint: bool,
        stable_checkpoint: bool,
    ) -> Result<(), StorageError> {
        self.engine
            .wait_until_durable(force_checkpoint, stable_checkpoint)
    }

    /// Wakes every thread parked on a prepare conflict.
    pub fn notify_prepared_unit_of_work_has_committed_or_aborted(&self) {
        let mut epoch = self.prepare_epoch.lock();
        *epoch += 1;
        self.prepare_cond.notify_all();
    }

    /// Current notification epoch. Record this before retrying an operation
    /// that hit a prepare conflict, then pass it to
    /// [`SessionCache::wait_until_prepared_unit_of_work_commits_or_aborts`]
    /// so a completion between retry and wait is not missed.
    pub fn prepared_transaction_epoch(&self) -> u64 {
        *self.prepare_epoch.lock()
    }

    /// Parks the calling thread until the notification epoch advances past
    /// `seen_epoch`.
    pub fn wait_until_prepared_unit_of_work_commits_or_aborts(&self, seen_epoch: u64) {
        let mut epoch = self.prepare_epoch.lock();
        while *epoch <= seen_epoch {
            self.prepare_cond.wait(&mut epoch);
        }
    }
}

/// Exclusive ownership of a pooled session; returns it to the cache on drop.
pub struct SessionHandle {
    cache: Arc<SessionCache>,
    session: Option<Box<dyn Session>>,
}

impl Deref for SessionHandle {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("session handle used after release"),
        }
    }
}

impl DerefMut for SessionHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("session handle used after release"),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.cache.release_session(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEngine;
    use std::thread;
    use std::time::Duration;

    fn cache() -> (Arc<SessionCache>, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let cache = Arc::new(SessionCache::new(engine.clone() as Arc<dyn KvEngine>));
        (cache, engine)
    }

    #[test]
    fn test_sessions_are_pooled() {
        let (cache, _engine) = cache();
        assert_eq!(cache.idle_session_count(), 0);

        let session = SessionCache::get_session(&cache).unwrap();
        drop(session);
        assert_eq!(cache.idle_session_count(), 1);

        let _session = SessionCache::get_session(&cache).unwrap();
        assert_eq!(cache.idle_session_count(), 0);
    }

    #[test]
    fn test_released_sessions_process_queued_drops_again() {
        let (cache, _engine) = cache();
        {
            let mut session = SessionCache::get_session(&cache).unwrap();
            session.set_drop_queued_idents_allowed(false);
        }
        let mut session = SessionCache::get_session(&cache).unwrap();
        let stats = session.statistics("statistics=(fast)").unwrap();
        assert!(stats.contains(&("drop_queued_idents_allowed".to_string(), 1)));
    }

    #[test]
    fn test_wait_until_durable_flags_reach_engine() {
        let (cache, engine) = cache();
        cache.wait_until_durable(false, false).unwrap();
        assert_eq!(engine.journal_flushes(), 1);
        assert_eq!(engine.checkpoints(), 0);

        cache.wait_until_durable(true, true).unwrap();
        assert_eq!(engine.journal_flushes(), 2);
        assert_eq!(engine.checkpoints(), 1);
    }

    #[test]
    fn test_notify_wakes_prepare_conflict_waiters() {
        let (cache, _engine) = cache();
        let seen = cache.prepared_transaction_epoch();

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache.wait_until_prepared_unit_of_work_commits_or_aborts(seen);
            })
        };

        // Give the waiter time to park.
        thread::sleep(Duration::from_millis(20));
        cache.notify_prepared_unit_of_work_has_committed_or_aborted();
        waiter.join().unwrap();
        assert_eq!(cache.prepared_transaction_epoch(), seen + 1);
    }

    #[test]
    fn test_wait_returns_immediately_when_epoch_already_advanced() {
        let (cache, _engine) = cache();
        let seen = cache.prepared_transaction_epoch();
        cache.notify_prepared_unit_of_work_has_committed_or_aborted();
        // Must not block.
        cache.wait_until_prepared_unit_of_work_commits_or_aborts(seen);
    }
}

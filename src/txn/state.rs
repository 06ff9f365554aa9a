// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Recovery-unit lifecycle states.

use std::fmt;

/// Lifecycle state of a recovery unit.
///
/// A unit of work and an open storage transaction vary independently, giving
/// four live combinations, plus the two transient states in which commit or
/// rollback handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No unit of work, no open transaction.
    Inactive,
    /// Unit of work begun, transaction not yet opened.
    InactiveInUnitOfWork,
    /// Transaction open for a plain read, no unit of work.
    ActiveNotInUnitOfWork,
    /// Unit of work with its transaction open.
    Active,
    /// Commit handlers are running.
    Committing,
    /// Rollback handlers are running.
    Aborting,
}

impl State {
    /// True while a storage transaction is open.
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, State::ActiveNotInUnitOfWork | State::Active)
    }

    /// True while inside a unit of work.
    #[inline]
    pub fn in_unit_of_work(self) -> bool {
        matches!(self, State::InactiveInUnitOfWork | State::Active)
    }

    /// True while commit or rollback handlers are running.
    #[inline]
    pub fn is_committing_or_aborting(self) -> bool {
        matches!(self, State::Committing | State::Aborting)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Inactive => "Inactive",
            State::InactiveInUnitOfWork => "InactiveInUnitOfWork",
            State::ActiveNotInUnitOfWork => "ActiveNotInUnitOfWork",
            State::Active => "Active",
            State::Committing => "Committing",
            State::Aborting => "Aborting",
        };
        f.write_str(name)
    }
}

//! Per-row write state machine.
//!
//! ```text
//!            edit                 push (etag matches)
//!   Rest ──────────▶ Updating ─────────────────────────▶ Rest
//!    │                  │ push (stale)
//!    │ delete           ▼
//!    ▼              Conflicting ──resolved──▶ Rest | Tombstoned
//!   Deleting ──push (etag matches)──▶ Tombstoned ──edit──▶ Updating
//!    │ push (stale)
//!    └──────────────▶ Conflicting
//! ```
//!
//! Transitions are pure; the table store derives the row's state from what
//! it holds, asks for the next state, and acts on the answer.
use std::fmt;

use snafu::Snafu;

use crate::row::Row;

/// Where a row stands in the write cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowSyncState {
    /// Stored and live; no write in flight.
    Rest,
    /// An update is being applied.
    Updating,
    /// A delete is being applied.
    Deleting,
    /// A losing write is held as a conflict pair.
    Conflicting,
    /// Stored as a tombstone.
    Tombstoned,
}

/// Inputs to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowSyncEvent {
    /// A client submits new content.
    Edit,
    /// A client asks for deletion.
    Delete,
    /// The supplied rowETag matched; the write commits.
    PushAccepted,
    /// The supplied rowETag was stale.
    PushStale,
    /// A conflict pair was resolved; `tombstone` tells which side won.
    Resolved {
        /// The winning side is a deletion.
        tombstone: bool,
    },
}

/// A transition the machine does not define.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("No transition from {from:?} on {event:?}"))]
pub struct InvalidTransition {
    /// State before the event.
    pub from: RowSyncState,
    /// Event that has no transition.
    pub event: RowSyncEvent,
}

impl RowSyncState {
    /// State of a stored row (or of a row id with nothing stored).
    pub fn of(row: Option<&Row>, in_conflict: bool) -> Self {
        match (row, in_conflict) {
            (_, true) => RowSyncState::Conflicting,
            (Some(row), false) if row.deleted => RowSyncState::Tombstoned,
            _ => RowSyncState::Rest,
        }
    }

    /// Next state after `event`.
    pub fn on(self, event: RowSyncEvent) -> Result<Self, InvalidTransition> {
        use RowSyncEvent as E;
        use RowSyncState as S;

        let next = match (self, event) {
            (S::Rest | S::Tombstoned, E::Edit) => S::Updating,
            (S::Rest, E::Delete) => S::Deleting,
            (S::Updating, E::PushAccepted) => S::Rest,
            (S::Deleting, E::PushAccepted) => S::Tombstoned,
            (S::Updating | S::Deleting, E::PushStale) => S::Conflicting,
            (S::Conflicting, E::Resolved { tombstone: false }) => S::Rest,
            (S::Conflicting, E::Resolved { tombstone: true }) => S::Tombstoned,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for RowSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

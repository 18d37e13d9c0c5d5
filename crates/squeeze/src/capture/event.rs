//! Captured change events
//!
//! One event per committed row-level write on the source table, in commit
//! order. The `lsn` tag is the position of the change in the change log; every
//! buffered event belongs to a transaction the capture slot has already seen
//! commit.

use crate::host::{DecodedChange, Lsn, Row};
use serde::{Deserialize, Serialize};

/// Operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Row images carried by an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Row inserted
    Insert { new: Row },
    /// Row updated; `old_key` is absent when the identity key did not change
    Update { old_key: Option<Row>, new: Row },
    /// Row deleted
    Delete { old_key: Row },
}

/// A captured change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub lsn: Lsn,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    /// Create a new INSERT event
    pub fn insert(lsn: Lsn, new: Row) -> Self {
        Self {
            lsn,
            kind: ChangeKind::Insert { new },
        }
    }

    /// Create a new UPDATE event
    pub fn update(lsn: Lsn, old_key: Option<Row>, new: Row) -> Self {
        Self {
            lsn,
            kind: ChangeKind::Update { old_key, new },
        }
    }

    /// Create a new DELETE event
    pub fn delete(lsn: Lsn, old_key: Row) -> Self {
        Self {
            lsn,
            kind: ChangeKind::Delete { old_key },
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self.kind {
            ChangeKind::Insert { .. } => ChangeOp::Insert,
            ChangeKind::Update { .. } => ChangeOp::Update,
            ChangeKind::Delete { .. } => ChangeOp::Delete,
        }
    }

    /// Approximate in-memory footprint, for buffer accounting.
    pub fn size(&self) -> usize {
        let rows = match &self.kind {
            ChangeKind::Insert { new } => new.size(),
            ChangeKind::Update { old_key, new } => {
                old_key.as_ref().map_or(0, Row::size) + new.size()
            }
            ChangeKind::Delete { old_key } => old_key.size(),
        };
        std::mem::size_of::<Self>() + rows
    }
}

impl From<DecodedChange> for ChangeEvent {
    fn from(change: DecodedChange) -> Self {
        match change {
            DecodedChange::Insert { lsn, new } => Self::insert(lsn, new),
            DecodedChange::Update { lsn, old_key, new } => Self::update(lsn, old_key, new),
            DecodedChange::Delete { lsn, old_key } => Self::delete(lsn, old_key),
        }
    }
}

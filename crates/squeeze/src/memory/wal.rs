//! Change log, transaction status and capture slots.
//!
//! Records are numbered from 1; a record's LSN is its position. A slot
//! replays the log from its restart point, collects each transaction's
//! changes and hands them out once the commit record is reached, provided
//! the commit is at or after the slot's consistent point.

use super::heap::{Xid, FIRST_NORMAL_XID, FROZEN_XID};
use crate::host::{DecodedChange, Lsn, Oid, Row};
use std::collections::{HashMap, VecDeque};

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XactStatus {
    InProgress { first_lsn: Option<Lsn> },
    Committed(Lsn),
    Aborted,
}

/// A logged row change.
#[derive(Debug, Clone)]
pub(crate) enum LoggedChange {
    Insert { new: Row },
    Update { old_key: Option<Row>, new: Row },
    Delete { old_key: Row },
}

#[derive(Debug, Clone)]
pub(crate) enum WalRecord {
    Change {
        xid: Xid,
        relid: Oid,
        change: LoggedChange,
    },
    Commit {
        xid: Xid,
    },
    Abort {
        xid: Xid,
    },
}

/// An ephemeral slot and its decoding state.
#[derive(Debug)]
pub(crate) struct Slot {
    pub name: String,
    pub owner: u64,
    pub consistent_point: Lsn,
    /// Index of the next record to decode
    cursor: usize,
    pending: HashMap<Xid, Vec<(Lsn, Oid, LoggedChange)>>,
    ready: VecDeque<DecodedChange>,
}

/// Transaction table plus the change log.
#[derive(Debug)]
pub(crate) struct ChangeLogState {
    next_xid: Xid,
    xacts: HashMap<Xid, XactStatus>,
    records: Vec<WalRecord>,
    flushed: Lsn,
    pub slots: Vec<Slot>,
}

impl Default for ChangeLogState {
    fn default() -> Self {
        Self {
            next_xid: FIRST_NORMAL_XID,
            xacts: HashMap::new(),
            records: Vec::new(),
            flushed: Lsn::ZERO,
            slots: Vec::new(),
        }
    }
}

impl ChangeLogState {
    /// LSN the next record will get.
    pub fn insert_position(&self) -> Lsn {
        Lsn(self.records.len() as u64 + 1)
    }

    pub fn begin(&mut self) -> Xid {
        let xid = self.next_xid;
        self.next_xid += 1;
        self.xacts
            .insert(xid, XactStatus::InProgress { first_lsn: None });
        xid
    }

    pub fn status(&self, xid: Xid) -> XactStatus {
        if xid == FROZEN_XID {
            return XactStatus::Committed(Lsn::ZERO);
        }
        self.xacts.get(&xid).copied().unwrap_or(XactStatus::Aborted)
    }

    pub fn is_committed(&self, xid: Xid) -> bool {
        matches!(self.status(xid), XactStatus::Committed(_))
    }

    pub fn is_aborted(&self, xid: Xid) -> bool {
        matches!(self.status(xid), XactStatus::Aborted)
    }

    /// Committed before `horizon`.
    pub fn committed_before(&self, xid: Xid, horizon: Lsn) -> bool {
        matches!(self.status(xid), XactStatus::Committed(lsn) if lsn < horizon)
    }

    fn append(&mut self, record: WalRecord) -> Lsn {
        let lsn = self.insert_position();
        self.records.push(record);
        lsn
    }

    pub fn log_change(&mut self, xid: Xid, relid: Oid, change: LoggedChange) -> Lsn {
        let lsn = self.append(WalRecord::Change { xid, relid, change });
        if let Some(XactStatus::InProgress { first_lsn }) = self.xacts.get_mut(&xid) {
            first_lsn.get_or_insert(lsn);
        }
        lsn
    }

    pub fn commit(&mut self, xid: Xid) -> Lsn {
        let lsn = self.append(WalRecord::Commit { xid });
        self.xacts.insert(xid, XactStatus::Committed(lsn));
        lsn
    }

    pub fn abort(&mut self, xid: Xid) {
        self.append(WalRecord::Abort { xid });
        self.xacts.insert(xid, XactStatus::Aborted);
    }

    pub fn flush(&mut self) -> Lsn {
        self.flushed = self.insert_position();
        self.flushed
    }

    pub fn flush_position(&self) -> Lsn {
        self.flushed
    }

    /// Oldest running transaction, or the next one to start.
    pub fn oldest_running(&self) -> Xid {
        self.xacts
            .iter()
            .filter(|(_, s)| matches!(s, XactStatus::InProgress { .. }))
            .map(|(xid, _)| *xid)
            .min()
            .unwrap_or(self.next_xid)
    }

    /// Create a slot consistent at the current insert position.
    ///
    /// Decoding restarts at the first record of the oldest running
    /// transaction so that its changes are complete when it commits.
    pub fn create_slot(&mut self, name: &str, owner: u64) -> &Slot {
        let consistent_point = self.insert_position();
        let restart = self
            .xacts
            .values()
            .filter_map(|s| match s {
                XactStatus::InProgress { first_lsn } => *first_lsn,
                _ => None,
            })
            .min()
            .unwrap_or(consistent_point);
        self.slots.push(Slot {
            name: name.to_string(),
            owner,
            consistent_point,
            cursor: (restart.0 - 1) as usize,
            pending: HashMap::new(),
            ready: VecDeque::new(),
        });
        &self.slots[self.slots.len() - 1]
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn drop_slot(&mut self, name: &str) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.name != name);
        self.slots.len() != before
    }

    /// Oldest consistent point of any slot; row versions deleted after it
    /// must survive vacuum.
    pub fn oldest_slot_horizon(&self) -> Option<Lsn> {
        self.slots.iter().map(|s| s.consistent_point).min()
    }

    /// Next change of `relid` committed before `end`.
    pub fn decode_next(&mut self, slot: &str, relid: Oid, end: Lsn) -> Option<DecodedChange> {
        let index = self.slots.iter().position(|s| s.name == slot)?;
        loop {
            if let Some(change) = self.slots[index].ready.pop_front() {
                return Some(change);
            }

            let cursor = self.slots[index].cursor;
            let lsn = Lsn(cursor as u64 + 1);
            if lsn >= end || cursor >= self.records.len() {
                return None;
            }
            let record = self.records[cursor].clone();
            let slot = &mut self.slots[index];
            slot.cursor += 1;

            match record {
                WalRecord::Change { xid, relid: r, change } => {
                    slot.pending.entry(xid).or_default().push((lsn, r, change));
                }
                WalRecord::Commit { xid } => {
                    let changes = slot.pending.remove(&xid).unwrap_or_default();
                    if lsn >= slot.consistent_point {
                        slot.ready.extend(
                            changes
                                .into_iter()
                                .filter(|(_, r, _)| *r == relid)
                                .map(|(lsn, _, change)| decoded(lsn, change)),
                        );
                    }
                }
                WalRecord::Abort { xid } => {
                    slot.pending.remove(&xid);
                }
            }
        }
    }
}

fn decoded(lsn: Lsn, change: LoggedChange) -> DecodedChange {
    match change {
        LoggedChange::Insert { new } => DecodedChange::Insert { lsn, new },
        LoggedChange::Update { old_key, new } => DecodedChange::Update { lsn, old_key, new },
        LoggedChange::Delete { old_key } => DecodedChange::Delete { lsn, old_key },
    }
}

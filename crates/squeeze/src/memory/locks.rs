//! Relation lock table.
//!
//! Holders are sessions and client transactions, each with its own
//! identifier. A holder never conflicts with itself.

use crate::host::{LockMode, Oid};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    granted: HashMap<Oid, Vec<(u64, LockMode)>>,
    exclusive_since: HashMap<(Oid, u64), Instant>,
    exclusive_holds: HashMap<Oid, Vec<Duration>>,
}

impl LockTable {
    /// Grant the lock unless another holder has a conflicting one.
    pub fn try_acquire(&mut self, holder: u64, relid: Oid, mode: LockMode) -> bool {
        if mode == LockMode::NoLock {
            return true;
        }
        let granted = self.granted.entry(relid).or_default();
        let blocked = granted
            .iter()
            .any(|(h, m)| *h != holder && mode.conflicts_with(*m));
        if blocked {
            return false;
        }
        granted.push((holder, mode));
        if mode == LockMode::AccessExclusive {
            self.exclusive_since
                .entry((relid, holder))
                .or_insert_with(Instant::now);
        }
        true
    }

    /// Release one grant. Returns whether the holder had it.
    pub fn release(&mut self, holder: u64, relid: Oid, mode: LockMode) -> bool {
        if mode == LockMode::NoLock {
            return true;
        }
        let Some(granted) = self.granted.get_mut(&relid) else {
            return false;
        };
        let Some(pos) = granted.iter().rposition(|g| *g == (holder, mode)) else {
            return false;
        };
        granted.remove(pos);
        let still_exclusive = granted
            .iter()
            .any(|g| *g == (holder, LockMode::AccessExclusive));
        if granted.is_empty() {
            self.granted.remove(&relid);
        }
        if mode == LockMode::AccessExclusive && !still_exclusive {
            if let Some(since) = self.exclusive_since.remove(&(relid, holder)) {
                self.exclusive_holds
                    .entry(relid)
                    .or_default()
                    .push(since.elapsed());
            }
        }
        true
    }

    /// Release everything a holder has. Returns whether anything was held.
    pub fn release_all(&mut self, holder: u64) -> bool {
        let held: Vec<(Oid, LockMode)> = self
            .granted
            .iter()
            .flat_map(|(relid, grants)| {
                grants
                    .iter()
                    .filter(|(h, _)| *h == holder)
                    .map(move |(_, mode)| (*relid, *mode))
            })
            .collect();
        for (relid, mode) in &held {
            self.release(holder, *relid, *mode);
        }
        !held.is_empty()
    }

    /// Durations of completed strongest-mode holds on a relation.
    pub fn exclusive_holds(&self, relid: Oid) -> Vec<Duration> {
        self.exclusive_holds.get(&relid).cloned().unwrap_or_default()
    }
}

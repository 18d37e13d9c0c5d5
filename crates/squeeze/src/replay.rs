//! Replay of captured changes against the transient table.
//!
//! Updates are a delete of the row found by identity key followed by an
//! insert of the new image; the transient heap is only ever appended to.
//! Index maintenance is left to the host's single-row insert, so every index
//! built after the initial load stays current.

use crate::capture::{ChangeBuffer, ChangeEvent, ChangeKind};
use crate::error::{Result, SqueezeError};
use crate::host::{Oid, Row, TableStore, TupleId};
use crate::identity::RowIdentityKey;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Where replayed changes go.
#[derive(Debug, Clone)]
pub struct ReplayTarget {
    pub table: Oid,
    /// Transient counterpart of the source's identity index
    pub identity_index: Oid,
    pub key: RowIdentityKey,
}

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub applied: u64,
    /// False when the deadline stopped the pass with events still buffered
    pub completed: bool,
}

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl ReplayStats {
    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Applies captured events in arrival order.
#[derive(Debug)]
pub struct ChangeReplayEngine {
    target: ReplayTarget,
    stats: ReplayStats,
}

impl ChangeReplayEngine {
    pub fn new(target: ReplayTarget) -> Self {
        Self {
            target,
            stats: ReplayStats::default(),
        }
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Apply buffered events until the buffer is empty or the deadline passes.
    ///
    /// The deadline is checked before each event; events not yet applied stay
    /// in the buffer.
    pub async fn apply<H: TableStore + ?Sized>(
        &mut self,
        host: &H,
        buffer: &mut ChangeBuffer,
        deadline: Option<Instant>,
    ) -> Result<ReplayOutcome> {
        let mut applied = 0u64;
        let mut stream = buffer.drain();
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("Replay stopped by deadline after {} changes", applied);
                return Ok(ReplayOutcome {
                    applied,
                    completed: false,
                });
            }
            let Some(event) = stream.next() else {
                break;
            };
            self.apply_event(host, event?).await?;
            applied += 1;
        }
        if applied > 0 {
            debug!("Replayed {} changes into {}", applied, self.target.table);
        }
        Ok(ReplayOutcome {
            applied,
            completed: true,
        })
    }

    /// Apply one event.
    pub async fn apply_event<H: TableStore + ?Sized>(
        &mut self,
        host: &H,
        event: ChangeEvent,
    ) -> Result<()> {
        trace!("Replaying {:?} at {}", event.op(), event.lsn);
        match event.kind {
            ChangeKind::Insert { new } => {
                host.insert_row(self.target.table, new).await?;
                self.stats.inserts += 1;
            }
            ChangeKind::Update { old_key, new } => {
                let key_source = old_key.as_ref().unwrap_or(&new);
                let tid = self.find_row(host, key_source, "update").await?;
                host.delete_row(self.target.table, tid).await?;
                host.insert_row(self.target.table, new).await?;
                self.stats.updates += 1;
            }
            ChangeKind::Delete { old_key } => {
                let tid = self.find_row(host, &old_key, "delete").await?;
                host.delete_row(self.target.table, tid).await?;
                self.stats.deletes += 1;
            }
        }
        Ok(())
    }

    async fn find_row<H: TableStore + ?Sized>(
        &self,
        host: &H,
        key_row: &Row,
        op: &str,
    ) -> Result<TupleId> {
        let key = self.target.key.scan_key(key_row)?;
        let found = host.index_lookup(self.target.identity_index, &key).await?;
        match found.as_slice() {
            [tid] => Ok(*tid),
            [] => Err(SqueezeError::internal(format!(
                "row to {} not found in relation {}",
                op, self.target.table
            ))),
            _ => Err(SqueezeError::internal(format!(
                "identity key matches {} rows in relation {}",
                found.len(),
                self.target.table
            ))),
        }
    }
}

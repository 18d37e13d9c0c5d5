//! Client transactions: the concurrent workload a rebuild runs against.

use super::heap::Xid;
use super::MemoryDatabase;
use crate::error::{Result, SqueezeError};
use crate::host::{LockMode, Lsn, Oid, Value};
use tracing::debug;

/// A read-write transaction.
///
/// Rows are addressed by primary key (or, lacking one, the first unique
/// index). Each write takes a row-exclusive lock on the table without
/// waiting; the locks are held until commit or abort. Dropping an unfinished
/// transaction aborts it.
pub struct MemoryTransaction {
    db: MemoryDatabase,
    xid: Xid,
    holder: u64,
    finished: bool,
}

impl MemoryTransaction {
    pub(super) fn new(db: MemoryDatabase, xid: Xid, holder: u64) -> Self {
        Self {
            db,
            xid,
            holder,
            finished: false,
        }
    }

    pub fn xid(&self) -> u64 {
        self.xid
    }

    fn write<T>(
        &mut self,
        relid: Oid,
        op: impl FnOnce(&mut super::State, Xid) -> Result<T>,
    ) -> Result<T> {
        if self.finished {
            return Err(SqueezeError::host("transaction already finished"));
        }
        let mut state = self.db.state();
        if !state
            .locks
            .try_acquire(self.holder, relid, LockMode::RowExclusive)
        {
            return Err(SqueezeError::lock_not_available(format!(
                "could not obtain lock on relation {}",
                relid
            )));
        }
        op(&mut *state, self.xid)
    }

    pub fn insert(&mut self, relid: Oid, values: Vec<Value>) -> Result<()> {
        self.write(relid, |state, xid| state.client_insert(xid, relid, values))
    }

    /// Replace the row with key `key` by `values`.
    pub fn update(&mut self, relid: Oid, key: &[Value], values: Vec<Value>) -> Result<()> {
        self.write(relid, |state, xid| {
            state.client_update(xid, relid, key, values)
        })
    }

    pub fn delete(&mut self, relid: Oid, key: &[Value]) -> Result<()> {
        self.write(relid, |state, xid| state.client_delete(xid, relid, key))
    }

    /// Commit, returning the LSN of the commit record.
    pub fn commit(mut self) -> Result<Lsn> {
        self.finished = true;
        let lsn = {
            let mut state = self.db.state();
            let lsn = state.log.commit(self.xid);
            state.locks.release_all(self.holder);
            lsn
        };
        self.db.notify_lock_released();
        debug!("Transaction {} committed at {}", self.xid, lsn);
        Ok(lsn)
    }

    pub fn abort(mut self) {
        self.finish_aborted();
    }

    fn finish_aborted(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        {
            let mut state = self.db.state();
            state.log.abort(self.xid);
            state.locks.release_all(self.holder);
        }
        self.db.notify_lock_released();
        debug!("Transaction {} aborted", self.xid);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish_aborted();
    }
}

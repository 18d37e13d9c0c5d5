//! Host seam
//!
//! The engine never touches storage directly. Catalog reads, locks, change-log
//! decoding, heap and index writes and the final storage swap all go through
//! the traits below. [`crate::memory::MemoryDatabase`] implements every one of
//! them; a database integration implements them against its own internals.

mod types;

pub use types::*;

use crate::error::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Catalog reads.
///
/// Every method performs a fresh read: nothing is cached between calls, so two
/// calls around a concurrent DDL observe different version tokens.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Relation identifier by schema-qualified name.
    async fn relation_id(&self, schema: &str, name: &str) -> Result<Option<Oid>>;

    /// Class entry of a relation, `None` if it no longer exists.
    async fn class_entry(&self, relid: Oid) -> Result<Option<ClassEntry>>;

    /// User columns ordered by column number, dropped columns included.
    async fn attributes(&self, relid: Oid) -> Result<Vec<AttributeEntry>>;

    /// Indexes of a table ordered by index identifier.
    async fn indexes(&self, relid: Oid) -> Result<Vec<IndexEntry>>;

    /// Tablespace by name.
    async fn tablespace_by_name(&self, name: &str) -> Result<Option<Tablespace>>;

    /// Whether `role` may create objects in `tablespace`.
    async fn has_create_privilege(&self, role: Oid, tablespace: Oid) -> Result<bool>;

    /// Equality operator for a column type, if the type has one.
    fn equality_operator(&self, ty: ColumnType) -> Option<EqualityOperator>;

    /// Whether an incompatible reader (open cursor, pending trigger event) is
    /// attached to the relation in this session.
    async fn in_use_externally(&self, relid: Oid) -> Result<bool>;

    /// Whether the current role may create capture slots.
    async fn has_replication_privilege(&self) -> Result<bool>;

    /// Identifier of the current database.
    fn database_id(&self) -> Oid;
}

/// Relation-level locks held by the current session.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire a lock, waiting for conflicting holders to go away.
    async fn lock_relation(&self, relid: Oid, mode: LockMode) -> Result<()>;

    /// Release one lock previously acquired in `mode`.
    async fn unlock_relation(&self, relid: Oid, mode: LockMode) -> Result<()>;

    /// Release every lock of the session at once.
    ///
    /// Synchronous: this is how a rebuild whose future was dropped gives its
    /// locks back.
    fn release_session_locks(&self);
}

/// Change-log access: capture slots and decoding.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Create an ephemeral slot owned by the current session.
    ///
    /// Fails with `AlreadyActive` if a slot of that name exists.
    async fn create_slot(&self, name: &str) -> Result<CaptureSlot>;

    /// Name of a slot the current session still owns, if any.
    async fn lingering_slot(&self) -> Result<Option<String>>;

    /// Drop a slot owned by the current session.
    async fn drop_slot(&self, name: &str) -> Result<()>;

    /// Flush everything written so far and return the flush position.
    async fn flush(&self) -> Result<Lsn>;

    /// Current flush position, without flushing.
    async fn flush_position(&self) -> Result<Lsn>;

    /// Next committed change of `relid` whose transaction committed before
    /// `end`, or `None` once the slot has consumed everything up to `end`.
    async fn decode_next(&self, slot: &str, relid: Oid, end: Lsn)
        -> Result<Option<DecodedChange>>;
}

/// A stream of rows read under a historic view.
#[async_trait]
pub trait RowScan: Send {
    async fn next_row(&mut self) -> Result<Option<Row>>;
}

/// Heap and index writes, scans and the planner's clustering decision.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create a clone of `source`'s columns and storage options, with its own
    /// out-of-line store when the source has one. No indexes, no constraints.
    async fn create_transient_table(
        &self,
        source: &ClassEntry,
        columns: &[AttributeEntry],
        name: &str,
        tablespace: Oid,
    ) -> Result<TransientTable>;

    /// Scan a table under a historic view.
    async fn open_scan(
        &self,
        relid: Oid,
        view: &HistoricView,
        order: ScanOrder,
    ) -> Result<Box<dyn RowScan>>;

    /// Replace out-of-line references with their values as seen by `view`.
    async fn flatten(&self, row: Row, view: &HistoricView) -> Result<Row>;

    /// Append rows without maintaining indexes.
    async fn bulk_insert(&self, relid: Oid, rows: Vec<Row>) -> Result<()>;

    /// Whether sorting the whole table is cheaper than an index-ordered scan.
    async fn sort_cheaper_than_index_scan(&self, relid: Oid, index: Oid) -> Result<bool>;

    /// Build an index on `table` with the definition of `like`, over the rows
    /// already present.
    async fn create_index_like(
        &self,
        like: &IndexEntry,
        table: Oid,
        name: &str,
        tablespace: Oid,
    ) -> Result<Oid>;

    /// Insert one row, maintaining every index of the table.
    async fn insert_row(&self, relid: Oid, row: Row) -> Result<TupleId>;

    /// Live rows matching an equality scan key on an index.
    async fn index_lookup(&self, index: Oid, key: &[ScanKeyEntry]) -> Result<Vec<TupleId>>;

    /// Delete one row.
    async fn delete_row(&self, relid: Oid, tid: TupleId) -> Result<()>;

    /// Drop a relation together with its indexes and out-of-line store.
    async fn drop_relation(&self, relid: Oid) -> Result<()>;
}

/// Catalog access needed by the storage swap.
#[async_trait]
pub trait StorageCatalog: Send + Sync {
    /// Apply every change of `exchange`, or none of them.
    ///
    /// For each `(staying, outgoing)` pair the file node, tablespace and
    /// out-of-line store are exchanged and the staying relation's
    /// all-visible page count is reset. The first pair's staying relation
    /// gets the new watermarks. Then the renames are applied in order and
    /// each store's single internal dependency record is replaced. Fails
    /// without changing anything if a relation is missing, a name is taken
    /// or a store does not have exactly one dependency record.
    async fn exchange_storage(&self, exchange: &StorageExchange) -> Result<()>;

    /// Visibility horizon of the current session: the oldest transaction
    /// still running and the oldest multi-transaction still referenced.
    async fn visibility_horizon(&self) -> Result<Watermarks>;

    /// Indexes of an out-of-line store.
    async fn out_of_line_indexes(&self, store: Oid) -> Result<Vec<Oid>>;
}

/// Read-only storage statistics.
#[async_trait]
pub trait StorageStats: Send + Sync {
    async fn page_count(&self, relid: Oid) -> Result<u32>;

    /// Whether the free-space map of the relation exists yet.
    async fn has_free_space_map(&self, relid: Oid) -> Result<bool>;

    /// Recorded free bytes of one page.
    async fn recorded_free_space(&self, relid: Oid, page: u32) -> Result<usize>;

    /// Size of one page in bytes.
    fn page_size(&self) -> usize;
}

/// Everything a rebuild needs from its host.
pub trait RebuildHost:
    Catalog + LockManager + ChangeLog + TableStore + StorageCatalog + StorageStats
{
}

impl<T> RebuildHost for T where
    T: Catalog + LockManager + ChangeLog + TableStore + StorageCatalog + StorageStats
{
}

/// Locks taken by a rebuild, so every exit path can release them.
#[derive(Debug, Default)]
pub struct HeldLocks {
    held: Vec<(Oid, LockMode)>,
}

impl HeldLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire<L: LockManager + ?Sized>(
        &mut self,
        host: &L,
        relid: Oid,
        mode: LockMode,
    ) -> Result<()> {
        host.lock_relation(relid, mode).await?;
        self.held.push((relid, mode));
        Ok(())
    }

    pub async fn release<L: LockManager + ?Sized>(
        &mut self,
        host: &L,
        relid: Oid,
        mode: LockMode,
    ) -> Result<()> {
        if let Some(pos) = self.held.iter().rposition(|h| *h == (relid, mode)) {
            self.held.remove(pos);
            host.unlock_relation(relid, mode).await?;
        }
        Ok(())
    }

    /// Release everything, newest first. Failures are logged, not returned.
    pub async fn release_all<L: LockManager + ?Sized>(&mut self, host: &L) {
        while let Some((relid, mode)) = self.held.pop() {
            if let Err(e) = host.unlock_relation(relid, mode).await {
                warn!("Failed to release {:?} lock on relation {}: {}", mode, relid, e);
            } else {
                debug!("Released {:?} lock on relation {}", mode, relid);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn holds(&self, relid: Oid, mode: LockMode) -> bool {
        self.held.contains(&(relid, mode))
    }
}

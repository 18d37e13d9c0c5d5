//! The rebuilding session's view of the database: every host trait.

use super::heap::{IndexKey, FROZEN_XID};
use super::planner::{correlation, ClusterCostModel, ClusterStats};
use super::{MemoryDatabase, State, PAGE_SIZE};
use crate::error::{Result, SqueezeError};
use crate::host::{
    AttributeEntry, CaptureSlot, Catalog, ChangeLog, ClassEntry, ColumnType, DecodedChange,
    EqualityOperator, FileNode, HistoricView, IndexEntry, LockManager, LockMode, Lsn, Oid,
    RelKind, Row, RowScan, ScanKeyEntry, ScanOrder, StorageCatalog, StorageExchange,
    StorageStats, TableStore, Tablespace, TransientTable, TupleId, Watermarks,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// A session of the in-memory database.
///
/// Slots, locks, cursors and transient relations belong to the session and
/// are released when it is dropped, as a backend's are when it exits.
pub struct MemorySession {
    db: MemoryDatabase,
    id: u64,
    role: Oid,
}

impl MemorySession {
    pub(super) fn new(db: MemoryDatabase, id: u64, role: Oid) -> Self {
        Self { db, id, role }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn role(&self) -> Oid {
        self.role
    }

    /// Open a cursor on a relation; it stays open until closed.
    pub fn open_cursor(&self, relid: Oid) {
        self.db.state().cursors.insert((self.id, relid));
    }

    pub fn close_cursor(&self, relid: Oid) {
        self.db.state().cursors.remove(&(self.id, relid));
    }

    fn owned_slot(state: &State, id: u64, name: &str) -> Result<()> {
        match state.log.slot(name) {
            Some(slot) if slot.owner == id => Ok(()),
            Some(_) => Err(SqueezeError::AlreadyActive(format!(
                "replication slot \"{}\" is active for another session",
                name
            ))),
            None => Err(SqueezeError::host(format!(
                "replication slot \"{}\" does not exist",
                name
            ))),
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let released = {
            let mut state = self.db.state();
            let slots: Vec<String> = state
                .log
                .slots
                .iter()
                .filter(|s| s.owner == self.id)
                .map(|s| s.name.clone())
                .collect();
            for name in &slots {
                state.log.drop_slot(name);
            }
            let transients = state.transients.remove(&self.id).unwrap_or_default();
            for relid in &transients {
                if let Err(e) = state.drop_relation(*relid) {
                    warn!("Failed to drop transient relation {}: {}", relid, e);
                }
            }
            let id = self.id;
            state.cursors.retain(|(session, _)| *session != id);
            if !slots.is_empty() || !transients.is_empty() {
                debug!(
                    "Session {} exited: dropped slots {:?} and relations {:?}",
                    id, slots, transients
                );
            }
            state.locks.release_all(id)
        };
        if released {
            self.db.notify_lock_released();
        }
    }
}

#[async_trait]
impl Catalog for MemorySession {
    async fn relation_id(&self, schema: &str, name: &str) -> Result<Option<Oid>> {
        Ok(self.db.state().catalog.relation_id(schema, name))
    }

    async fn class_entry(&self, relid: Oid) -> Result<Option<ClassEntry>> {
        Ok(self.db.state().catalog.classes.get(&relid).cloned())
    }

    async fn attributes(&self, relid: Oid) -> Result<Vec<AttributeEntry>> {
        Ok(self.db.state().catalog.columns(relid).to_vec())
    }

    async fn indexes(&self, relid: Oid) -> Result<Vec<IndexEntry>> {
        Ok(self.db.state().catalog.relation_indexes(relid))
    }

    async fn tablespace_by_name(&self, name: &str) -> Result<Option<Tablespace>> {
        Ok(self.db.state().catalog.tablespace_by_name(name))
    }

    async fn has_create_privilege(&self, role: Oid, tablespace: Oid) -> Result<bool> {
        Ok(self
            .db
            .state()
            .catalog
            .has_create_privilege(role, tablespace))
    }

    fn equality_operator(&self, ty: ColumnType) -> Option<EqualityOperator> {
        Some(match ty {
            ColumnType::Bool => EqualityOperator::BoolEq,
            ColumnType::Int => EqualityOperator::IntEq,
            ColumnType::Text => EqualityOperator::TextEq,
            ColumnType::Bytes => EqualityOperator::BytesEq,
        })
    }

    async fn in_use_externally(&self, relid: Oid) -> Result<bool> {
        Ok(self.db.state().cursors.contains(&(self.id, relid)))
    }

    async fn has_replication_privilege(&self) -> Result<bool> {
        Ok(self
            .db
            .state()
            .catalog
            .roles
            .get(&self.role)
            .is_some_and(|r| r.superuser || r.replication))
    }

    fn database_id(&self) -> Oid {
        self.db.database_id()
    }
}

#[async_trait]
impl LockManager for MemorySession {
    async fn lock_relation(&self, relid: Oid, mode: LockMode) -> Result<()> {
        self.db.acquire(self.id, relid, mode).await;
        Ok(())
    }

    async fn unlock_relation(&self, relid: Oid, mode: LockMode) -> Result<()> {
        if mode != LockMode::NoLock && !self.db.release(self.id, relid, mode) {
            return Err(SqueezeError::host(format!(
                "{:?} lock on relation {} is not held",
                mode, relid
            )));
        }
        Ok(())
    }

    fn release_session_locks(&self) {
        if self.db.state().locks.release_all(self.id) {
            self.db.notify_lock_released();
        }
    }
}

#[async_trait]
impl ChangeLog for MemorySession {
    async fn create_slot(&self, name: &str) -> Result<CaptureSlot> {
        let mut state = self.db.state();
        if state.log.slot(name).is_some() {
            return Err(SqueezeError::AlreadyActive(format!(
                "replication slot \"{}\" already exists",
                name
            )));
        }
        let slot = state.log.create_slot(name, self.id);
        Ok(CaptureSlot {
            name: slot.name.clone(),
            consistent_point: slot.consistent_point,
            view: HistoricView {
                slot: slot.name.clone(),
                horizon: slot.consistent_point,
            },
        })
    }

    async fn lingering_slot(&self) -> Result<Option<String>> {
        Ok(self
            .db
            .state()
            .log
            .slots
            .iter()
            .find(|s| s.owner == self.id)
            .map(|s| s.name.clone()))
    }

    async fn drop_slot(&self, name: &str) -> Result<()> {
        let mut state = self.db.state();
        Self::owned_slot(&state, self.id, name)?;
        state.log.drop_slot(name);
        Ok(())
    }

    async fn flush(&self) -> Result<Lsn> {
        Ok(self.db.state().log.flush())
    }

    async fn flush_position(&self) -> Result<Lsn> {
        Ok(self.db.state().log.flush_position())
    }

    async fn decode_next(
        &self,
        slot: &str,
        relid: Oid,
        end: Lsn,
    ) -> Result<Option<DecodedChange>> {
        let (change, cost) = {
            let mut state = self.db.state();
            Self::owned_slot(&state, self.id, slot)?;
            (state.log.decode_next(slot, relid, end), state.decode_cost)
        };
        if change.is_some() && !cost.is_zero() {
            tokio::time::sleep(cost).await;
        }
        Ok(change)
    }
}

/// Scan of one heap under a historic view.
struct MemoryScan {
    db: MemoryDatabase,
    filenode: FileNode,
    horizon: Lsn,
    order: ScanPosition,
}

enum ScanPosition {
    Physical(Option<TupleId>),
    Ordered(VecDeque<TupleId>),
}

#[async_trait]
impl RowScan for MemoryScan {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        let state = self.db.state();
        let heap = match state.files.get(&self.filenode) {
            Some(super::heap::Storage::Heap(heap)) => heap,
            _ => {
                return Err(SqueezeError::host(format!(
                    "file node {} vanished during scan",
                    self.filenode
                )))
            }
        };
        match &mut self.order {
            ScanPosition::Physical(position) => {
                while let Some((tid, tuple)) = heap.next_after(*position) {
                    *position = Some(tid);
                    if state.visible_in(tuple, self.horizon) {
                        return Ok(Some(tuple.row.clone()));
                    }
                }
            }
            ScanPosition::Ordered(tids) => {
                while let Some(tid) = tids.pop_front() {
                    if let Some(tuple) = heap.tuples.get(&tid) {
                        if state.visible_in(tuple, self.horizon) {
                            return Ok(Some(tuple.row.clone()));
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TableStore for MemorySession {
    async fn create_transient_table(
        &self,
        source: &ClassEntry,
        columns: &[AttributeEntry],
        name: &str,
        tablespace: Oid,
    ) -> Result<TransientTable> {
        let mut state = self.db.state();
        let watermarks = state.watermarks();
        let class = state.catalog.add_class(
            &source.schema,
            name,
            RelKind::Table,
            source.persistence,
            tablespace,
            source.owner,
            source.options.clone(),
            watermarks,
            true,
        )?;
        let relid = class.oid;
        if let Some(node) = class.filenode {
            state
                .files
                .insert(node, super::heap::Storage::Heap(Default::default()));
        }
        state.transients.entry(self.id).or_default().push(relid);

        let mut attributes = Vec::with_capacity(columns.len());
        for column in columns {
            attributes.push(AttributeEntry {
                version: state.catalog.new_version(),
                ..column.clone()
            });
        }
        state.catalog.attributes.insert(relid, attributes);
        state.catalog.class_mut(relid)?.natts = columns.len();

        let out_of_line_store = match source.out_of_line_store {
            Some(_) => Some(state.create_out_of_line_store(relid)?),
            None => None,
        };
        Ok(TransientTable {
            relid,
            out_of_line_store,
        })
    }

    async fn open_scan(
        &self,
        relid: Oid,
        view: &HistoricView,
        order: ScanOrder,
    ) -> Result<Box<dyn RowScan>> {
        let state = self.db.state();
        Self::owned_slot(&state, self.id, &view.slot)?;
        let filenode = state.catalog.class(relid)?.filenode.ok_or_else(|| {
            SqueezeError::host(format!("relation {} has no storage", relid))
        })?;
        let order = match order {
            ScanOrder::Physical => ScanPosition::Physical(None),
            ScanOrder::Index(index) => {
                ScanPosition::Ordered(state.index_file(index)?.ordered().into())
            }
        };
        Ok(Box::new(MemoryScan {
            db: self.db.clone(),
            filenode,
            horizon: view.horizon,
            order,
        }))
    }

    async fn flatten(&self, row: Row, view: &HistoricView) -> Result<Row> {
        let state = self.db.state();
        Self::owned_slot(&state, self.id, &view.slot)?;
        state.flatten(&row)
    }

    async fn bulk_insert(&self, relid: Oid, rows: Vec<Row>) -> Result<()> {
        let mut state = self.db.state();
        for row in rows {
            state.insert_tuple(relid, row, FROZEN_XID, false)?;
        }
        Ok(())
    }

    async fn sort_cheaper_than_index_scan(&self, relid: Oid, index: Oid) -> Result<bool> {
        let state = self.db.state();
        let heap = state.heap(relid)?;
        let positions: Vec<u64> = state
            .index_file(index)?
            .ordered()
            .into_iter()
            .filter(|tid| {
                heap.tuples
                    .get(tid)
                    .is_some_and(|t| state.visible_now(t, None))
            })
            .map(|tid| tid.0)
            .collect();
        let stats = ClusterStats {
            tuples: positions.len() as f64,
            pages: heap.page_count() as f64,
            correlation: correlation(&positions),
        };
        let model = ClusterCostModel::default();
        let cheaper = model.sort_is_cheaper(stats);
        debug!(
            "Clustering relation {}: sort {:.1}, index scan {:.1}",
            relid,
            model.seq_scan_and_sort(stats),
            model.index_scan(stats)
        );
        Ok(cheaper)
    }

    async fn create_index_like(
        &self,
        like: &IndexEntry,
        table: Oid,
        name: &str,
        tablespace: Oid,
    ) -> Result<Oid> {
        let mut state = self.db.state();
        let class = state.catalog.class(table)?.clone();
        let def = super::catalog::IndexDef {
            table,
            key_columns: like.key_columns.clone(),
            method: like.method,
            unique: like.unique,
            primary: like.primary,
            replica_identity: like.replica_identity,
            valid: true,
            ready: true,
            live: true,
            version: state.catalog.new_version(),
        };
        let oid = state.add_index(&class, name, tablespace, def)?;
        if let Some(class) = state.catalog.classes.get_mut(&oid) {
            class.options.fillfactor = like.options.fillfactor;
        }
        Ok(oid)
    }

    async fn insert_row(&self, relid: Oid, row: Row) -> Result<TupleId> {
        self.db.state().insert_tuple(relid, row, FROZEN_XID, true)
    }

    async fn index_lookup(&self, index: Oid, key: &[ScanKeyEntry]) -> Result<Vec<TupleId>> {
        let state = self.db.state();
        let entry = state
            .catalog
            .index_entry(index)
            .ok_or_else(|| SqueezeError::host(format!("index {} does not exist", index)))?;
        let file = state.index_file(index)?;
        let heap = state.heap(entry.table)?;

        let mut entries: Vec<&ScanKeyEntry> = key.iter().collect();
        entries.sort_by_key(|e| e.index_column);
        let full_key = entries.len() == entry.key_columns.len()
            && entries
                .iter()
                .enumerate()
                .all(|(i, e)| e.index_column == i + 1);
        let candidates: Vec<TupleId> = if full_key {
            file.get(&IndexKey(entries.iter().map(|e| e.argument.clone()).collect()))
                .to_vec()
        } else {
            file.ordered()
        };

        let mut found = Vec::new();
        for tid in candidates {
            let Some(tuple) = heap.tuples.get(&tid) else {
                continue;
            };
            if !state.visible_now(tuple, Some(FROZEN_XID)) {
                continue;
            }
            let mut matches = true;
            for e in &entries {
                let attnum = e
                    .index_column
                    .checked_sub(1)
                    .and_then(|i| entry.key_columns.get(i))
                    .copied();
                let value = match attnum.and_then(|a| tuple.row.get(a)) {
                    Some(v) => state.resolve(v)?,
                    None => {
                        matches = false;
                        break;
                    }
                };
                if !e.operator.matches(&value, &e.argument) {
                    matches = false;
                    break;
                }
            }
            if matches {
                found.push(tid);
            }
        }
        Ok(found)
    }

    async fn delete_row(&self, relid: Oid, tid: TupleId) -> Result<()> {
        self.db.state().delete_tuple(relid, tid, FROZEN_XID)?;
        Ok(())
    }

    async fn drop_relation(&self, relid: Oid) -> Result<()> {
        self.db.state().drop_relation(relid)
    }
}

#[async_trait]
impl StorageCatalog for MemorySession {
    async fn exchange_storage(&self, exchange: &StorageExchange) -> Result<()> {
        self.db.state().exchange_storage(exchange)
    }

    async fn visibility_horizon(&self) -> Result<Watermarks> {
        Ok(self.db.state().watermarks())
    }

    async fn out_of_line_indexes(&self, store: Oid) -> Result<Vec<Oid>> {
        Ok(self
            .db
            .state()
            .catalog
            .relation_indexes(store)
            .iter()
            .map(|i| i.oid)
            .collect())
    }
}

#[async_trait]
impl StorageStats for MemorySession {
    async fn page_count(&self, relid: Oid) -> Result<u32> {
        Ok(self.db.state().heap(relid)?.page_count())
    }

    async fn has_free_space_map(&self, relid: Oid) -> Result<bool> {
        Ok(self.db.state().heap(relid)?.has_fsm())
    }

    async fn recorded_free_space(&self, relid: Oid, page: u32) -> Result<usize> {
        Ok(self.db.state().heap(relid)?.recorded_free_space(page))
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Value;
    use crate::memory::TableDef;

    fn table(db: &MemoryDatabase) -> Oid {
        db.create_table(
            TableDef::new("public", "t")
                .column("id", ColumnType::Int)
                .column("v", ColumnType::Text)
                .primary_key(&["id"]),
        )
        .unwrap()
    }

    fn insert(db: &MemoryDatabase, relid: Oid, id: i64, v: &str) {
        let mut tx = db.begin();
        tx.insert(relid, vec![Value::Int(id), Value::text(v)]).unwrap();
        tx.commit().unwrap();
    }

    async fn scan_all(session: &MemorySession, relid: Oid, view: &HistoricView) -> Vec<Row> {
        let mut scan = session
            .open_scan(relid, view, ScanOrder::Physical)
            .await
            .unwrap();
        let mut rows = Vec::new();
        while let Some(row) = scan.next_row().await.unwrap() {
            rows.push(row);
        }
        rows
    }

    #[tokio::test]
    async fn test_view_and_slot_partition_commits() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        insert(&db, relid, 1, "a");

        let mut running = db.begin();
        running
            .insert(relid, vec![Value::Int(2), Value::text("b")])
            .unwrap();

        let slot = session.create_slot("s").await.unwrap();
        running.commit().unwrap();
        insert(&db, relid, 3, "c");

        let seen = scan_all(&session, relid, &slot.view).await;
        assert_eq!(seen, vec![Row::new(vec![Value::Int(1), Value::text("a")])]);

        let end = session.flush().await.unwrap();
        let mut decoded = Vec::new();
        while let Some(change) = session.decode_next("s", relid, end).await.unwrap() {
            decoded.push(change);
        }
        assert_eq!(decoded.len(), 2);
        assert!(matches!(&decoded[0], DecodedChange::Insert { new, .. } if new.get(1) == Some(&Value::Int(2))));

        session.drop_slot("s").await.unwrap();
    }

    #[tokio::test]
    async fn test_logged_update_and_delete_images() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        insert(&db, relid, 1, "a");
        session.create_slot("s").await.unwrap();

        let mut tx = db.begin();
        tx.update(relid, &[Value::Int(1)], vec![Value::Int(1), Value::text("b")])
            .unwrap();
        tx.update(relid, &[Value::Int(1)], vec![Value::Int(2), Value::text("b")])
            .unwrap();
        tx.delete(relid, &[Value::Int(2)]).unwrap();
        tx.commit().unwrap();

        let end = session.flush().await.unwrap();
        let mut decoded = Vec::new();
        while let Some(change) = session.decode_next("s", relid, end).await.unwrap() {
            decoded.push(change);
        }
        let key = |id| Row::new(vec![Value::Int(id), Value::Null]);
        assert!(matches!(&decoded[0], DecodedChange::Update { old_key: None, .. }));
        assert!(matches!(&decoded[1], DecodedChange::Update { old_key: Some(k), .. } if *k == key(1)));
        assert!(matches!(&decoded[2], DecodedChange::Delete { old_key, .. } if *old_key == key(2)));
    }

    #[tokio::test]
    async fn test_session_drop_releases_everything() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        {
            let session = db.session();
            session.create_slot("s").await.unwrap();
            session
                .lock_relation(relid, LockMode::AccessExclusive)
                .await
                .unwrap();
            let class = db.class(relid).unwrap();
            let columns = session.attributes(relid).await.unwrap();
            session
                .create_transient_table(&class, &columns, "tmp_x", class.tablespace)
                .await
                .unwrap();
            assert!(db.relation_id("public", "tmp_x").is_some());
        }
        assert!(db.slot_names().is_empty());
        assert!(db.relation_id("public", "tmp_x").is_none());
        insert(&db, relid, 1, "a");
    }

    #[tokio::test]
    async fn test_index_lookup_sees_own_writes() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let pkey = db.indexes(relid)[0].oid;

        let tid = session
            .insert_row(relid, Row::new(vec![Value::Int(5), Value::text("x")]))
            .await
            .unwrap();
        let key = [ScanKeyEntry {
            index_column: 1,
            operator: EqualityOperator::IntEq,
            collation: None,
            argument: Value::Int(5),
        }];
        assert_eq!(session.index_lookup(pkey, &key).await.unwrap(), vec![tid]);

        session.delete_row(relid, tid).await.unwrap();
        assert!(session.index_lookup(pkey, &key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_exchange_changes_nothing() {
        let db = MemoryDatabase::new();
        let a = table(&db);
        let b = db
            .create_table(
                TableDef::new("public", "u")
                    .column("id", ColumnType::Int)
                    .primary_key(&["id"]),
            )
            .unwrap();
        let store_a = db.class(a).unwrap().out_of_line_store.unwrap();
        let before_a = db.class(a).unwrap();
        let before_b = db.class(b).unwrap();
        let session = db.session();

        // the rename comes last and collides with `b`
        let exchange = StorageExchange {
            pairs: vec![(a, b)],
            watermarks: Watermarks::default(),
            renames: vec![(a, "u".to_string())],
            dependencies: vec![],
        };
        let err = session.exchange_storage(&exchange).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(db.class(a).unwrap(), before_a);
        assert_eq!(db.class(b).unwrap(), before_b);

        // a store without its dependency record
        db.state().catalog.dependencies.retain(|(d, _)| *d != store_a);
        let exchange = StorageExchange {
            pairs: vec![(a, b)],
            watermarks: Watermarks::default(),
            renames: vec![],
            dependencies: vec![(store_a, b)],
        };
        let err = session.exchange_storage(&exchange).await.unwrap_err();
        assert!(matches!(err, SqueezeError::InternalInconsistency(_)));
        assert_eq!(db.class(a).unwrap(), before_a);
        assert!(db.internal_dependencies(store_a).is_empty());

        let exchange = StorageExchange {
            pairs: vec![(a, b)],
            watermarks: Watermarks::default(),
            renames: vec![],
            dependencies: vec![],
        };
        session.exchange_storage(&exchange).await.unwrap();
        assert_eq!(db.class(a).unwrap().filenode, before_b.filenode);
        assert_eq!(db.class(b).unwrap().filenode, before_a.filenode);
    }
}

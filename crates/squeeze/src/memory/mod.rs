//! # In-memory database
//!
//! A complete host for the rebuild engine: catalog with version tokens, MVCC
//! heaps with page accounting, indexes, out-of-line value stores, a change
//! log with capture slots, and relation locks.
//!
//! [`MemoryDatabase`] is the shared database; cloning it is cheap. The engine
//! talks to it through a [`MemorySession`], which owns its slots, locks and
//! transient relations and gives all of them back when dropped. Concurrent
//! writers use [`MemoryTransaction`]s. Writers never wait: a write to a table
//! someone holds exclusively fails with `LockNotAvailable`.
//!
//! DDL helpers apply immediately and without locks, which is how the tests
//! simulate structural changes slipping in between two checkpoints.

mod catalog;
mod client;
mod heap;
mod locks;
mod planner;
mod session;
mod wal;

pub use catalog::{
    TableDef, DATABASE_ID, DEFAULT_OUT_OF_LINE_THRESHOLD, DEFAULT_TABLESPACE, GLOBAL_TABLESPACE,
    OUT_OF_LINE_SCHEMA, SUPERUSER,
};
pub use client::MemoryTransaction;
pub use heap::PAGE_SIZE;
pub use planner::{ClusterCostModel, ClusterStats, CostWeights};
pub use session::MemorySession;

use crate::error::{Result, SqueezeError};
use crate::host::{
    AttributeEntry, ClassEntry, ColumnType, ExternalRef, FileNode, IndexEntry, IndexMethod,
    LockMode, Lsn, Oid, Persistence, RelKind, ReplicaIdentity, Row, StorageExchange,
    StorageOptions, Tablespace, TupleId, Value, Watermarks, INVALID_OID,
};
use crate::stats::DEFAULT_FILLFACTOR;
use catalog::{CatalogState, IndexDef, Role};
use heap::{HeapFile, IndexFile, IndexKey, Storage, Tuple, ValueStore, Xid, FROZEN_XID};
use locks::LockTable;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use wal::{ChangeLogState, LoggedChange};

/// Shared in-memory database.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    /// Woken whenever a lock is released
    lock_released: Notify,
}

pub(crate) struct State {
    catalog: CatalogState,
    files: HashMap<FileNode, Storage>,
    log: ChangeLogState,
    locks: LockTable,
    next_holder: u64,
    /// Open cursors, `(session, relation)`
    cursors: HashSet<(u64, Oid)>,
    /// Transient relations by creating session
    transients: HashMap<u64, Vec<Oid>>,
    decode_cost: Duration,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("database_id", &DATABASE_ID)
            .finish()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    catalog: CatalogState::new(),
                    files: HashMap::new(),
                    log: ChangeLogState::default(),
                    locks: LockTable::default(),
                    next_holder: 1,
                    cursors: HashSet::new(),
                    transients: HashMap::new(),
                    decode_cost: Duration::ZERO,
                }),
                lock_released: Notify::new(),
            }),
        }
    }

    /// A session of the bootstrap superuser.
    pub fn session(&self) -> MemorySession {
        self.session_as(SUPERUSER)
    }

    pub fn session_as(&self, role: Oid) -> MemorySession {
        let id = self.inner.state.lock().new_holder();
        MemorySession::new(self.clone(), id, role)
    }

    /// Start a client transaction.
    pub fn begin(&self) -> MemoryTransaction {
        let (xid, holder) = {
            let mut state = self.inner.state.lock();
            (state.log.begin(), state.new_holder())
        };
        MemoryTransaction::new(self.clone(), xid, holder)
    }

    pub fn database_id(&self) -> Oid {
        DATABASE_ID
    }

    /// Time each decoded change takes to come out of the change log.
    pub fn set_decode_cost(&self, cost: Duration) {
        self.inner.state.lock().decode_cost = cost;
    }

    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, State> {
        self.inner.state.lock()
    }

    pub(crate) fn notify_lock_released(&self) {
        self.inner.lock_released.notify_waiters();
    }

    /// Wait until `holder` is granted the lock.
    pub(crate) async fn acquire(&self, holder: u64, relid: Oid, mode: LockMode) {
        loop {
            let released = self.inner.lock_released.notified();
            if self.state().locks.try_acquire(holder, relid, mode) {
                return;
            }
            released.await;
        }
    }

    pub(crate) fn release(&self, holder: u64, relid: Oid, mode: LockMode) -> bool {
        let released = self.state().locks.release(holder, relid, mode);
        if released {
            self.notify_lock_released();
        }
        released
    }

    // DDL

    pub fn create_table(&self, def: TableDef) -> Result<Oid> {
        self.state().create_table(def)
    }

    pub fn create_index(&self, relid: Oid, name: &str, columns: &[&str], unique: bool) -> Result<Oid> {
        let mut state = self.state();
        let key_columns = columns
            .iter()
            .map(|c| state.catalog.column_number(relid, c))
            .collect::<Result<Vec<_>>>()?;
        let class = state.catalog.class(relid)?.clone();
        let def = IndexDef {
            table: relid,
            key_columns,
            method: IndexMethod::Btree,
            unique,
            primary: false,
            replica_identity: false,
            valid: true,
            ready: true,
            live: true,
            version: state.catalog.new_version(),
        };
        state.add_index(&class, name, class.tablespace, def)
    }

    pub fn drop_index(&self, index: Oid) -> Result<()> {
        let mut state = self.state();
        state.catalog.index_def_mut(index)?;
        state.drop_relation(index)
    }

    /// Rebuild an index into a new file node.
    pub fn reindex(&self, index: Oid) -> Result<()> {
        let mut state = self.state();
        let old = state.catalog.class(index)?.filenode;
        let node = state.catalog.new_filenode();
        state.catalog.class_mut(index)?.filenode = Some(node);
        if let Some(old) = old {
            state.files.remove(&old);
        }
        state.files.insert(node, Storage::Index(IndexFile::default()));
        state.build_index(index)
    }

    pub fn invalidate_index(&self, index: Oid) -> Result<()> {
        self.state().catalog.index_def_mut(index)?.valid = false;
        Ok(())
    }

    pub fn add_column(&self, relid: Oid, name: &str, ty: ColumnType) -> Result<()> {
        let mut state = self.state();
        let attnum = state.catalog.columns(relid).len() + 1;
        let version = state.catalog.new_version();
        state
            .catalog
            .attributes
            .entry(relid)
            .or_default()
            .push(AttributeEntry {
                attnum,
                name: name.to_string(),
                ty,
                collation: collation_of(ty),
                dropped: false,
                version,
            });
        state.catalog.class_mut(relid)?.natts = attnum;
        if let Ok(heap) = state.heap_mut(relid) {
            for tuple in heap.tuples.values_mut() {
                tuple.row.0.push(Value::Null);
            }
        }
        if matches!(ty, ColumnType::Text | ColumnType::Bytes)
            && state.catalog.class(relid)?.out_of_line_store.is_none()
        {
            state.create_out_of_line_store(relid)?;
        }
        Ok(())
    }

    pub fn drop_column(&self, relid: Oid, name: &str) -> Result<()> {
        let mut state = self.state();
        let attnum = state.catalog.column_number(relid, name)?;
        let version = state.catalog.new_version();
        if let Some(attribute) = state
            .catalog
            .attributes
            .get_mut(&relid)
            .and_then(|a| a.get_mut(attnum - 1))
        {
            attribute.dropped = true;
            attribute.name = format!("........pg.dropped.{}........", attnum);
            attribute.version = version;
        }
        state.catalog.class_mut(relid)?;
        Ok(())
    }

    /// Change a column's type, converting every row version.
    pub fn alter_column_type(&self, relid: Oid, name: &str, ty: ColumnType) -> Result<()> {
        let mut state = self.state();
        let attnum = state.catalog.column_number(relid, name)?;
        let version = state.catalog.new_version();
        if let Some(attribute) = state
            .catalog
            .attributes
            .get_mut(&relid)
            .and_then(|a| a.get_mut(attnum - 1))
        {
            attribute.ty = ty;
            attribute.collation = collation_of(ty);
            attribute.version = version;
        }
        let flattened = state.flattened_tuples(relid)?;
        let heap = state.heap_mut(relid)?;
        for (tid, mut row) in flattened {
            if let (Some(tuple), Some(value)) = (heap.tuples.get_mut(&tid), row.0.get_mut(attnum - 1))
            {
                *value = convert(std::mem::replace(value, Value::Null), ty);
                tuple.row = row;
            }
        }
        state.rewrite(relid)
    }

    /// Move the table into a new file node, as a table rewrite does.
    pub fn rewrite_table(&self, relid: Oid) -> Result<()> {
        self.state().rewrite(relid)
    }

    pub fn drop_table(&self, relid: Oid) -> Result<()> {
        let mut state = self.state();
        if state.catalog.class(relid)?.kind != RelKind::Table {
            return Err(SqueezeError::host(format!("{} is not a table", relid)));
        }
        state.drop_relation(relid)
    }

    pub fn set_fillfactor(&self, relid: Oid, fillfactor: u8) -> Result<()> {
        self.state().catalog.class_mut(relid)?.options.fillfactor = Some(fillfactor);
        Ok(())
    }

    pub fn set_out_of_line_threshold(&self, relid: Oid, bytes: usize) -> Result<()> {
        self.state().catalog.class_mut(relid)?.options.out_of_line_threshold = Some(bytes);
        Ok(())
    }

    /// Set the replica identity; `index` names the index for
    /// [`ReplicaIdentity::Index`].
    pub fn set_replica_identity(
        &self,
        relid: Oid,
        identity: ReplicaIdentity,
        index: Option<Oid>,
    ) -> Result<()> {
        let mut state = self.state();
        let indexes: Vec<Oid> = state
            .catalog
            .relation_indexes(relid)
            .iter()
            .map(|i| i.oid)
            .collect();
        if let Some(index) = index {
            if !indexes.contains(&index) {
                return Err(SqueezeError::host(format!(
                    "{} is not an index of relation {}",
                    index, relid
                )));
            }
        }
        for oid in indexes {
            let designated = identity == ReplicaIdentity::Index && Some(oid) == index;
            if state.catalog.indexes.get(&oid).map(|d| d.replica_identity) != Some(designated) {
                state.catalog.index_def_mut(oid)?.replica_identity = designated;
            }
        }
        state.catalog.class_mut(relid)?.replica_identity = identity;
        Ok(())
    }

    pub fn rename_relation(&self, relid: Oid, name: &str) -> Result<()> {
        self.state().rename(relid, name)
    }

    pub fn create_view(&self, schema: &str, name: &str) -> Result<Oid> {
        let mut state = self.state();
        let class = state.catalog.add_class(
            schema,
            name,
            RelKind::View,
            Persistence::Permanent,
            INVALID_OID,
            SUPERUSER,
            StorageOptions::default(),
            Watermarks::default(),
            false,
        )?;
        Ok(class.oid)
    }

    pub fn create_tablespace(&self, name: &str) -> Oid {
        let mut state = self.state();
        if let Some(existing) = state.catalog.tablespace_by_name(name) {
            return existing.oid;
        }
        let oid = state.catalog.new_oid();
        state.catalog.tablespaces.insert(
            oid,
            Tablespace {
                oid,
                name: name.to_string(),
                shared_only: false,
            },
        );
        oid
    }

    /// A role without superuser rights.
    pub fn create_role(&self, name: &str, replication: bool) -> Oid {
        let mut state = self.state();
        let oid = state.catalog.new_oid();
        state.catalog.roles.insert(
            oid,
            Role {
                name: name.to_string(),
                superuser: false,
                replication,
            },
        );
        oid
    }

    pub fn role_id(&self, name: &str) -> Option<Oid> {
        self.state()
            .catalog
            .roles
            .iter()
            .find(|(_, role)| role.name == name)
            .map(|(oid, _)| *oid)
    }

    pub fn grant_create(&self, role: Oid, tablespace: Oid) {
        self.state().catalog.grants.insert((role, tablespace));
    }

    /// Remove dead row versions no capture slot can still see, then record
    /// per-page free space.
    pub fn vacuum(&self, relid: Oid) -> Result<()> {
        self.state().vacuum(relid)
    }

    // Inspection

    pub fn class(&self, oid: Oid) -> Option<ClassEntry> {
        self.state().catalog.classes.get(&oid).cloned()
    }

    pub fn relation_id(&self, schema: &str, name: &str) -> Option<Oid> {
        self.state().catalog.relation_id(schema, name)
    }

    /// Relation names in a schema, sorted.
    pub fn relation_names(&self, schema: &str) -> Vec<String> {
        let state = self.state();
        let mut names: Vec<String> = state
            .catalog
            .classes
            .values()
            .filter(|c| c.schema == schema)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn indexes(&self, relid: Oid) -> Vec<IndexEntry> {
        self.state().catalog.relation_indexes(relid)
    }

    pub fn slot_names(&self) -> Vec<String> {
        self.state()
            .log
            .slots
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn storage_exists(&self, filenode: FileNode) -> bool {
        self.state().files.contains_key(&filenode)
    }

    /// Relations `oid` internally depends on.
    pub fn internal_dependencies(&self, oid: Oid) -> Vec<Oid> {
        self.state().catalog.internal_dependencies(oid)
    }

    /// Values kept in the out-of-line store of a table.
    pub fn out_of_line_values(&self, relid: Oid) -> usize {
        let state = self.state();
        state
            .catalog
            .classes
            .get(&relid)
            .and_then(|c| c.out_of_line_store)
            .and_then(|store| state.value_store(store).ok())
            .map_or(0, |s| s.values.len())
    }

    /// Durations of completed exclusive holds on a relation.
    pub fn exclusive_hold_times(&self, relid: Oid) -> Vec<Duration> {
        self.state().locks.exclusive_holds(relid)
    }

    /// Committed live rows, out-of-line values resolved, sorted.
    pub fn rows(&self, relid: Oid) -> Vec<Row> {
        self.state().current_rows(relid).unwrap_or_default()
    }

    /// Read the table the way a query would: under a shared lock, waiting
    /// for an exclusive holder to finish.
    pub async fn read_table(&self, relid: Oid) -> Result<Vec<Row>> {
        let holder = self.state().new_holder();
        self.acquire(holder, relid, LockMode::AccessShare).await;
        let rows = self.state().current_rows(relid);
        self.release(holder, relid, LockMode::AccessShare);
        rows
    }
}

fn collation_of(ty: ColumnType) -> Option<String> {
    match ty {
        ColumnType::Text => Some("default".to_string()),
        _ => None,
    }
}

fn convert(value: Value, ty: ColumnType) -> Value {
    match (value, ty) {
        (Value::Null, _) => Value::Null,
        (v @ Value::Bool(_), ColumnType::Bool)
        | (v @ Value::Int(_), ColumnType::Int)
        | (v @ Value::Text(_), ColumnType::Text)
        | (v @ Value::Bytes(_), ColumnType::Bytes) => v,
        (Value::Int(i), ColumnType::Text) => Value::Text(i.to_string()),
        (Value::Bool(b), ColumnType::Text) => Value::Text(b.to_string()),
        (Value::Text(s), ColumnType::Bytes) => Value::Bytes(s.into_bytes()),
        (Value::Text(s), ColumnType::Int) => s.parse().map(Value::Int).unwrap_or(Value::Null),
        (Value::Bytes(b), ColumnType::Text) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
        _ => Value::Null,
    }
}

fn key_of(row: &Row, key_columns: &[usize]) -> IndexKey {
    IndexKey(
        key_columns
            .iter()
            .map(|attnum| row.get(*attnum).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

impl State {
    fn new_holder(&mut self) -> u64 {
        let id = self.next_holder;
        self.next_holder += 1;
        id
    }

    // Storage access

    fn storage(&self, relid: Oid) -> Result<&Storage> {
        let class = self.catalog.class(relid)?;
        class
            .filenode
            .and_then(|node| self.files.get(&node))
            .ok_or_else(|| SqueezeError::host(format!("relation {} has no storage", relid)))
    }

    fn storage_mut(&mut self, relid: Oid) -> Result<&mut Storage> {
        let node = self.catalog.class(relid)?.filenode;
        node.and_then(|node| self.files.get_mut(&node))
            .ok_or_else(|| SqueezeError::host(format!("relation {} has no storage", relid)))
    }

    fn heap(&self, relid: Oid) -> Result<&HeapFile> {
        match self.storage(relid)? {
            Storage::Heap(heap) => Ok(heap),
            _ => Err(SqueezeError::host(format!("relation {} is not a heap", relid))),
        }
    }

    fn heap_mut(&mut self, relid: Oid) -> Result<&mut HeapFile> {
        match self.storage_mut(relid)? {
            Storage::Heap(heap) => Ok(heap),
            _ => Err(SqueezeError::host(format!("relation {} is not a heap", relid))),
        }
    }

    fn index_file(&self, index: Oid) -> Result<&IndexFile> {
        match self.storage(index)? {
            Storage::Index(file) => Ok(file),
            _ => Err(SqueezeError::host(format!("relation {} is not an index", index))),
        }
    }

    fn index_file_mut(&mut self, index: Oid) -> Result<&mut IndexFile> {
        match self.storage_mut(index)? {
            Storage::Index(file) => Ok(file),
            _ => Err(SqueezeError::host(format!("relation {} is not an index", index))),
        }
    }

    fn value_store(&self, store: Oid) -> Result<&ValueStore> {
        match self.storage(store)? {
            Storage::Values(values) => Ok(values),
            _ => Err(SqueezeError::host(format!("relation {} is not an out-of-line store", store))),
        }
    }

    fn value_store_mut(&mut self, store: Oid) -> Result<&mut ValueStore> {
        match self.storage_mut(store)? {
            Storage::Values(values) => Ok(values),
            _ => Err(SqueezeError::host(format!("relation {} is not an out-of-line store", store))),
        }
    }

    // Visibility

    /// Visible to a statement of `own` (or of nobody in particular) right now.
    fn visible_now(&self, tuple: &Tuple, own: Option<Xid>) -> bool {
        let inserted = Some(tuple.xmin) == own || self.log.is_committed(tuple.xmin);
        let deleted = tuple
            .xmax
            .is_some_and(|x| Some(x) == own || self.log.is_committed(x));
        inserted && !deleted
    }

    /// Visible to a historic view with the given horizon.
    fn visible_in(&self, tuple: &Tuple, horizon: Lsn) -> bool {
        self.log.committed_before(tuple.xmin, horizon)
            && !tuple
                .xmax
                .is_some_and(|x| self.log.committed_before(x, horizon))
    }

    /// Whether the version still occupies its key for `own`.
    fn occupies_key(&self, tuple: &Tuple, own: Xid) -> bool {
        let deleted = tuple
            .xmax
            .is_some_and(|x| x == own || self.log.is_committed(x));
        !self.log.is_aborted(tuple.xmin) && !deleted
    }

    // Values

    fn resolve(&self, value: &Value) -> Result<Value> {
        match value {
            Value::External(r) => self
                .value_store(r.store)?
                .values
                .get(&r.value_id)
                .cloned()
                .ok_or_else(|| {
                    SqueezeError::internal(format!(
                        "missing value {} in out-of-line store {}",
                        r.value_id, r.store
                    ))
                }),
            other => Ok(other.clone()),
        }
    }

    fn flatten(&self, row: &Row) -> Result<Row> {
        row.values()
            .iter()
            .map(|v| self.resolve(v))
            .collect::<Result<Vec<_>>>()
            .map(Row::new)
    }

    /// Move long values of `row` into the table's out-of-line store.
    fn store_out_of_line(&mut self, class: &ClassEntry, row: Row) -> Result<Row> {
        let Some(store) = class.out_of_line_store else {
            return Ok(row);
        };
        let threshold = class
            .options
            .out_of_line_threshold
            .unwrap_or(DEFAULT_OUT_OF_LINE_THRESHOLD);
        let mut values = Vec::with_capacity(row.0.len());
        for value in row.0 {
            let long = matches!(value, Value::Text(_) | Value::Bytes(_)) && value.size() > threshold;
            if long {
                let raw_len = value.size();
                let value_id = self.value_store_mut(store)?.put(value);
                values.push(Value::External(ExternalRef {
                    store,
                    value_id,
                    raw_len,
                }));
            } else {
                values.push(value);
            }
        }
        Ok(Row::new(values))
    }

    fn flattened_tuples(&self, relid: Oid) -> Result<Vec<(TupleId, Row)>> {
        self.heap(relid)?
            .tuples
            .iter()
            .map(|(tid, t)| Ok((*tid, self.flatten(&t.row)?)))
            .collect()
    }

    fn current_rows(&self, relid: Oid) -> Result<Vec<Row>> {
        let heap = self.heap(relid)?;
        let mut rows = heap
            .tuples
            .values()
            .filter(|t| self.visible_now(t, None))
            .map(|t| self.flatten(&t.row))
            .collect::<Result<Vec<_>>>()?;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    // Relations

    fn create_table(&mut self, def: TableDef) -> Result<Oid> {
        let watermarks = self.watermarks();
        let class = self.catalog.add_class(
            &def.schema,
            &def.name,
            RelKind::Table,
            def.persistence,
            INVALID_OID,
            def.owner,
            def.options.clone(),
            watermarks,
            true,
        )?;
        let relid = class.oid;
        if let Some(node) = class.filenode {
            self.files.insert(node, Storage::Heap(HeapFile::default()));
        }

        let mut attributes = Vec::with_capacity(def.columns.len());
        for (i, (name, ty)) in def.columns.iter().enumerate() {
            attributes.push(AttributeEntry {
                attnum: i + 1,
                name: name.clone(),
                ty: *ty,
                collation: collation_of(*ty),
                dropped: false,
                version: self.catalog.new_version(),
            });
        }
        let needs_store = attributes
            .iter()
            .any(|a| matches!(a.ty, ColumnType::Text | ColumnType::Bytes));
        self.catalog.attributes.insert(relid, attributes);
        {
            let class = self.catalog.class_mut(relid)?;
            class.natts = def.columns.len();
            class.replica_identity = def.replica_identity;
        }
        if needs_store {
            self.create_out_of_line_store(relid)?;
        }

        if !def.primary_key.is_empty() {
            let key_columns = def
                .primary_key
                .iter()
                .map(|c| self.catalog.column_number(relid, c))
                .collect::<Result<Vec<_>>>()?;
            let index = IndexDef {
                table: relid,
                key_columns,
                method: IndexMethod::Btree,
                unique: true,
                primary: true,
                replica_identity: false,
                valid: true,
                ready: true,
                live: true,
                version: self.catalog.new_version(),
            };
            let class = self.catalog.class(relid)?.clone();
            self.add_index(&class, &format!("{}_pkey", def.name), INVALID_OID, index)?;
        }

        debug!("Created table \"{}\".\"{}\" ({})", def.schema, def.name, relid);
        Ok(relid)
    }

    fn watermarks(&self) -> Watermarks {
        Watermarks {
            frozen_xid: self.log.oldest_running(),
            min_multi: 1,
        }
    }

    /// Create the out-of-line store of `owner`, with its index.
    fn create_out_of_line_store(&mut self, owner: Oid) -> Result<Oid> {
        let table = self.catalog.class(owner)?.clone();
        let store = self.catalog.add_class(
            OUT_OF_LINE_SCHEMA,
            &format!("pg_toast_{}", owner),
            RelKind::OutOfLineStore,
            table.persistence,
            table.tablespace,
            table.owner,
            StorageOptions::default(),
            table.watermarks,
            true,
        )?;
        if let Some(node) = store.filenode {
            self.files.insert(node, Storage::Values(ValueStore::default()));
        }
        let index = IndexDef {
            table: store.oid,
            key_columns: vec![1],
            method: IndexMethod::Btree,
            unique: true,
            primary: false,
            replica_identity: false,
            valid: true,
            ready: true,
            live: true,
            version: self.catalog.new_version(),
        };
        self.add_index(
            &store,
            &format!("pg_toast_{}_index", owner),
            table.tablespace,
            index,
        )?;
        self.catalog.dependencies.push((store.oid, owner));
        self.catalog.class_mut(owner)?.out_of_line_store = Some(store.oid);
        Ok(store.oid)
    }

    /// Register an index on `table` and build it over the rows present.
    fn add_index(&mut self, table: &ClassEntry, name: &str, tablespace: Oid, def: IndexDef) -> Result<Oid> {
        let class = self.catalog.add_class(
            &table.schema,
            name,
            RelKind::Index,
            table.persistence,
            tablespace,
            table.owner,
            StorageOptions::default(),
            Watermarks::default(),
            true,
        )?;
        if let Some(node) = class.filenode {
            self.files.insert(node, Storage::Index(IndexFile::default()));
        }
        self.catalog.indexes.insert(class.oid, def);
        if let Err(e) = self.build_index(class.oid) {
            self.drop_relation(class.oid)?;
            return Err(e);
        }
        Ok(class.oid)
    }

    /// Fill an empty index file from the heap of its table.
    fn build_index(&mut self, index: Oid) -> Result<()> {
        let def = self
            .catalog
            .indexes
            .get(&index)
            .cloned()
            .ok_or_else(|| SqueezeError::host(format!("index {} does not exist", index)))?;
        let name = self.catalog.class(index)?.name.clone();
        let heap = match self.storage(def.table)? {
            Storage::Heap(heap) => heap,
            // out-of-line store indexes stay empty
            _ => return Ok(()),
        };

        let mut entries = Vec::with_capacity(heap.tuples.len());
        let mut occupied = BTreeSet::new();
        for (tid, tuple) in &heap.tuples {
            let key = key_of(&self.flatten(&tuple.row)?, &def.key_columns);
            if def.unique
                && !key.has_null()
                && self.occupies_key(tuple, FROZEN_XID)
                && !occupied.insert(key.clone())
            {
                return Err(SqueezeError::host(format!(
                    "could not create unique index \"{}\": duplicate key",
                    name
                )));
            }
            entries.push((key, *tid));
        }

        let file = self.index_file_mut(index)?;
        for (key, tid) in entries {
            file.insert(key, tid);
        }
        Ok(())
    }

    /// Apply a storage exchange completely, or restore the catalog.
    fn exchange_storage(&mut self, exchange: &StorageExchange) -> Result<()> {
        let saved = self.catalog.clone();
        let result = self.apply_exchange(exchange);
        if result.is_err() {
            self.catalog = saved;
        }
        result
    }

    fn apply_exchange(&mut self, exchange: &StorageExchange) -> Result<()> {
        for &(staying, outgoing) in &exchange.pairs {
            let first = self.catalog.class(staying)?.clone();
            let second = self.catalog.class(outgoing)?.clone();
            {
                let class = self.catalog.class_mut(staying)?;
                class.filenode = second.filenode;
                class.tablespace = second.tablespace;
                class.out_of_line_store = second.out_of_line_store;
                class.all_visible_pages = 0;
            }
            let class = self.catalog.class_mut(outgoing)?;
            class.filenode = first.filenode;
            class.tablespace = first.tablespace;
            class.out_of_line_store = first.out_of_line_store;
        }
        if let Some(&(table, _)) = exchange.pairs.first() {
            self.catalog.class_mut(table)?.watermarks = exchange.watermarks;
        }

        for (relid, name) in &exchange.renames {
            self.rename(*relid, name)?;
        }

        for &(store, owner) in &exchange.dependencies {
            let before = self.catalog.dependencies.len();
            self.catalog.dependencies.retain(|(d, _)| *d != store);
            let removed = before - self.catalog.dependencies.len();
            if removed != 1 {
                return Err(SqueezeError::internal(format!(
                    "expected one dependency record for out-of-line store {}, found {}",
                    store, removed
                )));
            }
            self.catalog.dependencies.push((store, owner));
        }
        Ok(())
    }

    fn rename(&mut self, relid: Oid, name: &str) -> Result<()> {
        let schema = self.catalog.class(relid)?.schema.clone();
        if let Some(existing) = self.catalog.relation_id(&schema, name) {
            if existing != relid {
                return Err(SqueezeError::host(format!(
                    "relation \"{}\".\"{}\" already exists",
                    schema, name
                )));
            }
        }
        self.catalog.class_mut(relid)?.name = name.to_string();
        Ok(())
    }

    /// New file nodes for the table and its indexes, keeping row versions.
    fn rewrite(&mut self, relid: Oid) -> Result<()> {
        let old = self.catalog.class(relid)?.filenode;
        let node = self.catalog.new_filenode();
        let storage = old
            .and_then(|old| self.files.remove(&old))
            .unwrap_or(Storage::Heap(HeapFile::default()));
        self.files.insert(node, storage);
        self.catalog.class_mut(relid)?.filenode = Some(node);

        let indexes: Vec<Oid> = self
            .catalog
            .relation_indexes(relid)
            .iter()
            .map(|i| i.oid)
            .collect();
        for index in indexes {
            let old = self.catalog.class(index)?.filenode;
            let node = self.catalog.new_filenode();
            if let Some(old) = old {
                self.files.remove(&old);
            }
            self.files.insert(node, Storage::Index(IndexFile::default()));
            self.catalog.class_mut(index)?.filenode = Some(node);
            self.build_index(index)?;
        }
        debug!("Rewrote relation {} into file node {}", relid, node);
        Ok(())
    }

    /// Drop a relation with its indexes and out-of-line store.
    fn drop_relation(&mut self, relid: Oid) -> Result<()> {
        let class = self
            .catalog
            .classes
            .remove(&relid)
            .ok_or_else(|| SqueezeError::host(format!("relation {} does not exist", relid)))?;
        self.catalog.attributes.remove(&relid);
        self.catalog.indexes.remove(&relid);

        let indexes: Vec<Oid> = self
            .catalog
            .indexes
            .iter()
            .filter(|(_, def)| def.table == relid)
            .map(|(oid, _)| *oid)
            .collect();
        for index in indexes {
            self.drop_relation(index)?;
        }
        if let Some(store) = class.out_of_line_store {
            if self.catalog.classes.contains_key(&store) {
                self.drop_relation(store)?;
            }
        }
        if let Some(node) = class.filenode {
            self.files.remove(&node);
        }
        self.catalog
            .dependencies
            .retain(|(d, r)| *d != relid && *r != relid);
        for owned in self.transients.values_mut() {
            owned.retain(|oid| *oid != relid);
        }
        self.cursors.retain(|(_, oid)| *oid != relid);
        debug!("Dropped relation {} ({})", class.name, relid);
        Ok(())
    }

    // Row writes

    /// Widen a client row to the full column count, filling dropped columns.
    fn full_width(&self, relid: Oid, values: Vec<Value>) -> Result<Row> {
        let columns = self.catalog.columns(relid);
        if values.len() == columns.len() {
            return Ok(Row::new(values));
        }
        let live = columns.iter().filter(|a| !a.dropped).count();
        if values.len() != live {
            return Err(SqueezeError::host(format!(
                "relation {} has {} columns, got {} values",
                relid,
                live,
                values.len()
            )));
        }
        let mut values = values.into_iter();
        Ok(Row::new(
            columns
                .iter()
                .map(|a| {
                    if a.dropped {
                        Value::Null
                    } else {
                        values.next().unwrap_or(Value::Null)
                    }
                })
                .collect(),
        ))
    }

    /// Insert a flat row version. With `maintain_indexes`, unique indexes
    /// are checked and every ready index gets an entry.
    fn insert_tuple(&mut self, relid: Oid, row: Row, xid: Xid, maintain_indexes: bool) -> Result<TupleId> {
        let class = self.catalog.class(relid)?.clone();
        if class.kind != RelKind::Table {
            return Err(SqueezeError::host(format!(
                "cannot insert into {} \"{}\"",
                class.kind.as_str(),
                class.name
            )));
        }
        if row.0.len() != class.natts {
            return Err(SqueezeError::host(format!(
                "row has {} values, relation {} has {} columns",
                row.0.len(),
                class.name,
                class.natts
            )));
        }

        let indexes: Vec<IndexEntry> = if maintain_indexes {
            self.catalog
                .relation_indexes(relid)
                .into_iter()
                .filter(|i| i.ready && i.live)
                .collect()
        } else {
            Vec::new()
        };
        let mut keys = Vec::with_capacity(indexes.len());
        for index in &indexes {
            let key = key_of(&row, &index.key_columns);
            if index.unique && !key.has_null() {
                let heap = self.heap(relid)?;
                let taken = self
                    .index_file(index.oid)?
                    .get(&key)
                    .iter()
                    .filter_map(|tid| heap.tuples.get(tid))
                    .any(|t| self.occupies_key(t, xid));
                if taken {
                    return Err(SqueezeError::host(format!(
                        "duplicate key value violates unique constraint \"{}\"",
                        index.name
                    )));
                }
            }
            keys.push((index.oid, key));
        }

        let stored = self.store_out_of_line(&class, row)?;
        let fillfactor = class.options.fillfactor.unwrap_or(DEFAULT_FILLFACTOR);
        let tid = self.heap_mut(relid)?.insert(stored, xid, fillfactor);
        for (index, key) in keys {
            self.index_file_mut(index)?.insert(key, tid);
        }
        Ok(tid)
    }

    /// Mark a row version deleted by `xid`; returns its flat image.
    fn delete_tuple(&mut self, relid: Oid, tid: TupleId, xid: Xid) -> Result<Row> {
        let tuple = self
            .heap(relid)?
            .tuples
            .get(&tid)
            .cloned()
            .ok_or_else(|| SqueezeError::internal(format!("tuple {:?} of {} not found", tid, relid)))?;
        if !self.visible_now(&tuple, Some(xid)) {
            return Err(SqueezeError::internal(format!(
                "tuple {:?} of {} already deleted",
                tid, relid
            )));
        }
        if tuple.xmax.is_some_and(|x| !self.log.is_aborted(x)) {
            return Err(SqueezeError::lock_not_available(format!(
                "row {:?} of relation {} is locked by another transaction",
                tid, relid
            )));
        }
        let old = self.flatten(&tuple.row)?;
        if let Some(t) = self.heap_mut(relid)?.tuples.get_mut(&tid) {
            t.xmax = Some(xid);
        }
        Ok(old)
    }

    /// The version `own` sees under a row key.
    fn find_by_key(&self, relid: Oid, key: &[Value], own: Xid) -> Result<TupleId> {
        let index = self.catalog.row_key(relid).ok_or_else(|| {
            SqueezeError::host(format!("relation {} has no primary key", relid))
        })?;
        let key = IndexKey(key.to_vec());
        let heap = self.heap(relid)?;
        self.index_file(index.oid)?
            .get(&key)
            .iter()
            .copied()
            .find(|tid| {
                heap.tuples
                    .get(tid)
                    .is_some_and(|t| self.visible_now(t, Some(own)))
            })
            .ok_or_else(|| SqueezeError::host(format!("no row with key {:?} in {}", key.0, relid)))
    }

    /// Old-key image the change log records for `old`.
    fn old_key(&self, relid: Oid, old: &Row) -> Row {
        match self.catalog.identity_index(relid) {
            Some(index) => Row::new(
                (1..=old.0.len())
                    .map(|attnum| {
                        if index.key_columns.contains(&attnum) {
                            old.get(attnum).cloned().unwrap_or(Value::Null)
                        } else {
                            Value::Null
                        }
                    })
                    .collect(),
            ),
            None => old.clone(),
        }
    }

    fn key_changed(&self, relid: Oid, old: &Row, new: &Row) -> bool {
        match self.catalog.identity_index(relid) {
            Some(index) => key_of(old, &index.key_columns) != key_of(new, &index.key_columns),
            None => self
                .catalog
                .classes
                .get(&relid)
                .is_some_and(|c| c.replica_identity == ReplicaIdentity::Full),
        }
    }

    fn logged(&self, relid: Oid) -> bool {
        self.catalog
            .classes
            .get(&relid)
            .is_some_and(|c| c.persistence == Persistence::Permanent)
    }

    fn check_not_null(&self, relid: Oid, row: &Row) -> Result<()> {
        if let Some(pkey) = self.catalog.relation_indexes(relid).iter().find(|i| i.primary) {
            if key_of(row, &pkey.key_columns).has_null() {
                return Err(SqueezeError::host(format!(
                    "null value in primary key \"{}\"",
                    pkey.name
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn client_insert(&mut self, xid: Xid, relid: Oid, values: Vec<Value>) -> Result<()> {
        let row = self.full_width(relid, values)?;
        self.check_not_null(relid, &row)?;
        self.insert_tuple(relid, row.clone(), xid, true)?;
        if self.logged(relid) {
            self.log
                .log_change(xid, relid, LoggedChange::Insert { new: row });
        }
        Ok(())
    }

    pub(crate) fn client_update(
        &mut self,
        xid: Xid,
        relid: Oid,
        key: &[Value],
        values: Vec<Value>,
    ) -> Result<()> {
        let new = self.full_width(relid, values)?;
        self.check_not_null(relid, &new)?;
        let tid = self.find_by_key(relid, key, xid)?;
        let old = self.delete_tuple(relid, tid, xid)?;
        self.insert_tuple(relid, new.clone(), xid, true)?;
        if self.logged(relid) {
            let old_key = self
                .key_changed(relid, &old, &new)
                .then(|| self.old_key(relid, &old));
            self.log
                .log_change(xid, relid, LoggedChange::Update { old_key, new });
        }
        Ok(())
    }

    pub(crate) fn client_delete(&mut self, xid: Xid, relid: Oid, key: &[Value]) -> Result<()> {
        let tid = self.find_by_key(relid, key, xid)?;
        let old = self.delete_tuple(relid, tid, xid)?;
        if self.logged(relid) {
            let old_key = self.old_key(relid, &old);
            self.log
                .log_change(xid, relid, LoggedChange::Delete { old_key });
        }
        Ok(())
    }

    // Maintenance

    fn vacuum(&mut self, relid: Oid) -> Result<()> {
        let horizon = self.log.oldest_slot_horizon();
        let dead: Vec<TupleId> = self
            .heap(relid)?
            .tuples
            .iter()
            .filter(|(_, t)| {
                self.log.is_aborted(t.xmin)
                    || t.xmax.is_some_and(|x| match horizon {
                        Some(h) => self.log.committed_before(x, h),
                        None => self.log.is_committed(x),
                    })
            })
            .map(|(tid, _)| *tid)
            .collect();

        let indexes: Vec<Oid> = self
            .catalog
            .relation_indexes(relid)
            .iter()
            .map(|i| i.oid)
            .collect();
        let mut external = Vec::new();
        {
            let heap = self.heap_mut(relid)?;
            for tid in &dead {
                if let Some(tuple) = heap.remove(*tid) {
                    external.extend(tuple.row.0.into_iter().filter_map(|v| match v {
                        Value::External(r) => Some(r),
                        _ => None,
                    }));
                }
            }
            heap.rebuild_fsm();
        }
        for index in indexes {
            let file = self.index_file_mut(index)?;
            for tid in &dead {
                file.remove_tid(*tid);
            }
        }
        for r in external {
            if let Ok(store) = self.value_store_mut(r.store) {
                store.values.remove(&r.value_id);
            }
        }

        let pages = self.heap(relid)?.page_count();
        // in-place statistics update, no new row version
        if let Some(class) = self.catalog.classes.get_mut(&relid) {
            class.all_visible_pages = pages;
        }
        debug!("Vacuumed relation {}: {} dead row versions removed", relid, dead.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(db: &MemoryDatabase) -> Oid {
        db.create_table(
            TableDef::new("public", "t")
                .column("id", ColumnType::Int)
                .column("v", ColumnType::Text)
                .primary_key(&["id"]),
        )
        .unwrap()
    }

    fn row(id: i64, v: &str) -> Row {
        Row::new(vec![Value::Int(id), Value::text(v)])
    }

    #[test]
    fn test_roles_by_name() {
        let db = MemoryDatabase::new();
        let app = db.create_role("app", false);
        assert_eq!(db.role_id("app"), Some(app));
        assert_eq!(db.role_id("postgres"), Some(SUPERUSER));
        assert_eq!(db.role_id("nobody"), None);
    }

    #[test]
    fn test_create_table_catalog() {
        let db = MemoryDatabase::new();
        let relid = table(&db);

        let class = db.class(relid).unwrap();
        assert_eq!(class.natts, 2);
        let store = class.out_of_line_store.unwrap();
        assert_eq!(db.class(store).unwrap().name, format!("pg_toast_{}", relid));
        assert_eq!(db.internal_dependencies(store), vec![relid]);

        let indexes = db.indexes(relid);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "t_pkey");
        assert!(indexes[0].primary && indexes[0].unique);
        assert_eq!(db.relation_id("public", "t_pkey"), Some(indexes[0].oid));
    }

    #[test]
    fn test_transaction_visibility() {
        let db = MemoryDatabase::new();
        let relid = table(&db);

        let mut tx = db.begin();
        tx.insert(relid, vec![Value::Int(1), Value::text("a")]).unwrap();
        assert!(db.rows(relid).is_empty());
        tx.commit().unwrap();
        assert_eq!(db.rows(relid), vec![row(1, "a")]);

        let mut tx = db.begin();
        tx.update(relid, &[Value::Int(1)], vec![Value::Int(1), Value::text("b")])
            .unwrap();
        tx.abort();
        assert_eq!(db.rows(relid), vec![row(1, "a")]);

        {
            let mut tx = db.begin();
            tx.delete(relid, &[Value::Int(1)]).unwrap();
            // dropped without commit
        }
        assert_eq!(db.rows(relid), vec![row(1, "a")]);
    }

    #[test]
    fn test_unique_violation() {
        let db = MemoryDatabase::new();
        let relid = table(&db);

        let mut tx = db.begin();
        tx.insert(relid, vec![Value::Int(1), Value::text("a")]).unwrap();
        let err = tx
            .insert(relid, vec![Value::Int(1), Value::text("b")])
            .unwrap_err();
        assert!(err.to_string().contains("t_pkey"));
        assert!(tx.insert(relid, vec![Value::Null, Value::text("b")]).is_err());
    }

    #[test]
    fn test_long_values_go_out_of_line() {
        let db = MemoryDatabase::new();
        let relid = db
            .create_table(
                TableDef::new("public", "docs")
                    .column("id", ColumnType::Int)
                    .column("body", ColumnType::Text)
                    .primary_key(&["id"])
                    .out_of_line_threshold(16),
            )
            .unwrap();

        let long = "x".repeat(100);
        let mut tx = db.begin();
        tx.insert(relid, vec![Value::Int(1), Value::text(long.clone())])
            .unwrap();
        tx.insert(relid, vec![Value::Int(2), Value::text("short")])
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(db.out_of_line_values(relid), 1);
        assert_eq!(db.rows(relid), vec![row(1, &long), row(2, "short")]);
    }

    #[test]
    fn test_ddl_versions() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let version = db.class(relid).unwrap().version;
        let filenode = db.class(relid).unwrap().filenode;

        db.rewrite_table(relid).unwrap();
        let class = db.class(relid).unwrap();
        assert_ne!(class.version, version);
        assert_ne!(class.filenode, filenode);
        assert!(!db.storage_exists(filenode.unwrap()));

        db.drop_column(relid, "v").unwrap();
        assert!(db.create_index(relid, "t_v_idx", &["v"], false).is_err());
    }

    #[test]
    fn test_vacuum_builds_free_space_map() {
        let db = MemoryDatabase::new();
        let relid = table(&db);

        let mut tx = db.begin();
        for id in 0..10 {
            tx.insert(relid, vec![Value::Int(id), Value::text("payload")])
                .unwrap();
        }
        tx.commit().unwrap();
        let mut tx = db.begin();
        tx.delete(relid, &[Value::Int(0)]).unwrap();
        tx.commit().unwrap();

        db.vacuum(relid).unwrap();
        let state = db.state();
        let heap = state.heap(relid).unwrap();
        assert_eq!(heap.tuples.len(), 9);
        assert_eq!(heap.recorded_free_space(0), PAGE_SIZE - 9 * 39);
    }

    #[tokio::test]
    async fn test_reader_waits_for_exclusive_holder() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let holder = db.state().new_holder();
        db.acquire(holder, relid, LockMode::AccessExclusive).await;

        let reader = tokio::spawn({
            let db = db.clone();
            async move { db.read_table(relid).await }
        });
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        // writers do not wait
        let mut tx = db.begin();
        let err = tx
            .insert(relid, vec![Value::Int(1), Value::text("a")])
            .unwrap_err();
        assert!(matches!(err, SqueezeError::LockNotAvailable(_)));
        drop(tx);

        db.release(holder, relid, LockMode::AccessExclusive);
        assert!(reader.await.unwrap().unwrap().is_empty());
    }
}

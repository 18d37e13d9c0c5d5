//! Catalog, value and change-log types shared by the engine and its hosts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Object identifier of a catalog object (relation, tablespace, role, database).
pub type Oid = u32;

/// The "no object" identifier.
pub const INVALID_OID: Oid = 0;

/// Objects below this identifier belong to the system.
pub const FIRST_NORMAL_OBJECT_ID: Oid = 16384;

/// Physical storage identifier of a relation.
pub type FileNode = u32;

/// Position in the change log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Opaque per-record version stamp of a catalog row.
///
/// Changes whenever the catalog row is rewritten, so comparing two tokens
/// taken from the same row tells whether anything committed in between.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VersionToken(pub u64);

/// Relation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelKind {
    Table,
    Index,
    OutOfLineStore,
    View,
    MaterializedView,
    Sequence,
    PartitionedTable,
}

impl RelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelKind::Table => "table",
            RelKind::Index => "index",
            RelKind::OutOfLineStore => "out-of-line store",
            RelKind::View => "view",
            RelKind::MaterializedView => "materialized view",
            RelKind::Sequence => "sequence",
            RelKind::PartitionedTable => "partitioned table",
        }
    }
}

/// Relation persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    Permanent,
    Unlogged,
    Temporary,
}

/// What the change log records as the old key of updated/deleted rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaIdentity {
    /// Primary key columns
    Default,
    /// No old key at all
    Nothing,
    /// Every column
    Full,
    /// Columns of an explicitly designated unique index
    Index,
}

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int,
    Text,
    Bytes,
}

/// Storage options of a relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Percentage of each page filled by inserts (10..=100)
    pub fillfactor: Option<u8>,
    /// Values larger than this many bytes go to the out-of-line store
    pub out_of_line_threshold: Option<usize>,
}

/// Transaction-visibility watermarks of a table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Watermarks {
    /// Every row version older than this is frozen
    pub frozen_xid: u64,
    /// Oldest multi-transaction identifier still referenced
    pub min_multi: u64,
}

/// Class (relation) catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub oid: Oid,
    pub name: String,
    pub schema: String,
    pub kind: RelKind,
    pub persistence: Persistence,
    pub shared: bool,
    /// `None` for mapped relations
    pub filenode: Option<FileNode>,
    /// `INVALID_OID` means the database default tablespace
    pub tablespace: Oid,
    pub out_of_line_store: Option<Oid>,
    pub replica_identity: ReplicaIdentity,
    pub owner: Oid,
    pub natts: usize,
    pub options: StorageOptions,
    pub watermarks: Watermarks,
    pub all_visible_pages: u32,
    pub version: VersionToken,
}

impl ClassEntry {
    pub fn qualified_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

/// User column catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry {
    /// 1-based column number
    pub attnum: usize,
    pub name: String,
    pub ty: ColumnType,
    pub collation: Option<String>,
    pub dropped: bool,
    pub version: VersionToken,
}

/// Index access method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexMethod {
    Btree,
    Hash,
}

/// Index catalog entry: the index definition plus the index's own class entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub oid: Oid,
    pub name: String,
    pub table: Oid,
    /// Indexed table columns, 1-based
    pub key_columns: Vec<usize>,
    pub method: IndexMethod,
    pub unique: bool,
    pub primary: bool,
    /// Designated by `REPLICA IDENTITY USING INDEX`
    pub replica_identity: bool,
    pub valid: bool,
    pub ready: bool,
    pub live: bool,
    pub tablespace: Oid,
    pub options: StorageOptions,
    /// Version of the index definition row
    pub definition_version: VersionToken,
    /// Version of the index's class row (storage, name, tablespace)
    pub storage_version: VersionToken,
}

impl IndexEntry {
    /// Usable for reads, writes and DDL bookkeeping.
    pub fn is_usable(&self) -> bool {
        self.valid && self.ready && self.live
    }
}

/// Tablespace catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablespace {
    pub oid: Oid,
    pub name: String,
    /// Only shared relations may live here
    pub shared_only: bool,
}

/// Pointer to a value kept in an out-of-line store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    pub store: Oid,
    pub value_id: u64,
    pub raw_len: usize,
}

/// A column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    /// Stored out of line; must be flattened before leaving the read view
    External(ExternalRef),
}

impl Value {
    pub fn is_external(&self) -> bool {
        matches!(self, Value::External(_))
    }

    /// Approximate in-memory footprint in bytes.
    pub fn size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) => 8,
            Value::Text(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::External(_) => 18,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A row image, one value per column in column-number order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row(pub Vec<Value>);

/// Fixed per-row overhead used in size accounting.
pub const ROW_HEADER_SIZE: usize = 24;

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Value of a 1-based column.
    pub fn get(&self, attnum: usize) -> Option<&Value> {
        attnum.checked_sub(1).and_then(|i| self.0.get(i))
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn has_external(&self) -> bool {
        self.0.iter().any(Value::is_external)
    }

    pub fn size(&self) -> usize {
        ROW_HEADER_SIZE + self.0.iter().map(Value::size).sum::<usize>()
    }
}

/// Physical address of a row version inside one relation's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleId(pub u64);

/// Equality comparison used to match identity-key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EqualityOperator {
    BoolEq,
    IntEq,
    TextEq,
    BytesEq,
}

impl EqualityOperator {
    /// Whether `a = b` under this operator. NULL never matches.
    pub fn matches(&self, a: &Value, b: &Value) -> bool {
        match (self, a, b) {
            (EqualityOperator::BoolEq, Value::Bool(x), Value::Bool(y)) => x == y,
            (EqualityOperator::IntEq, Value::Int(x), Value::Int(y)) => x == y,
            (EqualityOperator::TextEq, Value::Text(x), Value::Text(y)) => x == y,
            (EqualityOperator::BytesEq, Value::Bytes(x), Value::Bytes(y)) => x == y,
            _ => false,
        }
    }
}

/// One entry of an index scan key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanKeyEntry {
    /// 1-based position within the index
    pub index_column: usize,
    pub operator: EqualityOperator,
    pub collation: Option<String>,
    pub argument: Value,
}

/// Lock modes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockMode {
    NoLock,
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
}

impl LockMode {
    /// Standard relation-lock conflict matrix.
    pub fn conflicts_with(self, other: LockMode) -> bool {
        use LockMode::*;
        if self == NoLock || other == NoLock {
            return false;
        }
        let conflicts: &[LockMode] = match self {
            NoLock => &[],
            AccessShare => &[AccessExclusive],
            RowShare => &[Exclusive, AccessExclusive],
            RowExclusive => &[Share, ShareRowExclusive, Exclusive, AccessExclusive],
            ShareUpdateExclusive => &[
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Share => &[
                RowExclusive,
                ShareUpdateExclusive,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            ShareRowExclusive => &[
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Exclusive => &[
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            AccessExclusive => &[
                AccessShare,
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
        };
        conflicts.contains(&other)
    }

    /// The strongest mode; nothing that changes the catalog is compatible with it.
    pub fn is_strongest(self) -> bool {
        self == LockMode::AccessExclusive
    }
}

/// A read view fixed at a point of the change log.
///
/// Sees exactly the transactions that committed before `horizon`; the capture
/// slot it came from emits exactly those that committed at or after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricView {
    pub slot: String,
    pub horizon: Lsn,
}

/// Scan order for the initial load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Physical,
    Index(Oid),
}

/// An ephemeral capture slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSlot {
    pub name: String,
    /// First change-log position whose commits the slot emits
    pub consistent_point: Lsn,
    pub view: HistoricView,
}

/// A committed row-level change as decoded from the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedChange {
    Insert {
        lsn: Lsn,
        new: Row,
    },
    Update {
        lsn: Lsn,
        /// Absent when the key did not change
        old_key: Option<Row>,
        new: Row,
    },
    Delete {
        lsn: Lsn,
        old_key: Row,
    },
}

impl DecodedChange {
    pub fn lsn(&self) -> Lsn {
        match self {
            DecodedChange::Insert { lsn, .. }
            | DecodedChange::Update { lsn, .. }
            | DecodedChange::Delete { lsn, .. } => *lsn,
        }
    }
}

/// Identifiers of a freshly created transient table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientTable {
    pub relid: Oid,
    pub out_of_line_store: Option<Oid>,
}

/// Catalog changes moving rebuilt storage under a table, applied by
/// [`super::StorageCatalog::exchange_storage`] as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageExchange {
    /// `(staying, outgoing)`: the table pair first, then one pair per index
    pub pairs: Vec<(Oid, Oid)>,
    /// New visibility watermarks of the staying table
    pub watermarks: Watermarks,
    /// `(relation, new name)`, applied in order
    pub renames: Vec<(Oid, String)>,
    /// `(out-of-line store, new owner)`
    pub dependencies: Vec<(Oid, Oid)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn(0x1_0000_00AB).to_string(), "1/000000AB");
        assert_eq!(Lsn::ZERO.to_string(), "0/00000000");
    }

    #[test]
    fn test_lock_conflicts() {
        assert!(LockMode::AccessShare.conflicts_with(LockMode::AccessExclusive));
        assert!(LockMode::AccessExclusive.conflicts_with(LockMode::AccessShare));
        assert!(!LockMode::AccessShare.conflicts_with(LockMode::RowExclusive));
        assert!(LockMode::RowExclusive.conflicts_with(LockMode::Share));
        assert!(!LockMode::RowExclusive.conflicts_with(LockMode::RowExclusive));
        assert!(!LockMode::NoLock.conflicts_with(LockMode::AccessExclusive));
        assert!(LockMode::AccessExclusive.is_strongest());
        assert!(!LockMode::Exclusive.is_strongest());
    }

    #[test]
    fn test_equality_operator_null_never_matches() {
        assert!(EqualityOperator::IntEq.matches(&Value::Int(1), &Value::Int(1)));
        assert!(!EqualityOperator::IntEq.matches(&Value::Null, &Value::Null));
        assert!(!EqualityOperator::TextEq.matches(&Value::Int(1), &Value::text("1")));
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(vec![Value::Int(7), Value::text("abc")]);
        assert_eq!(row.get(1), Some(&Value::Int(7)));
        assert_eq!(row.get(0), None);
        assert_eq!(row.get(3), None);
        assert!(!row.has_external());
        assert_eq!(row.size(), ROW_HEADER_SIZE + 8 + 3);
    }
}

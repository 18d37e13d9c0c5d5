//! # Catalog fingerprint
//!
//! A rebuild cannot keep the source table locked while it copies rows and
//! builds indexes, so it has to notice structural DDL that slipped in while
//! the table was unlocked. The fingerprint records the version token of every
//! catalog row that describes the table's storage:
//!
//! - the table's class entry (rewrites, storage options, column count)
//! - the out-of-line store's class entry, if any
//! - one token per user column
//! - per index: the definition token, the index class-entry token, its name
//!   and its tablespace
//!
//! Two fingerprints of the same table are equal iff no structural DDL
//! committed between the two reads. Constraints and triggers are not tracked:
//! every captured change already passed them, and the transient table has
//! neither.

use crate::error::{Result, SqueezeError};
use crate::host::{
    AttributeEntry, Catalog, ClassEntry, IndexEntry, LockMode, Oid, Persistence, RelKind,
    ReplicaIdentity, VersionToken, FIRST_NORMAL_OBJECT_ID,
};
use tracing::debug;

/// What is remembered about one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub oid: Oid,
    pub version: VersionToken,
    pub storage_version: VersionToken,
    pub name: String,
    pub tablespace: Oid,
}

impl IndexDescriptor {
    fn from_entry(entry: &IndexEntry) -> Self {
        Self {
            oid: entry.oid,
            version: entry.definition_version,
            storage_version: entry.storage_version,
            name: entry.name.clone(),
            tablespace: entry.tablespace,
        }
    }

    /// Same index, same catalog row versions, same name and tablespace.
    fn unchanged(&self, other: &IndexDescriptor) -> bool {
        self.oid == other.oid
            && self.version == other.version
            && self.storage_version == other.storage_version
            && self.name == other.name
            && self.tablespace == other.tablespace
    }
}

/// Versioned digest of a table's structural metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFingerprint {
    pub relid: Oid,
    pub version: VersionToken,
    pub out_of_line_store: Option<(Oid, VersionToken)>,
    pub columns: Vec<VersionToken>,
    /// Ordered by index identifier
    pub indexes: Vec<IndexDescriptor>,
}

impl RelationFingerprint {
    pub fn index(&self, oid: Oid) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.oid == oid)
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// A fingerprint plus the catalog rows it was taken from.
///
/// Later stages build the transient table from these rows; they are only
/// trustworthy while a verification against the fingerprint keeps passing.
#[derive(Debug, Clone)]
pub struct CapturedRelation {
    pub fingerprint: RelationFingerprint,
    pub class: ClassEntry,
    pub attributes: Vec<AttributeEntry>,
    pub indexes: Vec<IndexEntry>,
    /// Index identifying rows for update/delete replay
    pub identity_index: Oid,
}

impl CapturedRelation {
    pub fn relid(&self) -> Oid {
        self.fingerprint.relid
    }

    pub fn index_oids(&self) -> Vec<Oid> {
        self.indexes.iter().map(|i| i.oid).collect()
    }
}

/// Check that the relation may be rebuilt at all.
pub async fn check_eligibility<C: Catalog + ?Sized>(host: &C, class: &ClassEntry) -> Result<()> {
    let name = class.qualified_name();
    if class.kind != RelKind::Table {
        return Err(SqueezeError::not_eligible(format!(
            "{} is not a table but a {}",
            name,
            class.kind.as_str()
        )));
    }
    if class.persistence != Persistence::Permanent {
        return Err(SqueezeError::not_eligible(format!(
            "{} is not a regular table",
            name
        )));
    }
    if class.shared {
        return Err(SqueezeError::not_eligible(format!(
            "{} is shared relation",
            name
        )));
    }
    if class.filenode.is_none() {
        return Err(SqueezeError::not_eligible(format!(
            "{} is mapped relation",
            name
        )));
    }
    if class.oid < FIRST_NORMAL_OBJECT_ID {
        return Err(SqueezeError::not_eligible(format!(
            "{} is not user relation",
            name
        )));
    }
    if host.in_use_externally(class.oid).await? {
        return Err(SqueezeError::in_use(format!(
            "cannot squeeze {} because it is being used by active queries in this session",
            name
        )));
    }
    Ok(())
}

/// Take the fingerprint of a table.
///
/// The caller holds at least a shared lock on the table. Fails if the table
/// is not eligible, has an invalid index or lacks a usable identity index.
pub async fn capture<C: Catalog + ?Sized>(host: &C, relid: Oid) -> Result<CapturedRelation> {
    let class = host
        .class_entry(relid)
        .await?
        .ok_or_else(|| SqueezeError::RelationNotFound(format!("relation {}", relid)))?;

    check_eligibility(host, &class).await?;

    let out_of_line_store = match class.out_of_line_store {
        Some(store) => {
            let entry = host.class_entry(store).await?.ok_or_else(|| {
                SqueezeError::internal(format!("out-of-line store {} of {} missing", store, relid))
            })?;
            Some((store, entry.version))
        }
        None => None,
    };

    let attributes = host.attributes(relid).await?;
    let indexes = host.indexes(relid).await?;

    if indexes.iter().any(|i| !i.is_usable()) {
        return Err(SqueezeError::not_eligible("At least one index is invalid"));
    }

    let identity_index = identity_index(&class, &indexes)?;

    let fingerprint = RelationFingerprint {
        relid,
        version: class.version,
        out_of_line_store,
        columns: attributes.iter().map(|a| a.version).collect(),
        indexes: indexes.iter().map(IndexDescriptor::from_entry).collect(),
    };

    debug!(
        "Captured fingerprint of {}: {} columns, {} indexes",
        class.qualified_name(),
        fingerprint.columns.len(),
        fingerprint.indexes.len()
    );

    Ok(CapturedRelation {
        fingerprint,
        class,
        attributes,
        indexes,
        identity_index,
    })
}

/// The index whose key the change log records for updates and deletes.
fn identity_index(class: &ClassEntry, indexes: &[IndexEntry]) -> Result<Oid> {
    let found = match class.replica_identity {
        ReplicaIdentity::Full => return Err(SqueezeError::ReplicaIdentityFull),
        ReplicaIdentity::Nothing => None,
        ReplicaIdentity::Default => indexes.iter().find(|i| i.primary),
        ReplicaIdentity::Index => indexes.iter().find(|i| i.replica_identity),
    };
    found
        .map(|i| i.oid)
        .ok_or_else(|| SqueezeError::NoIdentityKey {
            schema: class.schema.clone(),
            table: class.name.clone(),
        })
}

/// Re-read the catalog and compare it to `fingerprint` token for token.
///
/// `lock_held` is the weakest lock held on the table since the fingerprint
/// was taken; under the strongest mode nothing can have changed and the
/// check is skipped.
pub async fn verify<C: Catalog + ?Sized>(
    host: &C,
    fingerprint: &RelationFingerprint,
    lock_held: LockMode,
) -> Result<()> {
    if lock_held.is_strongest() {
        return Ok(());
    }

    let relid = fingerprint.relid;
    let class = host
        .class_entry(relid)
        .await?
        .ok_or_else(|| SqueezeError::structural_change("Table no longer exists"))?;
    if class.version != fingerprint.version {
        return Err(SqueezeError::structural_change(
            "Incompatible DDL or heap rewrite performed concurrently",
        ));
    }

    if let Some((store, version)) = fingerprint.out_of_line_store {
        let current = host.class_entry(store).await?.map(|e| e.version);
        if current != Some(version) {
            return Err(SqueezeError::structural_change(
                "Incompatible DDL or heap rewrite performed concurrently",
            ));
        }
    }

    let columns: Vec<VersionToken> = host
        .attributes(relid)
        .await?
        .iter()
        .map(|a| a.version)
        .collect();
    if columns != fingerprint.columns {
        return Err(SqueezeError::structural_change(
            "Table definition changed concurrently",
        ));
    }

    let indexes = host.indexes(relid).await?;
    let mismatch = indexes.iter().any(|i| !i.is_usable())
        || indexes.len() != fingerprint.indexes.len()
        || indexes
            .iter()
            .map(IndexDescriptor::from_entry)
            .zip(&fingerprint.indexes)
            .any(|(current, old)| !current.unchanged(old));
    if mismatch {
        return Err(SqueezeError::structural_change(
            "Concurrent change of index detected",
        ));
    }

    debug!("Catalog of relation {} unchanged", relid);
    Ok(())
}

/// Validity-only check of the table's indexes.
///
/// Run right before asking for the exclusive lock: concurrent index DDL that
/// already flipped an index's validity waits for this session to finish, so
/// requesting the lock would deadlock.
pub async fn check_indexes_valid<C: Catalog + ?Sized>(host: &C, relid: Oid) -> Result<()> {
    if host.indexes(relid).await?.iter().any(|i| !i.is_usable()) {
        return Err(SqueezeError::structural_change(
            "Concurrent change of index detected",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ColumnType, Value};
    use crate::memory::{MemoryDatabase, TableDef};

    fn table(db: &MemoryDatabase) -> Oid {
        db.create_table(
            TableDef::new("public", "t")
                .column("id", ColumnType::Int)
                .column("v", ColumnType::Text)
                .primary_key(&["id"]),
        )
        .unwrap()
    }

    #[test]
    fn test_index_name_and_tablespace_are_compared() {
        let old = IndexDescriptor {
            oid: 16390,
            version: VersionToken(7),
            storage_version: VersionToken(9),
            name: "t_pkey".into(),
            tablespace: 0,
        };
        assert!(old.unchanged(&old.clone()));

        let renamed = IndexDescriptor {
            name: "t_pkey_old".into(),
            ..old.clone()
        };
        assert!(!renamed.unchanged(&old));

        let moved = IndexDescriptor {
            tablespace: 1700,
            ..old.clone()
        };
        assert!(!moved.unchanged(&old));
    }

    #[tokio::test]
    async fn test_capture_and_verify_unchanged() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();

        let captured = capture(&session, relid).await.unwrap();
        assert_eq!(captured.fingerprint.columns.len(), 2);
        assert_eq!(captured.fingerprint.indexes.len(), 1);
        assert!(captured.fingerprint.out_of_line_store.is_some());
        assert_eq!(captured.identity_index, captured.indexes[0].oid);

        verify(&session, &captured.fingerprint, LockMode::NoLock)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_data_changes_do_not_alter_fingerprint() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();

        let mut tx = db.begin();
        tx.insert(relid, vec![Value::Int(1), Value::text("a")]).unwrap();
        tx.commit().unwrap();

        verify(&session, &captured.fingerprint, LockMode::NoLock)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_column_change_detected() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();

        db.alter_column_type(relid, "v", ColumnType::Bytes).unwrap();

        let err = verify(&session, &captured.fingerprint, LockMode::AccessShare)
            .await
            .unwrap_err();
        assert!(matches!(err, SqueezeError::ConcurrentStructuralChange(_)));
    }

    #[tokio::test]
    async fn test_index_change_detected() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();

        db.create_index(relid, "t_v_idx", &["v"], false).unwrap();

        let err = verify(&session, &captured.fingerprint, LockMode::NoLock)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index"));
    }

    #[tokio::test]
    async fn test_verify_skipped_under_strongest_lock() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();

        db.rewrite_table(relid).unwrap();

        verify(&session, &captured.fingerprint, LockMode::AccessExclusive)
            .await
            .unwrap();
        assert!(verify(&session, &captured.fingerprint, LockMode::Exclusive)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropped_table() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();

        db.drop_table(relid).unwrap();

        let err = verify(&session, &captured.fingerprint, LockMode::NoLock)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Concurrent structural change: Table no longer exists"
        );
    }

    #[tokio::test]
    async fn test_identity_rules() {
        let db = MemoryDatabase::new();
        let session = db.session();

        let no_key = db
            .create_table(TableDef::new("public", "nokey").column("id", ColumnType::Int))
            .unwrap();
        assert!(matches!(
            capture(&session, no_key).await.unwrap_err(),
            SqueezeError::NoIdentityKey { .. }
        ));

        let full = db
            .create_table(
                TableDef::new("public", "full")
                    .column("id", ColumnType::Int)
                    .primary_key(&["id"])
                    .replica_identity(ReplicaIdentity::Full),
            )
            .unwrap();
        assert!(matches!(
            capture(&session, full).await.unwrap_err(),
            SqueezeError::ReplicaIdentityFull
        ));

        let nothing = db
            .create_table(
                TableDef::new("public", "nothing")
                    .column("id", ColumnType::Int)
                    .primary_key(&["id"])
                    .replica_identity(ReplicaIdentity::Nothing),
            )
            .unwrap();
        assert!(matches!(
            capture(&session, nothing).await.unwrap_err(),
            SqueezeError::NoIdentityKey { .. }
        ));
    }

    #[tokio::test]
    async fn test_eligibility() {
        let db = MemoryDatabase::new();
        let session = db.session();

        let unlogged = db
            .create_table(
                TableDef::new("public", "u")
                    .column("id", ColumnType::Int)
                    .primary_key(&["id"])
                    .persistence(Persistence::Unlogged),
            )
            .unwrap();
        assert!(matches!(
            capture(&session, unlogged).await.unwrap_err(),
            SqueezeError::NotEligible(_)
        ));

        let view = db.create_view("public", "v").unwrap();
        let err = capture(&session, view).await.unwrap_err();
        assert!(err.to_string().contains("not a table"));

        let relid = table(&db);
        session.open_cursor(relid);
        assert!(matches!(
            capture(&session, relid).await.unwrap_err(),
            SqueezeError::InUseExternally(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_index() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        let index = db.create_index(relid, "t_v_idx", &["v"], false).unwrap();
        db.invalidate_index(index).unwrap();

        let err = capture(&session, relid).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Relation not eligible: At least one index is invalid"
        );
        assert!(check_indexes_valid(&session, relid).await.is_err());
    }
}

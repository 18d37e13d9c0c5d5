//! System catalog of the in-memory database.

use crate::error::{Result, SqueezeError};
use crate::host::{
    AttributeEntry, ClassEntry, ColumnType, FileNode, IndexEntry, IndexMethod, Oid, Persistence,
    RelKind, ReplicaIdentity, StorageOptions, Tablespace, VersionToken, Watermarks,
    FIRST_NORMAL_OBJECT_ID, INVALID_OID,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name of the database default tablespace.
pub const DEFAULT_TABLESPACE: &str = "pg_default";

/// Name of the tablespace reserved for shared relations.
pub const GLOBAL_TABLESPACE: &str = "pg_global";

pub(crate) const DEFAULT_TABLESPACE_OID: Oid = 1663;
pub(crate) const GLOBAL_TABLESPACE_OID: Oid = 1664;

/// The bootstrap superuser.
pub const SUPERUSER: Oid = 10;

/// Identifier of the one database.
pub const DATABASE_ID: Oid = 5;

/// Values longer than this go out of line unless the table overrides it.
pub const DEFAULT_OUT_OF_LINE_THRESHOLD: usize = 2032;

/// Schema of out-of-line stores.
pub const OUT_OF_LINE_SCHEMA: &str = "pg_toast";

/// Definition of a table to create.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub(crate) schema: String,
    pub(crate) name: String,
    pub(crate) columns: Vec<(String, ColumnType)>,
    pub(crate) primary_key: Vec<String>,
    pub(crate) replica_identity: ReplicaIdentity,
    pub(crate) persistence: Persistence,
    pub(crate) owner: Oid,
    pub(crate) options: StorageOptions,
}

impl TableDef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            replica_identity: ReplicaIdentity::Default,
            persistence: Persistence::Permanent,
            owner: SUPERUSER,
            options: StorageOptions::default(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push((name.into(), ty));
        self
    }

    /// Primary key, indexed as `<table>_pkey`.
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn replica_identity(mut self, identity: ReplicaIdentity) -> Self {
        self.replica_identity = identity;
        self
    }

    pub fn persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn owner(mut self, role: Oid) -> Self {
        self.owner = role;
        self
    }

    pub fn fillfactor(mut self, fillfactor: u8) -> Self {
        self.options.fillfactor = Some(fillfactor);
        self
    }

    pub fn out_of_line_threshold(mut self, bytes: usize) -> Self {
        self.options.out_of_line_threshold = Some(bytes);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Role {
    pub name: String,
    pub superuser: bool,
    pub replication: bool,
}

/// Index definition; the rest of an index lives in its class entry.
#[derive(Debug, Clone)]
pub(crate) struct IndexDef {
    pub table: Oid,
    pub key_columns: Vec<usize>,
    pub method: IndexMethod,
    pub unique: bool,
    pub primary: bool,
    pub replica_identity: bool,
    pub valid: bool,
    pub ready: bool,
    pub live: bool,
    pub version: VersionToken,
}

#[derive(Debug, Clone)]
pub(crate) struct CatalogState {
    next_oid: Oid,
    next_filenode: FileNode,
    next_version: u64,
    pub classes: BTreeMap<Oid, ClassEntry>,
    pub attributes: HashMap<Oid, Vec<AttributeEntry>>,
    pub indexes: BTreeMap<Oid, IndexDef>,
    pub tablespaces: BTreeMap<Oid, Tablespace>,
    pub roles: HashMap<Oid, Role>,
    pub grants: HashSet<(Oid, Oid)>,
    /// Internal dependencies, `(dependent, referenced)`
    pub dependencies: Vec<(Oid, Oid)>,
}

impl CatalogState {
    pub fn new() -> Self {
        let mut tablespaces = BTreeMap::new();
        tablespaces.insert(
            DEFAULT_TABLESPACE_OID,
            Tablespace {
                oid: DEFAULT_TABLESPACE_OID,
                name: DEFAULT_TABLESPACE.to_string(),
                shared_only: false,
            },
        );
        tablespaces.insert(
            GLOBAL_TABLESPACE_OID,
            Tablespace {
                oid: GLOBAL_TABLESPACE_OID,
                name: GLOBAL_TABLESPACE.to_string(),
                shared_only: true,
            },
        );
        let mut roles = HashMap::new();
        roles.insert(
            SUPERUSER,
            Role {
                name: "postgres".to_string(),
                superuser: true,
                replication: true,
            },
        );
        Self {
            next_oid: FIRST_NORMAL_OBJECT_ID,
            next_filenode: FIRST_NORMAL_OBJECT_ID,
            next_version: 1,
            classes: BTreeMap::new(),
            attributes: HashMap::new(),
            indexes: BTreeMap::new(),
            tablespaces,
            roles,
            grants: HashSet::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn new_oid(&mut self) -> Oid {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }

    pub fn new_filenode(&mut self) -> FileNode {
        let node = self.next_filenode;
        self.next_filenode += 1;
        node
    }

    pub fn new_version(&mut self) -> VersionToken {
        let version = VersionToken(self.next_version);
        self.next_version += 1;
        version
    }

    pub fn relation_id(&self, schema: &str, name: &str) -> Option<Oid> {
        self.classes
            .values()
            .find(|c| c.schema == schema && c.name == name)
            .map(|c| c.oid)
    }

    pub fn ensure_name_free(&self, schema: &str, name: &str) -> Result<()> {
        if self.relation_id(schema, name).is_some() {
            return Err(SqueezeError::host(format!(
                "relation \"{}\".\"{}\" already exists",
                schema, name
            )));
        }
        Ok(())
    }

    pub fn class(&self, oid: Oid) -> Result<&ClassEntry> {
        self.classes
            .get(&oid)
            .ok_or_else(|| SqueezeError::host(format!("relation {} does not exist", oid)))
    }

    /// Mutable class entry; the row gets a new version.
    pub fn class_mut(&mut self, oid: Oid) -> Result<&mut ClassEntry> {
        let version = self.new_version();
        let class = self
            .classes
            .get_mut(&oid)
            .ok_or_else(|| SqueezeError::host(format!("relation {} does not exist", oid)))?;
        class.version = version;
        Ok(class)
    }

    /// Class entry of a new relation.
    #[allow(clippy::too_many_arguments)]
    pub fn add_class(
        &mut self,
        schema: &str,
        name: &str,
        kind: RelKind,
        persistence: Persistence,
        tablespace: Oid,
        owner: Oid,
        options: StorageOptions,
        watermarks: Watermarks,
        with_storage: bool,
    ) -> Result<ClassEntry> {
        self.ensure_name_free(schema, name)?;
        let oid = self.new_oid();
        let filenode = with_storage.then(|| self.new_filenode());
        let class = ClassEntry {
            oid,
            name: name.to_string(),
            schema: schema.to_string(),
            kind,
            persistence,
            shared: false,
            filenode,
            tablespace,
            out_of_line_store: None,
            replica_identity: ReplicaIdentity::Default,
            owner,
            natts: 0,
            options,
            watermarks,
            all_visible_pages: 0,
            version: self.new_version(),
        };
        self.classes.insert(oid, class.clone());
        Ok(class)
    }

    pub fn index_entry(&self, oid: Oid) -> Option<IndexEntry> {
        let def = self.indexes.get(&oid)?;
        let class = self.classes.get(&oid)?;
        Some(IndexEntry {
            oid,
            name: class.name.clone(),
            table: def.table,
            key_columns: def.key_columns.clone(),
            method: def.method,
            unique: def.unique,
            primary: def.primary,
            replica_identity: def.replica_identity,
            valid: def.valid,
            ready: def.ready,
            live: def.live,
            tablespace: class.tablespace,
            options: class.options.clone(),
            definition_version: def.version,
            storage_version: class.version,
        })
    }

    /// Indexes of a relation ordered by identifier.
    pub fn relation_indexes(&self, relid: Oid) -> Vec<IndexEntry> {
        self.indexes
            .iter()
            .filter(|(_, def)| def.table == relid)
            .filter_map(|(oid, _)| self.index_entry(*oid))
            .collect()
    }

    pub fn index_def_mut(&mut self, oid: Oid) -> Result<&mut IndexDef> {
        let version = self.new_version();
        let def = self
            .indexes
            .get_mut(&oid)
            .ok_or_else(|| SqueezeError::host(format!("index {} does not exist", oid)))?;
        def.version = version;
        Ok(def)
    }

    /// Index whose columns identify rows in the change log.
    pub fn identity_index(&self, relid: Oid) -> Option<IndexEntry> {
        let class = self.classes.get(&relid)?;
        let indexes = self.relation_indexes(relid);
        match class.replica_identity {
            ReplicaIdentity::Default => indexes.into_iter().find(|i| i.primary),
            ReplicaIdentity::Index => indexes.into_iter().find(|i| i.replica_identity),
            ReplicaIdentity::Full | ReplicaIdentity::Nothing => None,
        }
    }

    /// Primary key, or else any unique index: what client writes address
    /// rows by.
    pub fn row_key(&self, relid: Oid) -> Option<IndexEntry> {
        let indexes = self.relation_indexes(relid);
        indexes
            .iter()
            .find(|i| i.primary)
            .or_else(|| indexes.iter().find(|i| i.unique))
            .cloned()
    }

    pub fn columns(&self, relid: Oid) -> &[AttributeEntry] {
        self.attributes
            .get(&relid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn column_number(&self, relid: Oid, name: &str) -> Result<usize> {
        self.columns(relid)
            .iter()
            .find(|a| !a.dropped && a.name == name)
            .map(|a| a.attnum)
            .ok_or_else(|| {
                SqueezeError::host(format!("column \"{}\" of relation {} does not exist", name, relid))
            })
    }

    pub fn tablespace_by_name(&self, name: &str) -> Option<Tablespace> {
        self.tablespaces.values().find(|t| t.name == name).cloned()
    }

    pub fn has_create_privilege(&self, role: Oid, tablespace: Oid) -> bool {
        tablespace == DEFAULT_TABLESPACE_OID
            || tablespace == INVALID_OID
            || self.roles.get(&role).is_some_and(|r| r.superuser)
            || self.grants.contains(&(role, tablespace))
    }

    pub fn internal_dependencies(&self, dependent: Oid) -> Vec<Oid> {
        self.dependencies
            .iter()
            .filter(|(d, _)| *d == dependent)
            .map(|(_, r)| *r)
            .collect()
    }
}

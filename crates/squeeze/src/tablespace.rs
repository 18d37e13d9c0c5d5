//! Tablespace placement of the rebuilt table and its indexes.

use crate::error::{Result, SqueezeError};
use crate::fingerprint::{CapturedRelation, IndexDescriptor};
use crate::host::{Catalog, Oid, Tablespace};

/// Where the transient table and each transient index are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablespaceMapping {
    pub table: Oid,
    /// `(source index, tablespace)` overrides
    pub indexes: Vec<(Oid, Oid)>,
}

impl TablespaceMapping {
    /// Tablespace of the transient counterpart of `index`.
    pub fn index_tablespace(&self, index: &IndexDescriptor) -> Oid {
        self.indexes
            .iter()
            .find(|(oid, _)| *oid == index.oid)
            .map(|(_, tablespace)| *tablespace)
            .unwrap_or(index.tablespace)
    }
}

/// Resolve the caller's tablespace arguments against the captured relation.
///
/// Without a target the table stays in its current tablespace, and every index
/// without an override stays in its own.
pub async fn resolve<C: Catalog + ?Sized>(
    host: &C,
    relation: &CapturedRelation,
    target: Option<&str>,
    overrides: &[(String, String)],
) -> Result<TablespaceMapping> {
    let owner = relation.class.owner;

    let table = match target {
        Some(name) => lookup(host, name, owner).await?.oid,
        None => relation.class.tablespace,
    };

    let mut indexes: Vec<(Oid, Oid)> = Vec::with_capacity(overrides.len());
    for (index_name, tablespace_name) in overrides {
        let index = relation
            .fingerprint
            .index_by_name(index_name)
            .ok_or_else(|| {
                SqueezeError::invalid_configuration(format!(
                    "Table {} has no index \"{}\"",
                    relation.class.qualified_name(),
                    index_name
                ))
            })?;
        if indexes.iter().any(|(oid, _)| *oid == index.oid) {
            return Err(SqueezeError::invalid_configuration(format!(
                "Duplicate tablespace mapping for index \"{}\"",
                index_name
            )));
        }
        let tablespace = lookup(host, tablespace_name, owner).await?;
        indexes.push((index.oid, tablespace.oid));
    }

    Ok(TablespaceMapping { table, indexes })
}

async fn lookup<C: Catalog + ?Sized>(host: &C, name: &str, owner: Oid) -> Result<Tablespace> {
    let tablespace = host.tablespace_by_name(name).await?.ok_or_else(|| {
        SqueezeError::invalid_configuration(format!("tablespace \"{}\" does not exist", name))
    })?;
    if tablespace.shared_only {
        return Err(SqueezeError::invalid_configuration(format!(
            "only shared relations can be placed in tablespace \"{}\"",
            name
        )));
    }
    if !host.has_create_privilege(owner, tablespace.oid).await? {
        return Err(SqueezeError::permission_denied(format!(
            "permission denied for tablespace \"{}\"",
            name
        )));
    }
    Ok(tablespace)
}

//! Row identity key used to find the target row of replayed updates and deletes.

use crate::error::{Result, SqueezeError};
use crate::fingerprint::CapturedRelation;
use crate::host::{Catalog, EqualityOperator, Row, ScanKeyEntry, Value};

/// One column of the identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    /// Table column, 1-based
    pub attnum: usize,
    pub operator: EqualityOperator,
    pub collation: Option<String>,
}

/// Ordered identity-index columns with their equality operators.
///
/// The identity index is unique, so at most one live row matches a key value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIdentityKey {
    columns: Vec<KeyColumn>,
}

impl RowIdentityKey {
    /// Derive the key from the captured relation's identity index.
    pub fn build<C: Catalog + ?Sized>(host: &C, relation: &CapturedRelation) -> Result<Self> {
        let index = relation
            .indexes
            .iter()
            .find(|i| i.oid == relation.identity_index)
            .ok_or_else(|| {
                SqueezeError::internal(format!(
                    "identity index {} not among the captured indexes",
                    relation.identity_index
                ))
            })?;
        if !index.unique {
            return Err(SqueezeError::internal(format!(
                "identity index \"{}\" is not unique",
                index.name
            )));
        }

        let mut columns = Vec::with_capacity(index.key_columns.len());
        for &attnum in &index.key_columns {
            let attribute = relation
                .attributes
                .iter()
                .find(|a| a.attnum == attnum && !a.dropped)
                .ok_or_else(|| {
                    SqueezeError::internal(format!(
                        "identity index \"{}\" references missing column {}",
                        index.name, attnum
                    ))
                })?;
            let operator = host.equality_operator(attribute.ty).ok_or_else(|| {
                SqueezeError::internal(format!(
                    "no equality operator for column \"{}\" of type {:?}",
                    attribute.name, attribute.ty
                ))
            })?;
            columns.push(KeyColumn {
                attnum,
                operator,
                collation: attribute.collation.clone(),
            });
        }

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[KeyColumn] {
        &self.columns
    }

    /// Scan key matching the row whose key values appear in `row`.
    ///
    /// `row` may be a full image or a key-only image with the non-key
    /// columns set to NULL.
    pub fn scan_key(&self, row: &Row) -> Result<Vec<ScanKeyEntry>> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = row.get(column.attnum).cloned().unwrap_or(Value::Null);
                if value == Value::Null {
                    return Err(SqueezeError::internal(format!(
                        "identity key column {} is NULL",
                        column.attnum
                    )));
                }
                Ok(ScanKeyEntry {
                    index_column: i + 1,
                    operator: column.operator,
                    collation: column.collation.clone(),
                    argument: value,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::capture;
    use crate::host::ColumnType;
    use crate::memory::{MemoryDatabase, TableDef};

    #[tokio::test]
    async fn test_composite_key() {
        let db = MemoryDatabase::new();
        let relid = db
            .create_table(
                TableDef::new("public", "t")
                    .column("region", ColumnType::Text)
                    .column("payload", ColumnType::Bytes)
                    .column("id", ColumnType::Int)
                    .primary_key(&["region", "id"]),
            )
            .unwrap();
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();
        let key = RowIdentityKey::build(&session, &captured).unwrap();

        assert_eq!(key.columns().len(), 2);
        assert_eq!(key.columns()[0].attnum, 1);
        assert_eq!(key.columns()[0].operator, EqualityOperator::TextEq);
        assert_eq!(key.columns()[1].attnum, 3);
        assert_eq!(key.columns()[1].operator, EqualityOperator::IntEq);

        let row = Row::new(vec![Value::text("eu"), Value::Null, Value::Int(9)]);
        let scan_key = key.scan_key(&row).unwrap();
        assert_eq!(scan_key[0].index_column, 1);
        assert_eq!(scan_key[0].argument, Value::text("eu"));
        assert_eq!(scan_key[1].index_column, 2);
        assert_eq!(scan_key[1].argument, Value::Int(9));
    }

    #[tokio::test]
    async fn test_null_key_value_rejected() {
        let db = MemoryDatabase::new();
        let relid = db
            .create_table(
                TableDef::new("public", "t")
                    .column("id", ColumnType::Int)
                    .primary_key(&["id"]),
            )
            .unwrap();
        let session = db.session();
        let captured = capture(&session, relid).await.unwrap();
        let key = RowIdentityKey::build(&session, &captured).unwrap();

        let err = key.scan_key(&Row::new(vec![Value::Null])).unwrap_err();
        assert!(matches!(err, SqueezeError::InternalInconsistency(_)));
    }
}

//! Read-only helpers a scheduler uses to pick tables worth rebuilding.

use crate::error::{Result, SqueezeError};
use crate::host::{Catalog, LockManager, LockMode, Oid, StorageStats};

/// Fill factor of tables that do not set one.
pub const DEFAULT_FILLFACTOR: u8 = 100;

/// The table's `fillfactor` storage option.
pub async fn heap_fill_factor<H>(host: &H, relid: Oid) -> Result<u8>
where
    H: Catalog + LockManager + ?Sized,
{
    host.lock_relation(relid, LockMode::AccessShare).await?;
    let class = host.class_entry(relid).await;
    host.unlock_relation(relid, LockMode::AccessShare).await?;

    let class =
        class?.ok_or_else(|| SqueezeError::RelationNotFound(format!("relation {}", relid)))?;
    Ok(class.options.fillfactor.unwrap_or(DEFAULT_FILLFACTOR))
}

/// Fraction of the table's pages recorded as free in its free-space map.
///
/// `None` for an empty table, and for one that looks full only because its
/// free-space map does not exist yet.
pub async fn heap_free_space_ratio<H>(host: &H, relid: Oid) -> Result<Option<f64>>
where
    H: LockManager + StorageStats + ?Sized,
{
    host.lock_relation(relid, LockMode::AccessShare).await?;
    let ratio = free_space_ratio(host, relid).await;
    host.unlock_relation(relid, LockMode::AccessShare).await?;
    ratio
}

async fn free_space_ratio<H: StorageStats + ?Sized>(host: &H, relid: Oid) -> Result<Option<f64>> {
    let pages = host.page_count(relid).await?;
    if pages == 0 {
        return Ok(None);
    }

    let mut free = 0usize;
    for page in 0..pages {
        free += host.recorded_free_space(relid, page).await?;
    }
    let total = pages as usize * host.page_size();

    if free == 0 && !host.has_free_space_map(relid).await? {
        return Ok(None);
    }
    Ok(Some(free as f64 / total as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ColumnType, Value};
    use crate::memory::{MemoryDatabase, TableDef};

    fn table(db: &MemoryDatabase, fillfactor: Option<u8>) -> Oid {
        let mut def = TableDef::new("public", "t")
            .column("id", ColumnType::Int)
            .column("v", ColumnType::Text)
            .primary_key(&["id"]);
        if let Some(ff) = fillfactor {
            def = def.fillfactor(ff);
        }
        db.create_table(def).unwrap()
    }

    #[tokio::test]
    async fn test_fill_factor() {
        let db = MemoryDatabase::new();
        let relid = table(&db, Some(70));
        assert_eq!(heap_fill_factor(&db.session(), relid).await.unwrap(), 70);

        let db = MemoryDatabase::new();
        let relid = table(&db, None);
        assert_eq!(
            heap_fill_factor(&db.session(), relid).await.unwrap(),
            DEFAULT_FILLFACTOR
        );
    }

    #[tokio::test]
    async fn test_free_space_ratio() {
        let db = MemoryDatabase::new();
        let relid = table(&db, None);
        let session = db.session();

        // empty table
        assert_eq!(heap_free_space_ratio(&session, relid).await.unwrap(), None);

        let mut tx = db.begin();
        for id in 0..500 {
            tx.insert(relid, vec![Value::Int(id), Value::text("payload")])
                .unwrap();
        }
        tx.commit().unwrap();

        // pages exist, map not built yet
        assert_eq!(heap_free_space_ratio(&session, relid).await.unwrap(), None);

        let mut tx = db.begin();
        for id in 0..250 {
            tx.delete(relid, &[Value::Int(id)]).unwrap();
        }
        tx.commit().unwrap();
        db.vacuum(relid).unwrap();

        let ratio = heap_free_space_ratio(&session, relid)
            .await
            .unwrap()
            .unwrap();
        assert!(ratio > 0.3 && ratio < 0.9, "ratio {}", ratio);
    }
}

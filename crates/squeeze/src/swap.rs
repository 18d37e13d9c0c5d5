//! # Storage swap
//!
//! Runs under the final merge's exclusive locks. The source keeps its
//! identity (identifier, name, privileges, dependants) and takes over the
//! transient table's storage; the transient shell ends up holding the old
//! storage and is dropped afterwards.
//!
//! For the table itself the swap also:
//! - moves the out-of-line store along with the heap
//! - advances the visibility watermarks to the current horizon
//! - resets the all-visible page count (the next vacuum recomputes it)
//! - re-records the internal dependency of each out-of-line store on its
//!   new owner
//!
//! Row count and page estimates are left alone; nothing computed them for
//! the replayed changes.

use crate::error::{Result, SqueezeError};
use crate::host::{ClassEntry, Oid, RebuildHost, StorageExchange, TransientTable};
use tracing::{debug, info};

/// Prefix of out-of-line store names
pub const OUT_OF_LINE_NAME_PREFIX: &str = "pg_toast_";

/// Swap the storage of `source` and `transient`, their out-of-line stores
/// and each pair of indexes.
///
/// `source_indexes` and `transient_indexes` are aligned pairwise. Everything
/// that can be checked upfront is checked before the catalog is touched, and
/// the host applies the exchange as a whole, so on error both relations
/// still have their own storage.
pub async fn swap<H: RebuildHost + ?Sized>(
    host: &H,
    source: Oid,
    transient: &TransientTable,
    source_indexes: &[Oid],
    transient_indexes: &[Oid],
) -> Result<()> {
    let exchange = plan(host, source, transient.relid, source_indexes, transient_indexes).await?;
    host.exchange_storage(&exchange).await?;

    info!(
        "Swapped storage of relation {} with transient {} ({} indexes)",
        source,
        transient.relid,
        source_indexes.len()
    );
    Ok(())
}

async fn class_entry<H: RebuildHost + ?Sized>(host: &H, relid: Oid) -> Result<ClassEntry> {
    host.class_entry(relid)
        .await?
        .ok_or_else(|| SqueezeError::internal(format!("cache lookup failed for relation {}", relid)))
}

/// Validate the swap of `source` (staying) and `transient` (to be dropped)
/// and describe the catalog changes it makes. Reads only.
async fn plan<H: RebuildHost + ?Sized>(
    host: &H,
    source: Oid,
    transient: Oid,
    source_indexes: &[Oid],
    transient_indexes: &[Oid],
) -> Result<StorageExchange> {
    if source_indexes.len() != transient_indexes.len() {
        return Err(SqueezeError::internal(format!(
            "{} source indexes but {} transient indexes",
            source_indexes.len(),
            transient_indexes.len()
        )));
    }

    let mut pairs = vec![(source, transient)];
    pairs.extend(source_indexes.iter().copied().zip(transient_indexes.iter().copied()));

    let table = class_entry(host, source).await?;
    let shell = class_entry(host, transient).await?;
    check_pair(&table, &shell)?;
    for &(a, b) in &pairs[1..] {
        check_pair(&class_entry(host, a).await?, &class_entry(host, b).await?)?;
    }

    let horizon = host.visibility_horizon().await?;
    // the transient rows were written after the shell's watermarks were
    // taken, so the horizon cannot be older
    if horizon.frozen_xid < shell.watermarks.frozen_xid
        || horizon.min_multi < shell.watermarks.min_multi
    {
        return Err(SqueezeError::internal(format!(
            "visibility horizon {:?} precedes watermarks {:?} of relation {}",
            horizon, shell.watermarks, transient
        )));
    }

    let mut exchange = StorageExchange {
        pairs,
        watermarks: horizon,
        renames: Vec::new(),
        dependencies: Vec::new(),
    };

    // the source takes over the shell's store and the other way round
    match (shell.out_of_line_store, table.out_of_line_store) {
        (None, None) => {}
        (None, Some(_)) => {
            return Err(SqueezeError::internal("Unexpected out-of-line store exists"))
        }
        (Some(_), None) => return Err(SqueezeError::internal("Missing out-of-line store")),
        (Some(incoming), Some(outgoing)) => {
            let incoming_index = out_of_line_index(host, incoming).await?;
            let outgoing_index = out_of_line_index(host, outgoing).await?;

            // The outgoing store is renamed out of the way first, so the two
            // never share a name.
            exchange.renames = vec![
                (outgoing, format!("{}{}_", OUT_OF_LINE_NAME_PREFIX, source)),
                (outgoing_index, format!("{}{}_index_", OUT_OF_LINE_NAME_PREFIX, source)),
                (incoming, format!("{}{}", OUT_OF_LINE_NAME_PREFIX, source)),
                (incoming_index, format!("{}{}_index", OUT_OF_LINE_NAME_PREFIX, source)),
            ];
            check_renames(host, &exchange.renames).await?;

            exchange.dependencies = vec![(incoming, source), (outgoing, transient)];
        }
    }

    debug!(
        "Storage exchange of {} and {}: {} pairs, {} renames",
        source,
        transient,
        exchange.pairs.len(),
        exchange.renames.len()
    );
    Ok(exchange)
}

fn check_pair(staying: &ClassEntry, outgoing: &ClassEntry) -> Result<()> {
    if staying.filenode.is_none() || outgoing.filenode.is_none() {
        return Err(SqueezeError::internal("cannot swap mapped relations"));
    }
    if staying.persistence != outgoing.persistence {
        return Err(SqueezeError::internal(format!(
            "persistence of relations {} and {} does not match",
            staying.oid, outgoing.oid
        )));
    }
    Ok(())
}

/// Every new name must be free, or held by the relation itself, or by one
/// renamed earlier in the list.
async fn check_renames<H: RebuildHost + ?Sized>(host: &H, renames: &[(Oid, String)]) -> Result<()> {
    for (position, (relid, name)) in renames.iter().enumerate() {
        let schema = class_entry(host, *relid).await?.schema;
        let Some(holder) = host.relation_id(&schema, name).await? else {
            continue;
        };
        let vacated = renames[..position].iter().any(|(r, _)| *r == holder);
        if holder != *relid && !vacated {
            return Err(SqueezeError::internal(format!(
                "relation \"{}\".\"{}\" already exists",
                schema, name
            )));
        }
    }
    Ok(())
}

async fn out_of_line_index<H: RebuildHost + ?Sized>(host: &H, store: Oid) -> Result<Oid> {
    match host.out_of_line_indexes(store).await?.as_slice() {
        [index] => Ok(*index),
        other => Err(SqueezeError::internal(format!(
            "Unexpected number of out-of-line store indexes: {}",
            other.len()
        ))),
    }
}

/// Drop the transient shell, which now holds the old storage.
pub async fn drop_transient<H: RebuildHost + ?Sized>(
    host: &H,
    transient: &TransientTable,
) -> Result<()> {
    host.drop_relation(transient.relid).await?;
    debug!("Dropped transient relation {}", transient.relid);
    Ok(())
}

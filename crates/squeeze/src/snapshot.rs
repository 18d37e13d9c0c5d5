//! # Initial load
//!
//! Copies the source table as seen by the capture slot's historic view into
//! the transient table, then builds the transient indexes in one pass each.
//!
//! ## Strategies
//!
//! | Clustering index | Planner says        | Strategy    |
//! |------------------|---------------------|-------------|
//! | none             | -                   | `Unordered` |
//! | given            | index scan cheaper  | `IndexScan` |
//! | given            | sort cheaper        | `Sort`      |
//!
//! Out-of-line values are flattened while the row is read, because the view
//! only protects them for as long as the load runs.
//!
//! The sort keeps at most the memory ceiling worth of rows in memory: full
//! runs are sorted and spilled, then merged while the batches are filled.

use crate::error::{Result, SqueezeError};
use crate::fingerprint::CapturedRelation;
use crate::host::{HistoricView, Oid, RebuildHost, Row, ScanOrder, TransientTable, Value};
use crate::spill::SpillFile;
use crate::tablespace::TablespaceMapping;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tracing::{debug, info, warn};

/// Prefix of the transient table's name
pub const TRANSIENT_TABLE_PREFIX: &str = "tmp_";

/// Prefix of transient index names
pub const TRANSIENT_INDEX_PREFIX: &str = "ind_";

/// Slots in the first batch array.
const INITIAL_BATCH_SLOTS: usize = 1024;

const SLOT_SIZE: usize = std::mem::size_of::<Row>();

pub fn transient_table_name(source: Oid) -> String {
    format!("{}{}", TRANSIENT_TABLE_PREFIX, source)
}

pub fn transient_index_name(position: usize) -> String {
    format!("{}{}", TRANSIENT_INDEX_PREFIX, position)
}

/// How the initial load ordered the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    Unordered,
    IndexScan,
    Sort,
}

/// Outcome of the initial load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub strategy: LoadStrategy,
    pub rows: u64,
    pub batches: u64,
    /// Sorted runs the rows were merged from, 1 when the sort fit in memory
    pub sort_runs: usize,
    /// Most bytes the sort held in memory at once
    pub sort_memory_peak: usize,
}

/// Rows buffered for one bulk insert.
///
/// The slot array starts at [`INITIAL_BATCH_SLOTS`] and doubles while it stays
/// below a sixteenth of the memory ceiling; the batch is full once row data
/// plus the array reach the ceiling.
struct Batch {
    rows: Vec<Row>,
    slots: usize,
    data_size: usize,
    ceiling: usize,
}

impl Batch {
    fn new(ceiling: usize) -> Self {
        Self {
            rows: Vec::with_capacity(INITIAL_BATCH_SLOTS),
            slots: INITIAL_BATCH_SLOTS,
            data_size: 0,
            ceiling,
        }
    }

    fn push(&mut self, row: Row) {
        self.data_size += row.size();
        self.rows.push(row);
    }

    /// Whether another row may be added.
    fn has_room(&mut self) -> bool {
        if self.rows.len() >= self.slots {
            if self.slots * 2 * SLOT_SIZE < self.ceiling / 16 {
                self.slots *= 2;
                self.rows.reserve(self.slots - self.rows.len());
            } else {
                return false;
            }
        }
        self.data_size + self.slots * SLOT_SIZE < self.ceiling
    }

    fn take(&mut self) -> Vec<Row> {
        self.data_size = 0;
        std::mem::take(&mut self.rows)
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Sort by the clustering key within the memory ceiling.
///
/// Rows collect in a run until the next one would push the run past the
/// ceiling (the first row of a run is always accepted). A full run is sorted
/// and written to its own spill file; [`ClusterSort::finish`] merges the
/// runs.
struct ClusterSort {
    key: Vec<usize>,
    ceiling: usize,
    run: Vec<Row>,
    run_bytes: usize,
    runs: Vec<SpillFile<Row>>,
    peak_bytes: usize,
}

impl ClusterSort {
    fn new(key: Vec<usize>, ceiling: usize) -> Self {
        Self {
            key,
            ceiling,
            run: Vec::new(),
            run_bytes: 0,
            runs: Vec::new(),
            peak_bytes: 0,
        }
    }

    fn push(&mut self, row: Row) -> Result<()> {
        let size = row.size() + SLOT_SIZE;
        if !self.run.is_empty() && self.run_bytes + size > self.ceiling {
            self.spill_run()?;
        }
        self.run_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.run_bytes);
        self.run.push(row);
        Ok(())
    }

    fn spill_run(&mut self) -> Result<()> {
        sort_rows(&mut self.run, &self.key);
        let mut file = SpillFile::create()?;
        for row in self.run.drain(..) {
            file.append(&row)?;
        }
        debug!(
            "Spilled sort run {} ({} bytes)",
            self.runs.len(),
            self.run_bytes
        );
        self.run_bytes = 0;
        self.runs.push(file);
        Ok(())
    }

    fn finish(mut self) -> Result<SortedRows> {
        if self.runs.is_empty() {
            let mut rows = std::mem::take(&mut self.run);
            sort_rows(&mut rows, &self.key);
            return Ok(SortedRows::Memory(rows.into_iter()));
        }
        if !self.run.is_empty() {
            self.spill_run()?;
        }

        let mut heads = BinaryHeap::with_capacity(self.runs.len());
        for (run, file) in self.runs.iter_mut().enumerate() {
            if let Some(row) = file.read_next()? {
                heads.push(Reverse(MergeHead::new(row, run, &self.key)));
            }
        }
        debug!("Merging {} sorted runs", self.runs.len());
        Ok(SortedRows::Merge {
            runs: self.runs,
            heads,
            key: self.key,
        })
    }
}

/// Smallest unread row of one run.
struct MergeHead {
    key: Vec<Value>,
    run: usize,
    row: Row,
}

impl MergeHead {
    fn new(row: Row, run: usize, key: &[usize]) -> Self {
        let key = key
            .iter()
            .map(|&attnum| row.get(attnum).cloned().unwrap_or(Value::Null))
            .collect();
        Self { key, run, row }
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .iter()
            .zip(&other.key)
            .map(|(a, b)| compare_values(Some(a), Some(b)))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
            // earlier runs first keeps equal keys in scan order
            .then_with(|| self.run.cmp(&other.run))
    }
}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

/// Output of a [`ClusterSort`], in key order.
enum SortedRows {
    Memory(std::vec::IntoIter<Row>),
    Merge {
        runs: Vec<SpillFile<Row>>,
        heads: BinaryHeap<Reverse<MergeHead>>,
        key: Vec<usize>,
    },
}

impl SortedRows {
    fn runs(&self) -> usize {
        match self {
            Self::Memory(_) => 1,
            Self::Merge { runs, .. } => runs.len(),
        }
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        match self {
            Self::Memory(rows) => Ok(rows.next()),
            Self::Merge { runs, heads, key } => {
                let Some(Reverse(head)) = heads.pop() else {
                    return Ok(None);
                };
                if let Some(row) = runs[head.run].read_next()? {
                    heads.push(Reverse(MergeHead::new(row, head.run, key)));
                }
                Ok(Some(head.row))
            }
        }
    }
}

/// Create the transient table: same columns and storage options as the
/// source, with its own out-of-line store.
pub async fn create_transient_table<H: RebuildHost + ?Sized>(
    host: &H,
    relation: &CapturedRelation,
    tablespace: Oid,
) -> Result<TransientTable> {
    let name = transient_table_name(relation.relid());
    let transient = host
        .create_transient_table(&relation.class, &relation.attributes, &name, tablespace)
        .await?;
    debug!(
        "Created transient table {} ({}) for {}",
        name,
        transient.relid,
        relation.class.qualified_name()
    );
    Ok(transient)
}

/// Drop a transient table an abandoned rebuild of the same relation left.
pub async fn drop_lingering_transient<H: RebuildHost + ?Sized>(
    host: &H,
    relation: &CapturedRelation,
) -> Result<()> {
    let name = transient_table_name(relation.relid());
    if let Some(lingering) = host.relation_id(&relation.class.schema, &name).await? {
        warn!(
            "Dropping transient table {} ({}) left over by an earlier rebuild",
            name, lingering
        );
        host.drop_relation(lingering).await?;
    }
    Ok(())
}

/// Look up the clustering index by name in the source table's schema.
pub async fn resolve_clustering_index<H: RebuildHost + ?Sized>(
    host: &H,
    relation: &CapturedRelation,
    name: &str,
) -> Result<Oid> {
    let oid = host
        .relation_id(&relation.class.schema, name)
        .await?
        .ok_or_else(|| {
            SqueezeError::invalid_configuration(format!(
                "index \"{}\".\"{}\" does not exist",
                relation.class.schema, name
            ))
        })?;
    let index = relation.indexes.iter().find(|i| i.oid == oid).ok_or_else(|| {
        SqueezeError::invalid_configuration(format!(
            "\"{}\" is not an index for table {}",
            name,
            relation.class.qualified_name()
        ))
    })?;
    if !index.is_usable() {
        return Err(SqueezeError::invalid_configuration(format!(
            "cannot cluster on invalid index \"{}\"",
            name
        )));
    }
    Ok(oid)
}

/// Copy every row visible to `view` into the transient table.
pub async fn load<H: RebuildHost + ?Sized>(
    host: &H,
    relation: &CapturedRelation,
    view: &HistoricView,
    clustering_index: Option<Oid>,
    target: Oid,
    memory_ceiling: usize,
) -> Result<LoadStats> {
    let source = relation.relid();

    let strategy = match clustering_index {
        None => LoadStrategy::Unordered,
        Some(index) => {
            if host.sort_cheaper_than_index_scan(source, index).await? {
                LoadStrategy::Sort
            } else {
                LoadStrategy::IndexScan
            }
        }
    };
    info!(
        "Initial load of {} using {:?} strategy",
        relation.class.qualified_name(),
        strategy
    );

    let order = match (strategy, clustering_index) {
        (LoadStrategy::IndexScan, Some(index)) => ScanOrder::Index(index),
        _ => ScanOrder::Physical,
    };
    let mut scan = host.open_scan(source, view, order).await?;

    let mut stats = LoadStats {
        strategy,
        rows: 0,
        batches: 0,
        sort_runs: 0,
        sort_memory_peak: 0,
    };

    let mut sort = match (strategy, clustering_index) {
        (LoadStrategy::Sort, Some(oid)) => {
            let index = relation
                .indexes
                .iter()
                .find(|i| i.oid == oid)
                .ok_or_else(|| SqueezeError::internal("clustering index vanished during load"))?;
            Some(ClusterSort::new(index.key_columns.clone(), memory_ceiling))
        }
        _ => None,
    };
    let mut batch = Batch::new(memory_ceiling);

    while let Some(row) = scan.next_row().await? {
        let row = if row.has_external() {
            host.flatten(row, view).await?
        } else {
            row
        };
        stats.rows += 1;

        if let Some(sort) = sort.as_mut() {
            sort.push(row)?;
            continue;
        }

        batch.push(row);
        if !batch.has_room() {
            flush(host, target, &mut batch, &mut stats).await?;
        }
    }
    drop(scan);

    if let Some(sort) = sort {
        stats.sort_memory_peak = sort.peak_bytes;
        let mut sorted = sort.finish()?;
        stats.sort_runs = sorted.runs();
        while let Some(row) = sorted.next_row()? {
            batch.push(row);
            if !batch.has_room() {
                flush(host, target, &mut batch, &mut stats).await?;
            }
        }
    }

    if !batch.is_empty() {
        flush(host, target, &mut batch, &mut stats).await?;
    }

    info!(
        "Initial load copied {} rows in {} batches",
        stats.rows, stats.batches
    );
    Ok(stats)
}

async fn flush<H: RebuildHost + ?Sized>(
    host: &H,
    target: Oid,
    batch: &mut Batch,
    stats: &mut LoadStats,
) -> Result<()> {
    let rows = batch.take();
    debug!("Inserting batch of {} rows", rows.len());
    host.bulk_insert(target, rows).await?;
    stats.batches += 1;
    Ok(())
}

/// Order rows by the index key columns, NULLs last.
fn sort_rows(rows: &mut [Row], key: &[usize]) {
    rows.sort_by(|a, b| {
        key.iter()
            .map(|&attnum| compare_values(a.get(attnum), b.get(attnum)))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Greater,
        (_, Some(Value::Null) | None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Build one transient index per source index, in fingerprint order.
///
/// Returns the transient index identifiers aligned with
/// `relation.indexes`.
pub async fn build_indexes<H: RebuildHost + ?Sized>(
    host: &H,
    relation: &CapturedRelation,
    transient: Oid,
    mapping: &TablespaceMapping,
) -> Result<Vec<Oid>> {
    let mut built = Vec::with_capacity(relation.indexes.len());
    for (position, (index, descriptor)) in relation
        .indexes
        .iter()
        .zip(&relation.fingerprint.indexes)
        .enumerate()
    {
        let name = transient_index_name(position);
        let tablespace = mapping.index_tablespace(descriptor);
        let oid = host
            .create_index_like(index, transient, &name, tablespace)
            .await?;
        debug!("Built transient index {} ({}) like {}", name, oid, index.name);
        built.push(oid);
    }
    Ok(built)
}

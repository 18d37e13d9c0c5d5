//! Relation storage: heap files, index files and out-of-line value stores.
//!
//! Every file is addressed by file node, so swapping two relations' storage
//! is a matter of exchanging the file nodes in their class entries.

use crate::host::{TupleId, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Transaction identifier.
pub(crate) type Xid = u64;

/// Writes of the rebuilding session: committed the moment they happen and
/// never logged.
pub(crate) const FROZEN_XID: Xid = 2;

/// First identifier handed to client transactions.
pub(crate) const FIRST_NORMAL_XID: Xid = 3;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 8192;

/// One row version.
#[derive(Debug, Clone)]
pub(crate) struct Tuple {
    pub row: crate::host::Row,
    pub xmin: Xid,
    pub xmax: Option<Xid>,
    pub page: u32,
    pub size: usize,
}

/// A heap: row versions by tuple identifier, plus page accounting.
#[derive(Debug, Default, Clone)]
pub(crate) struct HeapFile {
    pub tuples: BTreeMap<TupleId, Tuple>,
    next_tid: u64,
    /// Bytes used per page
    pages: Vec<usize>,
    /// Free bytes per page, as of the last vacuum
    fsm: Option<Vec<usize>>,
}

impl HeapFile {
    /// Place a row version, filling pages up to `fillfactor` percent.
    pub fn insert(&mut self, row: crate::host::Row, xmin: Xid, fillfactor: u8) -> TupleId {
        let size = row.size();
        let capacity = PAGE_SIZE * fillfactor as usize / 100;
        let page = self.place(size, capacity);
        self.pages[page] += size;

        let tid = TupleId(self.next_tid);
        self.next_tid += 1;
        self.tuples.insert(
            tid,
            Tuple {
                row,
                xmin,
                xmax: None,
                page: page as u32,
                size,
            },
        );
        tid
    }

    fn place(&mut self, size: usize, capacity: usize) -> usize {
        if self.fsm.is_some() {
            if let Some(page) = self.pages.iter().position(|used| used + size <= capacity) {
                return page;
            }
        } else if let Some(used) = self.pages.last() {
            if used + size <= capacity {
                return self.pages.len() - 1;
            }
        }
        self.pages.push(0);
        self.pages.len() - 1
    }

    /// Remove a row version for good.
    pub fn remove(&mut self, tid: TupleId) -> Option<Tuple> {
        let tuple = self.tuples.remove(&tid)?;
        if let Some(used) = self.pages.get_mut(tuple.page as usize) {
            *used = used.saturating_sub(tuple.size);
        }
        Some(tuple)
    }

    /// Record the free space of every page.
    pub fn rebuild_fsm(&mut self) {
        self.fsm = Some(
            self.pages
                .iter()
                .map(|used| PAGE_SIZE.saturating_sub(*used))
                .collect(),
        );
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn has_fsm(&self) -> bool {
        self.fsm.is_some()
    }

    pub fn recorded_free_space(&self, page: u32) -> usize {
        self.fsm
            .as_ref()
            .and_then(|fsm| fsm.get(page as usize).copied())
            .unwrap_or(0)
    }

    /// First tuple after `after`, in physical order.
    pub fn next_after(&self, after: Option<TupleId>) -> Option<(TupleId, &Tuple)> {
        match after {
            None => self.tuples.iter().next(),
            Some(tid) => self
                .tuples
                .range((std::ops::Bound::Excluded(tid), std::ops::Bound::Unbounded))
                .next(),
        }
        .map(|(tid, tuple)| (*tid, tuple))
    }
}

/// Index key with NULLs sorting after every value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexKey(pub Vec<Value>);

impl IndexKey {
    pub fn has_null(&self) -> bool {
        self.0.iter().any(|v| matches!(v, Value::Null))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            let ord = match (a, b) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Null, _) => Ordering::Greater,
                (_, Value::Null) => Ordering::Less,
                (x, y) => x.cmp(y),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Index entries pointing into the heap of the indexed table. Entries of dead
/// row versions stay until vacuum; readers check the heap.
#[derive(Debug, Default, Clone)]
pub(crate) struct IndexFile {
    pub entries: BTreeMap<IndexKey, Vec<TupleId>>,
}

impl IndexFile {
    pub fn insert(&mut self, key: IndexKey, tid: TupleId) {
        self.entries.entry(key).or_default().push(tid);
    }

    pub fn get(&self, key: &IndexKey) -> &[TupleId] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tuple identifiers in key order.
    pub fn ordered(&self) -> Vec<TupleId> {
        self.entries.values().flatten().copied().collect()
    }

    pub fn remove_tid(&mut self, tid: TupleId) {
        self.entries.retain(|_, tids| {
            tids.retain(|t| *t != tid);
            !tids.is_empty()
        });
    }
}

/// Out-of-line values by identifier.
#[derive(Debug, Default, Clone)]
pub(crate) struct ValueStore {
    pub values: BTreeMap<u64, Value>,
    next_id: u64,
}

impl ValueStore {
    pub fn put(&mut self, value: Value) -> u64 {
        self.next_id += 1;
        self.values.insert(self.next_id, value);
        self.next_id
    }
}

/// Contents of one file node.
#[derive(Debug, Clone)]
pub(crate) enum Storage {
    Heap(HeapFile),
    Index(IndexFile),
    Values(ValueStore),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Row;

    fn row(id: i64) -> Row {
        Row::new(vec![Value::Int(id), Value::text("payload")])
    }

    #[test]
    fn test_pages_respect_fillfactor() {
        let mut heap = HeapFile::default();
        // 39 bytes per row: 210 fit a full page, 105 a half page
        for id in 0..210 {
            heap.insert(row(id), FROZEN_XID, 100);
        }
        assert_eq!(heap.page_count(), 1);

        let mut half = HeapFile::default();
        for id in 0..210 {
            half.insert(row(id), FROZEN_XID, 50);
        }
        assert_eq!(half.page_count(), 2);
    }

    #[test]
    fn test_fsm_after_removal() {
        let mut heap = HeapFile::default();
        let tids: Vec<TupleId> = (0..10).map(|id| heap.insert(row(id), FROZEN_XID, 100)).collect();
        assert!(!heap.has_fsm());
        assert_eq!(heap.recorded_free_space(0), 0);

        for tid in &tids[..5] {
            heap.remove(*tid);
        }
        heap.rebuild_fsm();
        assert_eq!(heap.recorded_free_space(0), PAGE_SIZE - 5 * 39);
        assert_eq!(heap.next_after(None).map(|(tid, _)| tid), Some(tids[5]));
        assert_eq!(heap.next_after(Some(tids[8])).map(|(tid, _)| tid), Some(tids[9]));
        assert!(heap.next_after(Some(tids[9])).is_none());
    }

    #[test]
    fn test_index_key_nulls_last() {
        let mut index = IndexFile::default();
        index.insert(IndexKey(vec![Value::Null]), TupleId(0));
        index.insert(IndexKey(vec![Value::Int(2)]), TupleId(1));
        index.insert(IndexKey(vec![Value::Int(1)]), TupleId(2));
        assert_eq!(index.ordered(), vec![TupleId(2), TupleId(1), TupleId(0)]);

        index.remove_tid(TupleId(1));
        assert!(index.get(&IndexKey(vec![Value::Int(2)])).is_empty());
    }
}

//! Property test: whatever the concurrent workload, the rebuilt table holds
//! exactly the rows a plain reader sees.
//!
//! Writes land at three points: before the capture slot exists, while rows
//! are copied, and between the backlog replay and the final merge. Every
//! committed write must end up in the result once; aborted ones never.

mod common;

use common::*;
use proptest::prelude::*;
use squeeze::host::{Oid, Row, Value};
use squeeze::memory::MemoryDatabase;
use squeeze::{RebuildPhase, RebuildRequest, Rebuilder, SqueezeConfig};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, String),
    Update(i64, String),
    ChangeKey(i64, i64),
    Delete(i64),
}

#[derive(Debug, Clone)]
struct Write {
    op: Op,
    abort: bool,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..16, "[a-z]{1,6}").prop_map(|(id, note)| Op::Insert(id, note)),
        (0i64..16, "[a-z]{1,6}").prop_map(|(id, note)| Op::Update(id, note)),
        (0i64..16, 0i64..16).prop_map(|(from, to)| Op::ChangeKey(from, to)),
        (0i64..16).prop_map(Op::Delete),
    ]
}

fn writes() -> impl Strategy<Value = Vec<Write>> {
    prop::collection::vec(
        (op_strategy(), prop::bool::weighted(0.15)).prop_map(|(op, abort)| Write { op, abort }),
        0..24,
    )
}

/// Expected table contents, kept next to the database.
type Model = BTreeMap<i64, String>;

/// Apply a write when it is valid against the model; invalid ones are skipped.
fn apply(db: &MemoryDatabase, relid: Oid, model: &mut Model, write: &Write) {
    let mut tx = db.begin();
    let mut next = model.clone();
    let result = match &write.op {
        Op::Insert(id, note) if !model.contains_key(id) => {
            next.insert(*id, note.clone());
            tx.insert(relid, vec![Value::Int(*id), Value::text(note.as_str())])
        }
        Op::Update(id, note) if model.contains_key(id) => {
            next.insert(*id, note.clone());
            tx.update(relid, &[Value::Int(*id)], vec![Value::Int(*id), Value::text(note.as_str())])
        }
        Op::ChangeKey(from, to) if model.contains_key(from) && !model.contains_key(to) => {
            let note = next.remove(from).unwrap();
            next.insert(*to, note.clone());
            tx.update(relid, &[Value::Int(*from)], vec![Value::Int(*to), Value::text(note)])
        }
        Op::Delete(id) if model.contains_key(id) => {
            next.remove(id);
            tx.delete(relid, &[Value::Int(*id)])
        }
        _ => return,
    };
    result.unwrap();
    if write.abort {
        tx.abort();
    } else {
        tx.commit().unwrap();
        *model = next;
    }
}

fn expected_rows(model: &Model) -> Vec<Row> {
    model.iter().map(|(id, note)| row(*id, note)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_every_committed_write_applied_once(
        before in writes(),
        during_load in writes(),
        before_merge in writes(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let db = MemoryDatabase::new();
        let relid = orders_table(&db);
        let model = Arc::new(parking_lot::Mutex::new(Model::new()));
        for write in &before {
            apply(&db, relid, &mut model.lock(), write);
        }

        let observer = {
            let db = db.clone();
            let model = model.clone();
            hook(move |phase| {
                let batch = match phase {
                    RebuildPhase::InitialLoadDone { .. } => &during_load,
                    RebuildPhase::BacklogReplayed { .. } => &before_merge,
                    _ => return,
                };
                let mut model = model.lock();
                for write in batch {
                    apply(&db, relid, &mut model, write);
                }
            })
        };

        let report = runtime
            .block_on(
                Rebuilder::new(db.session(), SqueezeConfig::default())
                    .with_observer(observer)
                    .rebuild(&RebuildRequest::new("public", "orders")),
            )
            .unwrap();

        prop_assert_eq!(report.relid, relid);
        prop_assert_eq!(db.rows(relid), expected_rows(&model.lock()));
        prop_assert!(db.slot_names().is_empty());
        prop_assert_eq!(db.relation_names("public"), vec!["orders", "orders_pkey"]);
    }
}

//! Shared fixtures for rebuild integration tests

#![allow(dead_code)]

use squeeze::host::{ColumnType, Oid, Row, Value};
use squeeze::memory::{MemoryDatabase, TableDef};
use squeeze::{RebuildObserver, RebuildPhase};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("squeeze=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// `"public"."orders" (id int primary key, note text)`
pub fn orders_table(db: &MemoryDatabase) -> Oid {
    db.create_table(
        TableDef::new("public", "orders")
            .column("id", ColumnType::Int)
            .column("note", ColumnType::Text)
            .primary_key(&["id"]),
    )
    .expect("Failed to create orders table")
}

pub fn row(id: i64, note: &str) -> Row {
    Row::new(vec![Value::Int(id), Value::text(note)])
}

pub fn insert(db: &MemoryDatabase, relid: Oid, id: i64, note: &str) {
    let mut tx = db.begin();
    tx.insert(relid, vec![Value::Int(id), Value::text(note)])
        .expect("insert failed");
    tx.commit().expect("commit failed");
}

pub fn insert_many(db: &MemoryDatabase, relid: Oid, ids: impl IntoIterator<Item = i64>) {
    let mut tx = db.begin();
    for id in ids {
        tx.insert(relid, vec![Value::Int(id), Value::text(format!("row {}", id))])
            .expect("insert failed");
    }
    tx.commit().expect("commit failed");
}

pub fn update(db: &MemoryDatabase, relid: Oid, id: i64, note: &str) {
    let mut tx = db.begin();
    tx.update(relid, &[Value::Int(id)], vec![Value::Int(id), Value::text(note)])
        .expect("update failed");
    tx.commit().expect("commit failed");
}

pub fn delete(db: &MemoryDatabase, relid: Oid, id: i64) {
    let mut tx = db.begin();
    tx.delete(relid, &[Value::Int(id)]).expect("delete failed");
    tx.commit().expect("commit failed");
}

/// Observer running a closure at every phase boundary.
pub struct PhaseHook<F>(pub F);

impl<F> RebuildObserver for PhaseHook<F>
where
    F: Fn(&RebuildPhase) + Send + Sync,
{
    fn on_phase(&self, phase: &RebuildPhase, _relid: Oid) {
        (self.0)(phase)
    }
}

pub fn hook<F>(f: F) -> Arc<dyn RebuildObserver>
where
    F: Fn(&RebuildPhase) + Send + Sync + 'static,
{
    Arc::new(PhaseHook(f))
}

/// Observer that only records the phases it saw.
#[derive(Default)]
pub struct PhaseLog {
    pub phases: parking_lot::Mutex<Vec<RebuildPhase>>,
}

impl RebuildObserver for PhaseLog {
    fn on_phase(&self, phase: &RebuildPhase, _relid: Oid) {
        self.phases.lock().push(phase.clone());
    }
}

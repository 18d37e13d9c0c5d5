//! # Online table rebuild
//!
//! Entry point tying the components together:
//!
//! ```text
//! fingerprint -> capture slot + transient table -> verify -> initial load
//!   -> verify -> index build -> backlog replay -> index validity check
//!   -> final merge (retried) -> swap -> cleanup
//! ```
//!
//! The source table is only share-locked while the fingerprint is taken and
//! while rows are copied and indexes built; it is locked exclusively only
//! inside the final merge. Whatever happens, the capture slot and the
//! transient table are gone when [`rebuild`] returns. A rebuild whose future
//! is dropped releases its locks at once; its slot and transient table are
//! dropped when the session next starts a rebuild.
//!
//! ## Example
//!
//! ```rust,ignore
//! use squeeze::{MemoryDatabase, RebuildRequest, Rebuilder, SqueezeConfig};
//!
//! let db = MemoryDatabase::new();
//! let rebuilder = Rebuilder::new(db.session(), SqueezeConfig::default());
//! let report = rebuilder
//!     .rebuild(&RebuildRequest::new("public", "orders").cluster_on("orders_created_idx"))
//!     .await?;
//! println!("copied {} rows", report.rows_copied);
//! ```

use crate::capture::ChangeCaptureSession;
use crate::config::SqueezeConfig;
use crate::error::{Result, SqueezeError};
use crate::fingerprint::{self, CapturedRelation};
use crate::host::{HeldLocks, LockMode, Oid, RebuildHost, TransientTable};
use crate::identity::RowIdentityKey;
use crate::merge::FinalMergeCoordinator;
use crate::replay::{ChangeReplayEngine, ReplayTarget};
use crate::snapshot::{self, LoadStrategy};
use crate::swap;
use crate::tablespace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What to rebuild and where to put it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildRequest {
    pub schema: String,
    pub table: String,
    /// Index (in the table's schema) whose order the rows are written in
    pub clustering_index: Option<String>,
    /// Tablespace for the rebuilt table, default: where it is now
    pub target_tablespace: Option<String>,
    /// `(index name, tablespace name)` overrides
    pub index_tablespaces: Vec<(String, String)>,
}

impl RebuildRequest {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn cluster_on(mut self, index: impl Into<String>) -> Self {
        self.clustering_index = Some(index.into());
        self
    }

    pub fn tablespace(mut self, tablespace: impl Into<String>) -> Self {
        self.target_tablespace = Some(tablespace.into());
        self
    }

    pub fn index_tablespace(mut self, index: impl Into<String>, tablespace: impl Into<String>) -> Self {
        self.index_tablespaces.push((index.into(), tablespace.into()));
        self
    }
}

/// Summary of a successful rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub relid: Oid,
    pub started_at: DateTime<Utc>,
    pub strategy: LoadStrategy,
    pub rows_copied: u64,
    pub changes_replayed: u64,
    pub merge_attempts: u32,
    pub exclusive_lock_held: Duration,
    pub elapsed: Duration,
}

/// Phase boundaries reported to a [`RebuildObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildPhase {
    /// Capture slot created; writes committed from now on are decoded
    CaptureStarted,
    InitialLoadDone { rows: u64 },
    IndexesBuilt { count: usize },
    /// Backlog accumulated during load and index build has been replayed
    BacklogReplayed { changes: u64 },
    ExclusiveLockAcquired { attempt: u32 },
    /// The lock budget ran out and the attempt gave the lock back
    ExclusiveLockReleased { attempt: u32 },
    Swapped,
    /// Reported on every exit path, successful or not
    CleanedUp,
}

/// Progress callback, invoked synchronously from the rebuilding task.
pub trait RebuildObserver: Send + Sync {
    fn on_phase(&self, phase: &RebuildPhase, relid: Oid);
}

/// Rebuilds tables of one host session.
pub struct Rebuilder<H> {
    host: H,
    config: SqueezeConfig,
    observer: Option<Arc<dyn RebuildObserver>>,
}

impl<H: RebuildHost> Rebuilder<H> {
    pub fn new(host: H, config: SqueezeConfig) -> Self {
        Self {
            host,
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RebuildObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &SqueezeConfig {
        &self.config
    }

    pub async fn rebuild(&self, request: &RebuildRequest) -> Result<RebuildReport> {
        rebuild(&self.host, &self.config, request, self.observer.as_deref()).await
    }
}

/// Resources that must not outlive the rebuild.
///
/// [`cleanup`] empties it on every path through [`rebuild`]. If the rebuild
/// future is dropped first, `Drop` gives the session's locks back; the slot
/// and the transient table are cleared by the next rebuild in the session.
struct RebuildResources<'h, H: RebuildHost + ?Sized> {
    host: &'h H,
    locks: HeldLocks,
    capture: Option<ChangeCaptureSession>,
    transient: Option<TransientTable>,
}

impl<'h, H: RebuildHost + ?Sized> RebuildResources<'h, H> {
    fn new(host: &'h H) -> Self {
        Self {
            host,
            locks: HeldLocks::new(),
            capture: None,
            transient: None,
        }
    }
}

impl<H: RebuildHost + ?Sized> Drop for RebuildResources<'_, H> {
    fn drop(&mut self) {
        if self.locks.is_empty() && self.capture.is_none() && self.transient.is_none() {
            return;
        }
        warn!(
            "Rebuild abandoned, releasing locks (slot: {:?}, transient relation: {:?})",
            self.capture.as_ref().map(|c| c.slot_name().to_string()),
            self.transient.map(|t| t.relid)
        );
        self.host.release_session_locks();
    }
}

/// Rebuild one table online.
///
/// Returns once the swap is done and the transient table dropped. On error
/// the source is left as it was.
pub async fn rebuild<H: RebuildHost + ?Sized>(
    host: &H,
    config: &SqueezeConfig,
    request: &RebuildRequest,
    observer: Option<&dyn RebuildObserver>,
) -> Result<RebuildReport> {
    let started = Instant::now();
    let started_at = Utc::now();
    info!("Rebuilding \"{}\".\"{}\"", request.schema, request.table);

    let mut resources = RebuildResources::new(host);
    let mut relid = None;
    let result = run(host, config, request, observer, &mut resources, &mut relid).await;

    cleanup(&mut resources).await;
    if let (Some(observer), Some(relid)) = (observer, relid) {
        observer.on_phase(&RebuildPhase::CleanedUp, relid);
    }

    match result {
        Ok(mut report) => {
            report.started_at = started_at;
            report.elapsed = started.elapsed();
            info!(
                "Rebuilt \"{}\".\"{}\": {} rows copied, {} changes replayed, {} merge attempts, exclusive lock held {:?}, took {:?}",
                request.schema,
                request.table,
                report.rows_copied,
                report.changes_replayed,
                report.merge_attempts,
                report.exclusive_lock_held,
                report.elapsed
            );
            Ok(report)
        }
        Err(e) => {
            error!(
                "Rebuild of \"{}\".\"{}\" failed: {}",
                request.schema, request.table, e
            );
            Err(e)
        }
    }
}

async fn run<H: RebuildHost + ?Sized>(
    host: &H,
    config: &SqueezeConfig,
    request: &RebuildRequest,
    observer: Option<&dyn RebuildObserver>,
    resources: &mut RebuildResources<'_, H>,
    relid_out: &mut Option<Oid>,
) -> Result<RebuildReport> {
    let RebuildResources {
        locks,
        capture: capture_slot,
        transient: transient_slot,
        ..
    } = resources;
    let notify = |phase: RebuildPhase, relid: Oid| {
        if let Some(observer) = observer {
            observer.on_phase(&phase, relid);
        }
    };
    let memory_ceiling = config.maintenance_work_mem;

    let relid = host
        .relation_id(&request.schema, &request.table)
        .await?
        .ok_or_else(|| {
            SqueezeError::RelationNotFound(format!(
                "relation \"{}\".\"{}\" does not exist",
                request.schema, request.table
            ))
        })?;
    *relid_out = Some(relid);

    // Everything checkable upfront is checked before the slot exists.
    locks.acquire(host, relid, LockMode::AccessShare).await?;
    let relation = fingerprint::capture(host, relid).await?;
    let mapping = tablespace::resolve(
        host,
        &relation,
        request.target_tablespace.as_deref(),
        &request.index_tablespaces,
    )
    .await?;
    let clustering_index = match &request.clustering_index {
        Some(name) => Some(snapshot::resolve_clustering_index(host, &relation, name).await?),
        None => None,
    };
    // Writers that started before the slot must not wait on us, or creating
    // the slot would wait on them in turn.
    locks.release(host, relid, LockMode::AccessShare).await?;

    let capture = capture_slot.insert(ChangeCaptureSession::open(host, relid, memory_ceiling).await?);
    notify(RebuildPhase::CaptureStarted, relid);

    // No other rebuild runs in this database while we hold the slot.
    snapshot::drop_lingering_transient(host, &relation).await?;
    let transient = *transient_slot.insert(
        snapshot::create_transient_table(host, &relation, mapping.table).await?,
    );

    locks.acquire(host, relid, LockMode::AccessShare).await?;
    fingerprint::verify(host, &relation.fingerprint, LockMode::NoLock).await?;

    let load = snapshot::load(
        host,
        &relation,
        capture.view(),
        clustering_index,
        transient.relid,
        memory_ceiling,
    )
    .await?;
    notify(RebuildPhase::InitialLoadDone { rows: load.rows }, relid);

    // Still share-locked since the last check.
    fingerprint::verify(host, &relation.fingerprint, LockMode::AccessShare).await?;

    let transient_indexes =
        snapshot::build_indexes(host, &relation, transient.relid, &mapping).await?;
    notify(
        RebuildPhase::IndexesBuilt {
            count: transient_indexes.len(),
        },
        relid,
    );

    let key = RowIdentityKey::build(host, &relation)?;
    locks.release(host, relid, LockMode::AccessShare).await?;

    let identity_index = transient_identity_index(&relation, &transient_indexes)?;
    let mut replay = ChangeReplayEngine::new(ReplayTarget {
        table: transient.relid,
        identity_index,
        key,
    });

    // Load and index build produced plenty of change log; decode it before
    // asking for the exclusive lock.
    host.flush().await?;
    let end = host.flush_position().await?;
    capture.decode_until(host, end, None).await?;
    let backlog = replay.apply(host, capture.buffer(), None).await?;
    notify(
        RebuildPhase::BacklogReplayed {
            changes: backlog.applied,
        },
        relid,
    );

    fingerprint::check_indexes_valid(host, relid).await?;

    let mut merge =
        FinalMergeCoordinator::new(&relation, config.lock_budget()).with_observer(observer);
    merge.run(host, locks, capture, &mut replay).await?;

    let source_indexes = relation.index_oids();
    swap::swap(host, relid, &transient, &source_indexes, &transient_indexes).await?;
    notify(RebuildPhase::Swapped, relid);

    if let Some(capture) = capture_slot.take() {
        capture.close(host).await?;
    }
    merge.release(host, locks).await?;
    let exclusive_lock_held = merge.exclusive_hold();

    // Outside the exclusive window; the shell is only visible to us.
    swap::drop_transient(host, &transient).await?;
    *transient_slot = None;

    Ok(RebuildReport {
        relid,
        started_at: Utc::now(),
        strategy: load.strategy,
        rows_copied: load.rows,
        changes_replayed: replay.stats().total(),
        merge_attempts: merge.attempts(),
        exclusive_lock_held,
        elapsed: Duration::ZERO,
    })
}

fn transient_identity_index(relation: &CapturedRelation, transient_indexes: &[Oid]) -> Result<Oid> {
    relation
        .indexes
        .iter()
        .position(|i| i.oid == relation.identity_index)
        .and_then(|pos| transient_indexes.get(pos).copied())
        .ok_or_else(|| SqueezeError::internal("Identity index missing on the transient relation"))
}

/// Release everything the rebuild still holds. Runs on every exit path.
async fn cleanup<H: RebuildHost + ?Sized>(resources: &mut RebuildResources<'_, H>) {
    let host = resources.host;
    resources.locks.release_all(host).await;

    if let Some(capture) = resources.capture.take() {
        let name = capture.slot_name().to_string();
        if let Err(e) = capture.close(host).await {
            warn!("Failed to drop capture slot {}: {}", name, e);
        }
    }

    if let Some(transient) = resources.transient.take() {
        match host.drop_relation(transient.relid).await {
            Ok(()) => debug!("Dropped transient relation {}", transient.relid),
            Err(e) => warn!(
                "Failed to drop transient relation {}: {}",
                transient.relid, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = RebuildRequest::new("public", "orders")
            .cluster_on("orders_created_idx")
            .tablespace("fast")
            .index_tablespace("orders_pkey", "fast");

        assert_eq!(request.schema, "public");
        assert_eq!(request.clustering_index.as_deref(), Some("orders_created_idx"));
        assert_eq!(request.target_tablespace.as_deref(), Some("fast"));
        assert_eq!(
            request.index_tablespaces,
            vec![("orders_pkey".to_string(), "fast".to_string())]
        );
    }

    #[test]
    fn test_report_serializes() {
        let report = RebuildReport {
            relid: 16384,
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            strategy: LoadStrategy::Sort,
            rows_copied: 3,
            changes_replayed: 2,
            merge_attempts: 1,
            exclusive_lock_held: Duration::from_millis(5),
            elapsed: Duration::from_secs(1),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["strategy"], "sort");
        assert_eq!(json["merge_attempts"], 1);
        assert_eq!(json["started_at"], "2023-11-14T22:13:20Z");
    }
}

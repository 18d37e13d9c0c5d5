//! # Change capture
//!
//! A capture session owns one ephemeral slot in the host's change log. The
//! slot is anchored at a consistent point and comes with a historic read view
//! fixed at that same point, which partitions every committed write into
//! exactly one of two sets:
//!
//! - committed before the consistent point: visible to the view, never decoded
//! - committed at or after it: invisible to the view, decoded exactly once
//!
//! The initial load reads through the view; everything else arrives here.
//!
//! ## Naming
//!
//! The slot name is derived from the database identifier, so a second rebuild
//! in the same database fails with `AlreadyActive` instead of sharing a slot.

mod buffer;
mod event;

pub use buffer::{ChangeBuffer, ChangeStream};
pub use event::{ChangeEvent, ChangeKind, ChangeOp};

use crate::error::{Result, SqueezeError};
use crate::host::{Catalog, CaptureSlot, ChangeLog, HistoricView, Lsn, Oid};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Prefix of capture slot names
pub const SLOT_NAME_PREFIX: &str = "squeeze_slot_";

/// Slot name for a database.
pub fn slot_name(database: Oid) -> String {
    format!("{}{}", SLOT_NAME_PREFIX, database)
}

/// How a decoding pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Everything up to the end marker is buffered
    Completed,
    /// The deadline passed first; what was decoded so far is buffered
    TimedOut,
}

/// An open capture session for one table.
#[derive(Debug)]
pub struct ChangeCaptureSession {
    slot: CaptureSlot,
    relid: Oid,
    buffer: ChangeBuffer,
    decoded: u64,
}

impl ChangeCaptureSession {
    /// Create the capture slot for `relid`.
    ///
    /// A slot this session still owns from an earlier, interrupted rebuild is
    /// dropped first.
    pub async fn open<H>(host: &H, relid: Oid, memory_ceiling: usize) -> Result<Self>
    where
        H: Catalog + ChangeLog + ?Sized,
    {
        if !host.has_replication_privilege().await? {
            return Err(SqueezeError::permission_denied(
                "must be superuser or replication role to capture changes",
            ));
        }

        if let Some(lingering) = host.lingering_slot().await? {
            warn!("Dropping capture slot {} left over by this session", lingering);
            host.drop_slot(&lingering).await?;
        }

        let name = slot_name(host.database_id());
        let slot = host.create_slot(&name).await?;
        info!(
            "Capture slot {} for relation {} consistent at {}",
            slot.name, relid, slot.consistent_point
        );

        Ok(Self {
            slot,
            relid,
            buffer: ChangeBuffer::new(memory_ceiling),
            decoded: 0,
        })
    }

    pub fn slot_name(&self) -> &str {
        &self.slot.name
    }

    pub fn consistent_point(&self) -> Lsn {
        self.slot.consistent_point
    }

    /// Read view matching the slot's consistent point.
    pub fn view(&self) -> &HistoricView {
        &self.slot.view
    }

    pub fn relid(&self) -> Oid {
        self.relid
    }

    /// Decode changes of transactions committed before `end` into the buffer.
    ///
    /// The deadline is checked between changes. On `TimedOut` the slot
    /// position is kept, so the next call continues where this one stopped.
    pub async fn decode_until<H: ChangeLog + ?Sized>(
        &mut self,
        host: &H,
        end: Lsn,
        deadline: Option<Instant>,
    ) -> Result<DecodeStatus> {
        let mut count = 0u64;
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(
                    "Decoding for {} timed out after {} changes",
                    self.slot.name, count
                );
                self.decoded += count;
                return Ok(DecodeStatus::TimedOut);
            }
            match host.decode_next(&self.slot.name, self.relid, end).await? {
                Some(change) => {
                    self.buffer.push(change.into())?;
                    count += 1;
                }
                None => break,
            }
        }
        self.decoded += count;
        if count > 0 {
            debug!("Decoded {} changes up to {}", count, end);
        }
        Ok(DecodeStatus::Completed)
    }

    /// Buffered events not yet replayed.
    pub fn buffer(&mut self) -> &mut ChangeBuffer {
        &mut self.buffer
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Changes decoded over the session's lifetime.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Drop the slot and discard anything still buffered.
    pub async fn close<H: ChangeLog + ?Sized>(self, host: &H) -> Result<()> {
        if !self.buffer.is_empty() {
            debug!(
                "Discarding {} buffered changes of {}",
                self.buffer.len(),
                self.slot.name
            );
        }
        host.drop_slot(&self.slot.name).await?;
        info!("Dropped capture slot {}", self.slot.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ColumnType, Row, Value};
    use crate::memory::{MemoryDatabase, TableDef};
    use std::time::Duration;

    fn table(db: &MemoryDatabase) -> Oid {
        db.create_table(
            TableDef::new("public", "t")
                .column("id", ColumnType::Int)
                .column("v", ColumnType::Text)
                .primary_key(&["id"]),
        )
        .unwrap()
    }

    fn insert(db: &MemoryDatabase, relid: Oid, id: i64) {
        let mut tx = db.begin();
        tx.insert(relid, vec![Value::Int(id), Value::text("v")]).unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_open_decode_close() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();
        insert(&db, relid, 1);

        let mut capture = ChangeCaptureSession::open(&session, relid, 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(capture.slot_name(), slot_name(db.database_id()));

        insert(&db, relid, 2);
        insert(&db, relid, 3);

        let end = session.flush().await.unwrap();
        let status = capture.decode_until(&session, end, None).await.unwrap();
        assert_eq!(status, DecodeStatus::Completed);
        assert_eq!(capture.pending(), 2);

        let events: Vec<ChangeEvent> = capture.buffer().drain().map(|e| e.unwrap()).collect();
        assert_eq!(
            events[0].kind,
            ChangeKind::Insert {
                new: Row::new(vec![Value::Int(2), Value::text("v")])
            }
        );

        capture.close(&session).await.unwrap();
        assert!(db.slot_names().is_empty());
    }

    #[tokio::test]
    async fn test_second_session_is_rejected() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let first = db.session();
        let second = db.session();

        let capture = ChangeCaptureSession::open(&first, relid, 1024).await.unwrap();
        let err = ChangeCaptureSession::open(&second, relid, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SqueezeError::AlreadyActive(_)));

        capture.close(&first).await.unwrap();
        let capture = ChangeCaptureSession::open(&second, relid, 1024).await.unwrap();
        capture.close(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_lingering_slot_is_replaced() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let session = db.session();

        let abandoned = ChangeCaptureSession::open(&session, relid, 1024).await.unwrap();
        std::mem::drop(abandoned);
        assert_eq!(db.slot_names().len(), 1);

        let capture = ChangeCaptureSession::open(&session, relid, 1024).await.unwrap();
        assert_eq!(db.slot_names().len(), 1);
        capture.close(&session).await.unwrap();
        assert!(db.slot_names().is_empty());
    }

    #[tokio::test]
    async fn test_requires_replication_privilege() {
        let db = MemoryDatabase::new();
        let relid = table(&db);
        let role = db.create_role("plain", false);
        let session = db.session_as(role);

        let err = ChangeCaptureSession::open(&session, relid, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SqueezeError::PermissionDenied(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_position() {
        let db = MemoryDatabase::new();
        db.set_decode_cost(Duration::from_millis(10));
        let relid = table(&db);
        let session = db.session();
        let mut capture = ChangeCaptureSession::open(&session, relid, 1024 * 1024)
            .await
            .unwrap();

        for id in 0..10 {
            insert(&db, relid, id);
        }
        let end = session.flush().await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(35);
        let status = capture
            .decode_until(&session, end, Some(deadline))
            .await
            .unwrap();
        assert_eq!(status, DecodeStatus::TimedOut);
        assert_eq!(capture.pending(), 4);

        let status = capture.decode_until(&session, end, None).await.unwrap();
        assert_eq!(status, DecodeStatus::Completed);
        assert_eq!(capture.pending(), 10);
        assert_eq!(capture.decoded(), 10);

        capture.close(&session).await.unwrap();
    }
}

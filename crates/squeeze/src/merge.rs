//! # Final merge
//!
//! The only phase that holds the source table exclusively. One attempt walks
//! this state machine:
//!
//! ```text
//! Idle -> LockAcquired -> Verified -> Draining -> Committed
//!                                             \-> Released
//! ```
//!
//! - `LockAcquired`: strongest lock on the table and on every index (index
//!   DDL does not need the table lock)
//! - `Verified`: fingerprint re-checked; the table was unlocked for a while,
//!   so a mismatch here fails the whole rebuild
//! - `Draining`: change log flushed, everything up to the flush position
//!   decoded and replayed against the lock budget's deadline
//! - `Committed`: backlog empty, locks still held for the swap
//! - `Released`: deadline hit; locks are released first, then the backlog up
//!   to the same end marker is drained without a deadline so the slot does
//!   not fall behind
//!
//! The caller retries a released attempt up to [`FINAL_MERGE_ATTEMPTS`] times.

use crate::capture::{ChangeCaptureSession, DecodeStatus};
use crate::error::{Result, SqueezeError};
use crate::fingerprint::{self, CapturedRelation};
use crate::host::{HeldLocks, LockMode, Oid, RebuildHost};
use crate::rebuild::{RebuildObserver, RebuildPhase};
use crate::replay::ChangeReplayEngine;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Attempts before the rebuild gives up on the lock budget.
pub const FINAL_MERGE_ATTEMPTS: u32 = 4;

/// Final-merge state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Idle,
    LockAcquired,
    Verified,
    Draining,
    Committed,
    Released,
}

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Committed,
    Released,
}

/// Drives the exclusive-lock phase of one rebuild.
pub struct FinalMergeCoordinator<'a> {
    relation: &'a CapturedRelation,
    lock_budget: Option<Duration>,
    observer: Option<&'a dyn RebuildObserver>,
    state: MergeState,
    attempts: u32,
    locked_at: Option<Instant>,
    exclusive_hold: Duration,
}

impl<'a> FinalMergeCoordinator<'a> {
    /// `lock_budget` of `None` lets the drain take as long as it needs.
    pub fn new(relation: &'a CapturedRelation, lock_budget: Option<Duration>) -> Self {
        Self {
            relation,
            lock_budget,
            observer: None,
            state: MergeState::Idle,
            attempts: 0,
            locked_at: None,
            exclusive_hold: Duration::ZERO,
        }
    }

    pub fn with_observer(mut self, observer: Option<&'a dyn RebuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Total time the exclusive locks were held, including the current hold.
    pub fn exclusive_hold(&self) -> Duration {
        self.exclusive_hold + self.locked_at.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn transition(&mut self, next: MergeState) {
        debug!(
            "Final merge of {}: {:?} -> {:?}",
            self.relation.relid(),
            self.state,
            next
        );
        self.state = next;
    }

    fn notify(&self, phase: RebuildPhase) {
        if let Some(observer) = self.observer {
            observer.on_phase(&phase, self.relation.relid());
        }
    }

    fn lock_targets(&self) -> Vec<Oid> {
        let mut targets = vec![self.relation.relid()];
        targets.extend(self.relation.index_oids());
        targets
    }

    /// Run attempts until one commits or the attempt budget is spent.
    ///
    /// On success the exclusive locks are still held.
    pub async fn run<H: RebuildHost + ?Sized>(
        &mut self,
        host: &H,
        locks: &mut HeldLocks,
        capture: &mut ChangeCaptureSession,
        replay: &mut ChangeReplayEngine,
    ) -> Result<()> {
        for _ in 0..FINAL_MERGE_ATTEMPTS {
            match self.attempt(host, locks, capture, replay).await? {
                AttemptOutcome::Committed => return Ok(()),
                AttemptOutcome::Released => debug!(
                    "Exclusive lock on table {} had to be released",
                    self.relation.relid()
                ),
            }
        }
        warn!(
            "Final merge of {} exceeded the lock budget {} times",
            self.relation.class.qualified_name(),
            FINAL_MERGE_ATTEMPTS
        );
        Err(SqueezeError::LockBudgetExceeded {
            attempts: FINAL_MERGE_ATTEMPTS,
        })
    }

    /// One pass through the state machine.
    pub async fn attempt<H: RebuildHost + ?Sized>(
        &mut self,
        host: &H,
        locks: &mut HeldLocks,
        capture: &mut ChangeCaptureSession,
        replay: &mut ChangeReplayEngine,
    ) -> Result<AttemptOutcome> {
        self.attempts += 1;
        let attempt = self.attempts;
        self.state = MergeState::Idle;

        // Idle -> LockAcquired
        for relid in self.lock_targets() {
            locks
                .acquire(host, relid, LockMode::AccessExclusive)
                .await?;
        }
        let locked_at = Instant::now();
        self.locked_at = Some(locked_at);
        let deadline = self.lock_budget.map(|budget| locked_at + budget);
        self.transition(MergeState::LockAcquired);
        self.notify(RebuildPhase::ExclusiveLockAcquired { attempt });

        // LockAcquired -> Verified. The table was unlocked since the last
        // check, hence NoLock.
        fingerprint::verify(host, &self.relation.fingerprint, LockMode::NoLock).await?;
        self.transition(MergeState::Verified);

        // Verified -> Draining
        let end = host.flush().await?;
        self.transition(MergeState::Draining);

        let mut drained =
            capture.decode_until(host, end, deadline).await? == DecodeStatus::Completed;
        if drained {
            drained = replay.apply(host, capture.buffer(), deadline).await?.completed;
        }

        if drained {
            self.transition(MergeState::Committed);
            info!(
                "Final merge of {} committed on attempt {}",
                self.relation.class.qualified_name(),
                attempt
            );
            return Ok(AttemptOutcome::Committed);
        }

        // Draining -> Released
        self.release(host, locks).await?;
        self.transition(MergeState::Released);
        self.notify(RebuildPhase::ExclusiveLockReleased { attempt });
        info!(
            "Lock budget of {:?} exceeded on attempt {}, lock released",
            self.lock_budget, attempt
        );

        capture.decode_until(host, end, None).await?;
        replay.apply(host, capture.buffer(), None).await?;
        Ok(AttemptOutcome::Released)
    }

    /// Release the exclusive locks taken by the current attempt.
    pub async fn release<H: RebuildHost + ?Sized>(
        &mut self,
        host: &H,
        locks: &mut HeldLocks,
    ) -> Result<()> {
        for relid in self.lock_targets().into_iter().rev() {
            locks
                .release(host, relid, LockMode::AccessExclusive)
                .await?;
        }
        if let Some(locked_at) = self.locked_at.take() {
            self.exclusive_hold += locked_at.elapsed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChangeCaptureSession;
    use crate::fingerprint::capture;
    use crate::host::{ColumnType, Row, Value};
    use crate::identity::RowIdentityKey;
    use crate::memory::{MemoryDatabase, MemorySession, TableDef};
    use crate::replay::ReplayTarget;

    struct Fixture {
        db: MemoryDatabase,
        session: MemorySession,
        relation: CapturedRelation,
        capture: ChangeCaptureSession,
        replay: ChangeReplayEngine,
        target: Oid,
    }

    /// Source table plus a hand-built target with the same key; enough to
    /// exercise locking and draining without the rest of a rebuild.
    async fn fixture() -> Fixture {
        let db = MemoryDatabase::new();
        let relid = db
            .create_table(
                TableDef::new("public", "src")
                    .column("id", ColumnType::Int)
                    .column("v", ColumnType::Text)
                    .primary_key(&["id"]),
            )
            .unwrap();
        let target = db
            .create_table(
                TableDef::new("public", "dst")
                    .column("id", ColumnType::Int)
                    .column("v", ColumnType::Text)
                    .primary_key(&["id"]),
            )
            .unwrap();
        let session = db.session();
        let relation = capture(&session, relid).await.unwrap();
        let target_relation = capture(&session, target).await.unwrap();
        let key = RowIdentityKey::build(&session, &relation).unwrap();
        let capture = ChangeCaptureSession::open(&session, relid, 1024 * 1024)
            .await
            .unwrap();
        let replay = ChangeReplayEngine::new(ReplayTarget {
            table: target,
            identity_index: target_relation.identity_index,
            key,
        });
        Fixture {
            db,
            session,
            relation,
            capture,
            replay,
            target,
        }
    }

    fn insert_rows(db: &MemoryDatabase, relid: Oid, ids: std::ops::Range<i64>) {
        let mut tx = db.begin();
        for id in ids {
            tx.insert(relid, vec![Value::Int(id), Value::text("v")]).unwrap();
        }
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_unbounded_attempt_commits_and_keeps_locks() {
        let mut f = fixture().await;
        insert_rows(&f.db, f.relation.relid(), 0..3);

        let mut locks = HeldLocks::new();
        let mut merge = FinalMergeCoordinator::new(&f.relation, None);
        merge
            .run(&f.session, &mut locks, &mut f.capture, &mut f.replay)
            .await
            .unwrap();

        assert_eq!(merge.state(), MergeState::Committed);
        assert_eq!(merge.attempts(), 1);
        assert!(locks.holds(f.relation.relid(), LockMode::AccessExclusive));
        assert_eq!(f.db.rows(f.target).len(), 3);

        merge.release(&f.session, &mut locks).await.unwrap();
        assert!(locks.is_empty());
        f.capture.close(&f.session).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exceeded_releases_then_drains() {
        let mut f = fixture().await;
        f.db.set_decode_cost(Duration::from_millis(10));
        insert_rows(&f.db, f.relation.relid(), 0..20);

        let mut locks = HeldLocks::new();
        let mut merge = FinalMergeCoordinator::new(&f.relation, Some(Duration::from_millis(50)));
        let outcome = merge
            .attempt(&f.session, &mut locks, &mut f.capture, &mut f.replay)
            .await
            .unwrap();

        assert_eq!(outcome, AttemptOutcome::Released);
        assert_eq!(merge.state(), MergeState::Released);
        assert!(locks.is_empty());
        // released within one decode step of the budget
        assert!(merge.exclusive_hold() <= Duration::from_millis(60));
        // backlog drained after the release
        assert_eq!(f.db.rows(f.target).len(), 20);
        assert_eq!(f.capture.pending(), 0);

        let outcome = merge
            .attempt(&f.session, &mut locks, &mut f.capture, &mut f.replay)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Committed);
        merge.release(&f.session, &mut locks).await.unwrap();
        f.capture.close(&f.session).await.unwrap();
    }

    #[tokio::test]
    async fn test_structural_change_under_lock_is_fatal() {
        let mut f = fixture().await;
        f.db.add_column(f.relation.relid(), "extra", ColumnType::Int)
            .unwrap();

        let mut locks = HeldLocks::new();
        let mut merge = FinalMergeCoordinator::new(&f.relation, None);
        let err = merge
            .run(&f.session, &mut locks, &mut f.capture, &mut f.replay)
            .await
            .unwrap_err();
        assert!(matches!(err, SqueezeError::ConcurrentStructuralChange(_)));
        assert_eq!(merge.attempts(), 1);

        locks.release_all(&f.session).await;
        f.capture.close(&f.session).await.unwrap();
    }

    #[tokio::test]
    async fn test_target_row_images_match_source() {
        let mut f = fixture().await;
        insert_rows(&f.db, f.relation.relid(), 0..2);

        let mut locks = HeldLocks::new();
        let mut merge = FinalMergeCoordinator::new(&f.relation, None);
        merge
            .run(&f.session, &mut locks, &mut f.capture, &mut f.replay)
            .await
            .unwrap();
        merge.release(&f.session, &mut locks).await.unwrap();

        assert_eq!(
            f.db.rows(f.target),
            vec![
                Row::new(vec![Value::Int(0), Value::text("v")]),
                Row::new(vec![Value::Int(1), Value::text("v")]),
            ]
        );
        f.capture.close(&f.session).await.unwrap();
    }
}

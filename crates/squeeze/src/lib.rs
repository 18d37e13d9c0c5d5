//! # squeeze
//!
//! Online table rebuild: rewrites a live table into fresh storage while
//! concurrent transactions keep reading and writing it, then swaps the new
//! storage in under a short exclusive lock.
//!
//! ## How it works
//!
//! 1. A [`fingerprint`] of the table's structural metadata is taken.
//! 2. A [`capture`] slot is created; its historic read view and its change
//!    stream partition every committed write exactly once.
//! 3. The [`snapshot`] loader copies the table as of the view into a
//!    transient table and builds its indexes.
//! 4. Changes committed meanwhile are [`replay`]ed by identity key.
//! 5. The [`merge`] coordinator drains the remaining backlog under an
//!    exclusive lock, within a time budget, retrying a few times.
//! 6. The storage of the two tables is [`swap`]ped and the transient shell
//!    dropped.
//!
//! A fingerprint mismatch at any checkpoint aborts the rebuild; the source
//! table is never modified before the swap.
//!
//! ## Hosts
//!
//! The engine runs against the traits in [`host`]. [`memory::MemoryDatabase`]
//! is a complete in-process implementation with MVCC visibility, a change log
//! and relation locks.
//!
//! ```rust,ignore
//! use squeeze::host::{ColumnType, Value};
//! use squeeze::memory::{MemoryDatabase, TableDef};
//! use squeeze::{RebuildRequest, Rebuilder, SqueezeConfig};
//!
//! let db = MemoryDatabase::new();
//! let relid = db.create_table(
//!     TableDef::new("public", "t")
//!         .column("id", ColumnType::Int)
//!         .column("v", ColumnType::Text)
//!         .primary_key(&["id"]),
//! )?;
//!
//! let rebuilder = Rebuilder::new(db.session(), SqueezeConfig::default());
//! let report = rebuilder.rebuild(&RebuildRequest::new("public", "t")).await?;
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod host;
pub mod identity;
pub mod memory;
pub mod merge;
pub mod rebuild;
pub mod replay;
pub mod snapshot;
mod spill;
pub mod stats;
pub mod swap;
pub mod tablespace;

pub use config::SqueezeConfig;
pub use error::{ErrorCategory, Result, SqueezeError};
pub use memory::MemoryDatabase;
pub use rebuild::{
    rebuild, RebuildObserver, RebuildPhase, RebuildReport, RebuildRequest, Rebuilder,
};
pub use stats::{heap_fill_factor, heap_free_space_ratio};

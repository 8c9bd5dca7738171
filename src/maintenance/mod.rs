//! Table maintenance: compaction (OPTIMIZE) and vacuum (§4.F).
//!
//! Both operations read the live file set through [`crate::read::TableRef`]
//! and write a single commit through [`crate::commit::retry::commit_with_retry`]
//! -- they are ordinary writers from the commit coordinator's point of view,
//! just ones whose `CommitBatch` is assembled by rewriting existing files
//! instead of by the WAL/batcher.

pub mod compact;
pub mod vacuum;

pub use compact::{compact, CompactOptions};
pub use vacuum::{vacuum, VacuumOptions};

/// Observability for both maintenance operations (SPEC_FULL §4.F): neither
/// has its own metrics system, but every call returns a plain report the
/// caller can log or surface however it likes.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MaintenanceReport {
    pub dry_run: bool,
    pub files_touched: usize,
    pub bytes_rewritten: u64,
    pub bytes_reclaimed: u64,
}

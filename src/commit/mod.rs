//! Commit coordination shared by both table dialects (§4.D, §4.D', §4.E).
//!
//! [`retry`] implements the dialect-agnostic optimistic-concurrency loop;
//! [`crate::iceberg`] and [`crate::delta`] each implement [`CommitDialect`]
//! to plug their manifest/log-writing into it.

pub mod retry;

use crate::columnar::ColumnStats;
use crate::error::DbResult;
use crate::value::Instant;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A file added by a commit (§3 "Data file", §4.D/§4.D').
#[derive(Debug, Clone)]
pub struct AddFile {
    pub path: String,
    pub size: u64,
    pub record_count: u64,
    pub stats: BTreeMap<String, ColumnStats>,
    pub data_change: bool,
}

/// A file logically removed by a commit. The blob itself is untouched until
/// vacuum (§4.F): "remove" only changes which files are *live*.
#[derive(Debug, Clone)]
pub struct RemoveFile {
    pub path: String,
    pub deletion_time: Instant,
    pub data_change: bool,
}

/// The operation name recorded in `commitInfo`/`operation` (§3, §4.D').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Delete,
    Update,
    Optimize,
    VacuumStart,
    VacuumEnd,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Write => "WRITE",
            Operation::Delete => "DELETE",
            Operation::Update => "UPDATE",
            Operation::Optimize => "OPTIMIZE",
            Operation::VacuumStart => "VACUUM_START",
            Operation::VacuumEnd => "VACUUM_END",
        }
    }
}

/// One batch of table changes to commit: adds, removes, and the operation
/// that produced them.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub adds: Vec<AddFile>,
    pub removes: Vec<RemoveFile>,
    pub operation: Option<Operation>,
}

/// Implemented once per table-format dialect. [`retry::commit_with_retry`]
/// drives this through the algorithm in §4.E: read current version, prepare
/// the next version's body, attempt a conditional create, retry on
/// conflict.
#[async_trait]
pub trait CommitDialect: Send + Sync {
    /// The table's current durable version, or `None` if the table has no
    /// commits yet.
    async fn current_version(&self) -> DbResult<Option<u64>>;

    /// The blob key the next commit must be conditionally created at.
    fn slot_path(&self, next_version: u64) -> String;

    /// Serialize the commit body for `next_version`, given the batch of
    /// changes and the version the writer observed when it started (used
    /// for `commitInfo.readVersion` in Delta and implicitly for Iceberg's
    /// snapshot parent pointer).
    async fn build_body(
        &self,
        next_version: u64,
        read_version: Option<u64>,
        batch: &CommitBatch,
    ) -> DbResult<Bytes>;

    /// Called after a commit slot write succeeds, to perform any follow-up
    /// bookkeeping the dialect needs (Delta checkpoints every 10 commits,
    /// Iceberg's version-pointer advance). Failures here do not unwind the
    /// commit -- it is already durable.
    async fn after_commit(&self, _version: u64, _batch: &CommitBatch) -> DbResult<()> {
        Ok(())
    }
}

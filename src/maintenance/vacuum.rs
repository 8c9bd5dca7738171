//! Vacuum: garbage-collecting unreferenced data files past a retention
//! horizon (§4.F).
//!
//! A file becomes a vacuum candidate once it has been *logically* removed by
//! some commit (compaction or a hard delete) -- it no longer appears in
//! [`TableRef::live_files`] for the current snapshot -- and its removal is
//! older than `retentionMs`. Files still live at the current snapshot are
//! never candidates, regardless of `retentionMs` (§4.F invariant).

use crate::blob::BlobStore;
use crate::error::DbResult;
use crate::maintenance::MaintenanceReport;
use crate::read::{TableFormat, TableRef};
use crate::value::Instant;
use std::collections::{HashMap, HashSet};
use tracing::info;

#[derive(Debug, Clone)]
pub struct VacuumOptions {
    pub retention_ms: i64,
    pub dry_run: bool,
}

/// Default retention: 7 days (§4.F).
pub const DEFAULT_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

impl Default for VacuumOptions {
    fn default() -> Self {
        VacuumOptions { retention_ms: DEFAULT_RETENTION_MS, dry_run: false }
    }
}

/// Walks the Iceberg snapshot history, returning every data file path that
/// was logically removed by some snapshot together with that snapshot's
/// timestamp -- Iceberg manifest entries don't carry a per-file deletion
/// timestamp, so the owning snapshot's `timestamp-ms` stands in for it (real
/// Iceberg GC uses the same approximation via `expire_snapshots`).
async fn iceberg_removed_files(blob: &dyn BlobStore, table_root: &str, current: u64) -> DbResult<HashMap<String, i64>> {
    let mut removed = HashMap::new();
    for version in 0..=current {
        let bytes = blob.read(&crate::iceberg::commit::metadata_path(table_root, version)).await?;
        let metadata: crate::iceberg::TableMetadata = serde_json::from_slice(&bytes)?;
        let Some(snapshot) = metadata.snapshot_at_version(version) else { continue };
        let manifest_list_bytes = blob.read(&snapshot.manifest_list).await?;
        let manifest_refs = crate::iceberg::manifest::read_manifest_list(&manifest_list_bytes)?;
        for manifest_ref in manifest_refs.iter().filter(|m| m.added_snapshot_id == snapshot.snapshot_id) {
            let manifest_bytes = blob.read(&manifest_ref.manifest_path).await?;
            for entry in crate::iceberg::manifest::read_manifest(&manifest_bytes)? {
                if matches!(entry.status, crate::iceberg::manifest::EntryStatus::Deleted) {
                    removed.insert(entry.data_file.path, snapshot.timestamp_ms);
                }
            }
        }
    }
    Ok(removed)
}

/// Walks Delta's `_delta_log` commits, returning every `remove` action's
/// path and its `deletionTimestamp` (ms).
async fn delta_removed_files(blob: &dyn BlobStore, table_root: &str, current: u64) -> DbResult<HashMap<String, i64>> {
    use crate::delta::actions::Action;
    use crate::delta::log;
    let mut removed = HashMap::new();
    for version in 0..=current {
        let Ok(bytes) = blob.read(&log::commit_path(table_root, version)).await else { continue };
        for action in log::decode_actions(&bytes)? {
            if let Action::Remove(r) = action {
                removed.insert(r.path, r.deletion_timestamp);
            }
        }
    }
    Ok(removed)
}

/// Deletes unreferenced data files past `retentionMs` (§4.F "Vacuum").
/// `dry_run` computes the candidate set and reports it without deleting
/// anything. Read-only handles reject vacuum upstream (`db::Snapshot`
/// structurally has no `vacuum` method); this function assumes it is only
/// ever called against a writable handle.
pub async fn vacuum(table: &TableRef, opts: &VacuumOptions) -> DbResult<MaintenanceReport> {
    let Some(current) = table.current_version().await? else {
        return Ok(MaintenanceReport { dry_run: opts.dry_run, ..Default::default() });
    };
    let live: HashSet<String> = table.live_files(current).await?.into_iter().map(|f| f.path).collect();

    let removed = match table.format {
        TableFormat::Iceberg => iceberg_removed_files(table.blob.as_ref(), &table.table_root, current).await?,
        TableFormat::Delta => delta_removed_files(table.blob.as_ref(), &table.table_root, current).await?,
    };

    let now_ms = Instant::now().as_micros() / 1000;
    let mut candidates: Vec<(String, u64)> = Vec::new();
    for (path, deletion_ms) in &removed {
        if live.contains(path) {
            continue; // never delete a file still referenced by the current snapshot
        }
        if now_ms - deletion_ms < opts.retention_ms {
            continue;
        }
        let size = table.blob.read(path).await.map(|b| b.len() as u64).unwrap_or(0);
        candidates.push((path.clone(), size));
    }

    let bytes_reclaimed: u64 = candidates.iter().map(|(_, size)| *size).sum();
    if opts.dry_run {
        return Ok(MaintenanceReport {
            dry_run: true,
            files_touched: candidates.len(),
            bytes_rewritten: 0,
            bytes_reclaimed,
        });
    }

    for (path, _) in &candidates {
        table.blob.delete(path).await?;
    }
    info!(count = candidates.len(), bytes_reclaimed, "vacuum deleted unreferenced files");

    Ok(MaintenanceReport {
        dry_run: false,
        files_touched: candidates.len(),
        bytes_rewritten: 0,
        bytes_reclaimed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{MemoryBlobStore, WriteOptions};
    use crate::cancel::CancellationToken;
    use crate::columnar::ColumnarWriter;
    use crate::commit::retry::{commit_with_retry, RetryConfig};
    use crate::commit::{AddFile, CommitBatch, Operation, RemoveFile};
    use crate::delta::DeltaDialect;
    use crate::entity::assemble_new;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn table_ref(blob: Arc<dyn BlobStore>, table_root: &str) -> TableRef {
        TableRef { blob, table_root: table_root.to_string(), format: TableFormat::Delta, column_kinds: BTreeMap::new() }
    }

    async fn add_one(blob: &Arc<dyn BlobStore>, dialect: &DeltaDialect, table_root: &str, name: &str) -> String {
        let entity = assemble_new("posts", "Post", serde_json::json!({"name": name}), Instant::from_micros(0)).unwrap();
        let encoded = crate::wal::encode_batch(&[&entity], &[]).unwrap();
        let path = format!("{table_root}/{}", ColumnarWriter::path_for(&encoded.bytes));
        blob.write(&path, encoded.bytes.clone(), WriteOptions::default()).await.unwrap();
        let mut batch = CommitBatch::default();
        batch.adds.push(AddFile { path: path.clone(), size: encoded.bytes.len() as u64, record_count: 1, stats: Default::default(), data_change: true });
        commit_with_retry(blob.as_ref(), dialect, batch, &RetryConfig::default(), &CancellationToken::new()).await.unwrap();
        path
    }

    #[tokio::test]
    async fn live_file_is_never_a_candidate_even_with_zero_retention() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let dialect = DeltaDialect::new(blob.clone(), "ns/posts", vec![]);
        add_one(&blob, &dialect, "ns/posts", "a").await;

        let table = table_ref(blob.clone(), "ns/posts");
        let report = vacuum(&table, &VacuumOptions { retention_ms: 0, dry_run: false }).await.unwrap();
        assert_eq!(report.files_touched, 0);
    }

    #[tokio::test]
    async fn removed_file_past_retention_is_deleted() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let dialect = DeltaDialect::new(blob.clone(), "ns/posts", vec![]);
        let path = add_one(&blob, &dialect, "ns/posts", "a").await;

        let mut remove_batch = CommitBatch::default();
        remove_batch.operation = Some(Operation::Delete);
        remove_batch.removes.push(RemoveFile { path: path.clone(), deletion_time: Instant::from_micros(0), data_change: true });
        commit_with_retry(blob.as_ref(), &dialect, remove_batch, &RetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        let table = table_ref(blob.clone(), "ns/posts");
        let report = vacuum(&table, &VacuumOptions { retention_ms: 0, dry_run: false }).await.unwrap();
        assert_eq!(report.files_touched, 1);
        assert!(blob.read(&path).await.is_err());
    }

    #[tokio::test]
    async fn removed_file_within_retention_survives() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let dialect = DeltaDialect::new(blob.clone(), "ns/posts", vec![]);
        let path = add_one(&blob, &dialect, "ns/posts", "a").await;

        let mut remove_batch = CommitBatch::default();
        remove_batch.operation = Some(Operation::Delete);
        remove_batch.removes.push(RemoveFile { path: path.clone(), deletion_time: Instant::now(), data_change: true });
        commit_with_retry(blob.as_ref(), &dialect, remove_batch, &RetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap();

        let table = table_ref(blob.clone(), "ns/posts");
        let report = vacuum(&table, &VacuumOptions::default()).await.unwrap();
        assert_eq!(report.files_touched, 0);
        assert!(blob.read(&path).await.is_ok());
    }
}

//! Compaction / OPTIMIZE (§4.F).
//!
//! Rewrites small data files into fewer, larger ones. The original files are
//! only *logically* removed -- a `remove` action, not a deleted blob -- so
//! time travel to a version preceding the compaction still resolves the
//! original files (§4.F invariant ii; vacuum is what eventually deletes the
//! bytes, §4.F "Vacuum").

use crate::blob::{BlobStore, WriteOptions};
use crate::cancel::CancellationToken;
use crate::columnar::{ColumnKind, ColumnarReader, ColumnarWriter};
use crate::commit::retry::{commit_with_retry, RetryConfig};
use crate::commit::{AddFile, CommitBatch, CommitDialect, Operation, RemoveFile};
use crate::entity::Entity;
use crate::error::DbResult;
use crate::maintenance::MaintenanceReport;
use crate::read::{ScanFile, TableFormat, TableRef};
use crate::value::Instant;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone)]
pub struct CompactOptions {
    pub target_file_size: u64,
    pub min_file_size: u64,
    pub max_files: usize,
    pub dry_run: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        CompactOptions {
            target_file_size: 128 << 20,
            min_file_size: 32 << 20,
            max_files: 100,
            dry_run: false,
        }
    }
}

/// Picks files smaller than `min_file_size`, smallest first (so the
/// compaction decision is monotonic in the "smaller files are preferred for
/// merging" direction the spec fixes; the exact boundary near `min_file_size`
/// is implementation-defined, §9 Open Questions), capped at `max_files`.
fn pick_candidates(files: &[ScanFile], opts: &CompactOptions) -> Vec<usize> {
    let mut indexed: Vec<(usize, &ScanFile)> = files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.size < opts.min_file_size)
        .collect();
    indexed.sort_by_key(|(_, f)| f.size);
    indexed.into_iter().take(opts.max_files).map(|(i, _)| i).collect()
}

/// Runs compaction for one table and commits the rewrite (§4.F). Returns a
/// [`MaintenanceReport`]; `dry_run` performs only the candidate-selection
/// step and reports counts without touching the blob store.
pub async fn compact(
    table: &TableRef,
    dialect: &dyn CommitDialect,
    column_kinds: &BTreeMap<String, ColumnKind>,
    opts: &CompactOptions,
) -> DbResult<MaintenanceReport> {
    let Some(version) = table.current_version().await? else {
        return Ok(MaintenanceReport { dry_run: opts.dry_run, ..Default::default() });
    };
    let files = table.live_files(version).await?;
    let candidate_idx = pick_candidates(&files, opts);
    if candidate_idx.is_empty() {
        return Ok(MaintenanceReport { dry_run: opts.dry_run, ..Default::default() });
    }
    let candidates: Vec<&ScanFile> = candidate_idx.iter().map(|&i| &files[i]).collect();
    let bytes_rewritten: u64 = candidates.iter().map(|f| f.size).sum();

    if opts.dry_run {
        return Ok(MaintenanceReport {
            dry_run: true,
            files_touched: candidates.len(),
            bytes_rewritten,
            bytes_reclaimed: 0,
        });
    }

    // Decode every candidate file in full (no projection, no filter -- the
    // row set must be preserved byte-for-byte in meaning, §4.F invariant i).
    let mut entities: Vec<Entity> = Vec::new();
    for file in &candidates {
        let bytes = table.blob.read(&file.path).await?;
        let footer = ColumnarReader::read_footer(&bytes)?;
        for row_group in &footer.row_groups {
            let decoded = ColumnarReader::decode_row_group(&bytes, row_group, &[])?;
            for i in 0..row_group.row_count as usize {
                let row: BTreeMap<String, Option<crate::value::Value>> =
                    decoded.iter().map(|(k, v)| (k.clone(), v[i].clone())).collect();
                entities.push(Entity::from_columns_row(&row)?);
            }
        }
    }

    let shredded_fields: Vec<(String, ColumnKind)> = column_kinds
        .iter()
        .filter(|(name, kind)| !matches!(kind, ColumnKind::Variant) && !crate::entity::RESERVED_FIELDS.contains(&name.as_str()))
        .map(|(name, kind)| (name.clone(), *kind))
        .collect();

    let refs: Vec<&Entity> = entities.iter().collect();
    let encoded = crate::wal::encode_batch(&refs, &shredded_fields)?;
    finish_compact(table, dialect, encoded.footer, encoded.bytes, candidates, version, opts).await
}

async fn finish_compact(
    table: &TableRef,
    dialect: &dyn CommitDialect,
    footer: crate::columnar::FileFooter,
    bytes: bytes::Bytes,
    candidates: Vec<&ScanFile>,
    read_version: u64,
    opts: &CompactOptions,
) -> DbResult<MaintenanceReport> {
    let path = format!("{}/{}", table.table_root, ColumnarWriter::path_for(&bytes));
    table.blob.write(&path, bytes.clone(), WriteOptions::default()).await?;

    let mut batch = CommitBatch::default();
    batch.operation = Some(Operation::Optimize);
    for file in &candidates {
        batch.removes.push(RemoveFile {
            path: file.path.clone(),
            deletion_time: Instant::now(),
            data_change: false,
        });
    }
    batch.adds.push(AddFile {
        path,
        size: bytes.len() as u64,
        record_count: footer.row_count,
        stats: footer.file_stats(),
        data_change: false,
    });

    let new_version = commit_with_retry(
        table.blob.as_ref(),
        dialect,
        batch,
        &RetryConfig::default(),
        &CancellationToken::new(),
    )
    .await?;
    info!(new_version, read_version, files = candidates.len(), "compaction committed");

    Ok(MaintenanceReport {
        dry_run: opts.dry_run,
        files_touched: candidates.len(),
        bytes_rewritten: candidates.iter().map(|f| f.size).sum(),
        bytes_reclaimed: 0, // nothing is deleted yet -- vacuum reclaims bytes later
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::commit::retry::{commit_with_retry, RetryConfig};
    use crate::delta::DeltaDialect;
    use crate::entity::assemble_new;
    use std::sync::Arc;

    async fn write_one(blob: Arc<dyn BlobStore>, table_root: &str, name: &str, age: i64) {
        let entity = assemble_new("posts", "Post", serde_json::json!({"name": name, "age": age}), Instant::from_micros(0)).unwrap();
        let encoded = crate::wal::encode_batch(&[&entity], &[("age".to_string(), ColumnKind::Int)]).unwrap();
        let path = format!("{table_root}/{}", ColumnarWriter::path_for(&encoded.bytes));
        blob.write(&path, encoded.bytes.clone(), WriteOptions::default()).await.unwrap();
        let mut batch = CommitBatch::default();
        batch.adds.push(AddFile {
            path,
            size: encoded.bytes.len() as u64,
            record_count: 1,
            stats: encoded.footer.file_stats(),
            data_change: true,
        });
        let dialect = DeltaDialect::new(blob.clone(), table_root, vec![("age".to_string(), "long".to_string())]);
        commit_with_retry(blob.as_ref(), &dialect, batch, &RetryConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
    }

    fn table_ref(blob: Arc<dyn BlobStore>, table_root: &str) -> TableRef {
        let mut kinds = BTreeMap::new();
        kinds.insert("age".to_string(), ColumnKind::Int);
        TableRef { blob, table_root: table_root.to_string(), format: TableFormat::Delta, column_kinds: kinds }
    }

    #[tokio::test]
    async fn compact_merges_small_files_into_one_commit() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        for i in 0..5 {
            write_one(blob.clone(), "ns/posts", &format!("p{i}"), i).await;
        }
        let table = table_ref(blob.clone(), "ns/posts");
        let dialect = DeltaDialect::new(blob.clone(), "ns/posts", vec![("age".to_string(), "long".to_string())]);
        let mut kinds = BTreeMap::new();
        kinds.insert("age".to_string(), ColumnKind::Int);
        let opts = CompactOptions { target_file_size: 1 << 20, min_file_size: 1 << 20, max_files: 100, dry_run: false };
        let report = compact(&table, &dialect, &kinds, &opts).await.unwrap();
        assert_eq!(report.files_touched, 5);

        let version_before = 4u64;
        let new_version = table.current_version().await.unwrap().unwrap();
        assert_eq!(new_version, version_before + 1);

        // row set unchanged after compaction
        let filter = crate::filter::Filter::MatchAll;
        let options = crate::read::ScanOptions {
            filter: &filter,
            shredded_paths: &[],
            projection: &[],
            skip: 0,
            limit: None,
            has_sort: false,
            include_deleted: false,
        };
        let (rows, _) = crate::read::scan(&table, new_version, &options).await.unwrap();
        assert_eq!(rows.len(), 5);

        // time travel to a pre-compaction version still sees the original files
        let (rows_before, _) = crate::read::scan(&table, version_before, &options).await.unwrap();
        assert_eq!(rows_before.len(), 5);
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        for i in 0..3 {
            write_one(blob.clone(), "ns/posts", &format!("p{i}"), i).await;
        }
        let table = table_ref(blob.clone(), "ns/posts");
        let dialect = DeltaDialect::new(blob.clone(), "ns/posts", vec![("age".to_string(), "long".to_string())]);
        let mut kinds = BTreeMap::new();
        kinds.insert("age".to_string(), ColumnKind::Int);
        let opts = CompactOptions { target_file_size: 1 << 20, min_file_size: 1 << 20, max_files: 100, dry_run: true };
        let report = compact(&table, &dialect, &kinds, &opts).await.unwrap();
        assert_eq!(report.files_touched, 3);
        assert_eq!(table.current_version().await.unwrap().unwrap(), 2); // unchanged
    }
}

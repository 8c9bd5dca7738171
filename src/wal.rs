//! Write-ahead log + batcher (§4.C).
//!
//! Per-record mutations are appended to an in-memory event buffer and
//! mirrored, durably, to the blob store under `{location}/_wal/{namespace}/`
//! so that a crash between appends and the next flush can be recovered by
//! replaying whatever wasn't yet folded into a committed snapshot. Once the
//! buffer crosses `MaxEvents`/`MaxBytes` (or a caller-driven bulk operation
//! meets `BulkThreshold`), the accumulated events are hashed into one data
//! file and handed to the commit coordinator as a single [`crate::commit::CommitBatch`].

use crate::entity::{Entity, EntityId};
use crate::error::DbResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Create,
    Update,
    Delete,
}

/// One buffered mutation. `before`/`after` carry full entity snapshots
/// rather than diffs -- the batcher only ever needs the post-mutation state
/// to encode a row, and `before` is kept for observability/debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEvent {
    pub seq: u64,
    pub op: WalOp,
    pub target: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Entity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Entity>,
}

impl WalEvent {
    fn approx_bytes(&self) -> usize {
        // A rough size estimate is enough to gate MaxBytes -- we aren't
        // trying to predict the exact encoded data-file size here, only to
        // avoid letting the buffer grow unbounded between flushes.
        let data_len = self.after.as_ref().map(|e| e.data.len()).unwrap_or(0);
        128 + data_len * 48
    }
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub max_events: usize,
    pub max_bytes: usize,
    pub bulk_threshold: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            max_events: 100,
            max_bytes: 8 << 20,
            bulk_threshold: 5,
        }
    }
}

/// The durable WAL plus the in-memory buffer the batcher drains on flush.
/// Owned exclusively by the writer task holding the namespace's write lock
/// (§5: "a single-writer discipline per namespace is REQUIRED").
pub struct Wal {
    blob: std::sync::Arc<dyn crate::blob::BlobStore>,
    location: String,
    namespace: String,
    config: WalConfig,
    buffer: Vec<WalEvent>,
    buffered_bytes: usize,
    next_seq: u64,
}

impl Wal {
    pub fn new(
        blob: std::sync::Arc<dyn crate::blob::BlobStore>,
        location: impl Into<String>,
        namespace: impl Into<String>,
        config: WalConfig,
    ) -> Self {
        Wal {
            blob,
            location: location.into(),
            namespace: namespace.into(),
            config,
            buffer: Vec::new(),
            buffered_bytes: 0,
            next_seq: 0,
        }
    }

    fn wal_prefix(&self) -> String {
        format!("{}/_wal/{}/", self.location, self.namespace)
    }

    fn wal_path(&self, seq: u64) -> String {
        format!("{}{seq:020}.json", self.wal_prefix())
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends one mutation, durably recording it in the blob-store WAL
    /// before returning (§4.C: "non-blocking" here means "no commit is
    /// synchronously performed", not "doesn't touch storage" -- the WAL
    /// write is this operation's actual durability boundary). Returns
    /// whether the caller should flush now.
    pub async fn append(&mut self, event: WalEvent) -> DbResult<bool> {
        let path = self.wal_path(event.seq);
        let bytes = Bytes::from(serde_json::to_vec(&event)?);
        self.blob
            .write(&path, bytes, crate::blob::WriteOptions::default())
            .await?;
        self.buffered_bytes += event.approx_bytes();
        self.next_seq = self.next_seq.max(event.seq + 1);
        debug!(seq = event.seq, namespace = %self.namespace, "wal append");
        self.buffer.push(event);
        Ok(self.buffer.len() >= self.config.max_events || self.buffered_bytes >= self.config.max_bytes)
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Whether a caller-supplied batch of this size should bypass the event
    /// buffer entirely and go through the bulk path (§4.C, invariant: O(1)
    /// commits/writes regardless of N).
    pub fn is_bulk(&self, count: usize) -> bool {
        count >= self.config.bulk_threshold
    }

    /// Drains the buffer (for a flush) and clears the durable WAL entries
    /// that are now superseded by the resulting commit.
    pub async fn drain(&mut self) -> DbResult<Vec<WalEvent>> {
        let events = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;
        for event in &events {
            self.blob.delete(&self.wal_path(event.seq)).await?;
        }
        if !events.is_empty() {
            info!(namespace = %self.namespace, count = events.len(), "wal flush");
        }
        Ok(events)
    }

    /// Crash recovery (§4.C): list whatever WAL entries were never cleared
    /// by a successful flush and fold them back into the in-memory buffer so
    /// the next flush picks them up.
    pub async fn replay(&mut self) -> DbResult<usize> {
        let listing = self.blob.list(&self.wal_prefix()).await?;
        let mut recovered = Vec::with_capacity(listing.keys.len());
        for key in &listing.keys {
            let bytes = self.blob.read(key).await?;
            let event: WalEvent = serde_json::from_slice(&bytes)?;
            recovered.push(event);
        }
        recovered.sort_by_key(|e| e.seq);
        let count = recovered.len();
        for event in &recovered {
            self.buffered_bytes += event.approx_bytes();
            self.next_seq = self.next_seq.max(event.seq + 1);
        }
        self.buffer = recovered;
        Ok(count)
    }
}

/// Encodes a batch of entities (one row per entity, current state only --
/// the batcher doesn't emit one row per WAL event) into a
/// [`crate::columnar::EncodedFile`] using the namespace's shredded-field set.
pub fn encode_batch(
    entities: &[&Entity],
    shredded_fields: &[(String, crate::columnar::ColumnKind)],
) -> DbResult<crate::columnar::EncodedFile> {
    use crate::columnar::{ColumnInput, ColumnKind, ColumnarWriter};
    use crate::entity::{
        FIELD_CREATED_AT, FIELD_DATA, FIELD_DELETED_AT, FIELD_ID, FIELD_NAME, FIELD_TYPE, FIELD_UPDATED_AT, FIELD_VERSION,
    };
    use crate::value::Value;

    let mut columns: Vec<ColumnInput> = vec![
        ColumnInput { name: FIELD_ID.into(), kind: ColumnKind::String, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_TYPE.into(), kind: ColumnKind::String, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_NAME.into(), kind: ColumnKind::String, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_VERSION.into(), kind: ColumnKind::Int, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_CREATED_AT.into(), kind: ColumnKind::Instant, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_UPDATED_AT.into(), kind: ColumnKind::Instant, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_DELETED_AT.into(), kind: ColumnKind::Instant, values: Vec::with_capacity(entities.len()) },
        ColumnInput { name: FIELD_DATA.into(), kind: ColumnKind::Variant, values: Vec::with_capacity(entities.len()) },
    ];
    for (name, kind) in shredded_fields {
        columns.push(ColumnInput { name: name.clone(), kind: *kind, values: Vec::with_capacity(entities.len()) });
    }

    for entity in entities {
        let row = entity.to_columns_row();
        for (name, value) in row {
            if let Some(col) = columns.iter_mut().find(|c| c.name == name) {
                col.values.push(value);
            }
        }
        for (name, _) in shredded_fields {
            let path: Vec<&str> = name.split('.').collect();
            let shredded = entity.data.get(path[0]).and_then(|v| {
                if path.len() == 1 {
                    Some(v.clone())
                } else {
                    v.get_path(&path[1..]).cloned()
                }
            });
            if let Some(col) = columns.iter_mut().find(|c| &c.name == name) {
                col.values.push(shredded.filter(|v| !matches!(v, Value::Null)));
            }
        }
    }

    ColumnarWriter::default().encode(entities.len(), columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::entity::assemble_new;
    use crate::value::Instant;
    use std::sync::Arc;

    fn sample_event(seq: u64) -> WalEvent {
        let entity = assemble_new("posts", "Post", serde_json::json!({"name": "hi"}), Instant::from_micros(0)).unwrap();
        WalEvent { seq, op: WalOp::Create, target: entity.id.clone(), before: None, after: Some(entity) }
    }

    #[tokio::test]
    async fn append_flags_flush_at_max_events() {
        let blob: Arc<dyn crate::blob::BlobStore> = Arc::new(MemoryBlobStore::new());
        let mut wal = Wal::new(blob, "db", "posts", WalConfig { max_events: 2, max_bytes: usize::MAX, bulk_threshold: 5 });
        assert!(!wal.append(sample_event(0)).await.unwrap());
        assert!(wal.append(sample_event(1)).await.unwrap());
    }

    #[tokio::test]
    async fn drain_clears_durable_entries() {
        let blob: Arc<dyn crate::blob::BlobStore> = Arc::new(MemoryBlobStore::new());
        let mut wal = Wal::new(blob.clone(), "db", "posts", WalConfig::default());
        wal.append(sample_event(0)).await.unwrap();
        let drained = wal.drain().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(wal.is_empty());
        let listing = blob.list("db/_wal/posts/").await.unwrap();
        assert!(listing.keys.is_empty());
    }

    #[tokio::test]
    async fn replay_recovers_unflushed_entries_after_restart() {
        let blob: Arc<dyn crate::blob::BlobStore> = Arc::new(MemoryBlobStore::new());
        {
            let mut wal = Wal::new(blob.clone(), "db", "posts", WalConfig::default());
            wal.append(sample_event(0)).await.unwrap();
            wal.append(sample_event(1)).await.unwrap();
            // no drain -- simulate a crash before flush
        }
        let mut recovered_wal = Wal::new(blob, "db", "posts", WalConfig::default());
        let count = recovered_wal.replay().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(recovered_wal.len(), 2);
    }

    #[test]
    fn bulk_threshold_gates_bulk_path() {
        let blob: Arc<dyn crate::blob::BlobStore> = Arc::new(MemoryBlobStore::new());
        let wal = Wal::new(blob, "db", "posts", WalConfig::default());
        assert!(!wal.is_bulk(4));
        assert!(wal.is_bulk(5));
    }

    #[test]
    fn encode_batch_produces_one_row_group_file() {
        let e1 = assemble_new("posts", "Post", serde_json::json!({"name": "a", "age": 1}), Instant::from_micros(0)).unwrap();
        let e2 = assemble_new("posts", "Post", serde_json::json!({"name": "b", "age": 2}), Instant::from_micros(0)).unwrap();
        let encoded = encode_batch(&[&e1, &e2], &[("age".to_string(), crate::columnar::ColumnKind::Int)]).unwrap();
        assert_eq!(encoded.footer.row_count, 2);
        let age_col = &encoded.footer.row_groups[0].columns.iter().find(|c| c.name == "age").unwrap();
        assert_eq!(age_col.stats.min, Some(crate::value::Value::Int(1)));
    }
}

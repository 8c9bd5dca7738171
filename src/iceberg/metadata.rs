//! Iceberg `v{N}.metadata.json` table metadata (§4.D, SPEC_FULL §4.D).
//!
//! Shaped after the real `format-version = 2` table metadata JSON (grounded
//! in the `oliverdaff-iceberg-rs` model), trimmed to the fields this engine
//! actually populates: schema list, partition spec, snapshot list/log, and
//! the table properties map.

use crate::value::Instant;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaField {
    #[serde(rename = "id")]
    pub field_id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    #[serde(rename = "schema-id")]
    pub schema_id: i32,
    pub fields: Vec<SchemaField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PartitionSpec {
    #[serde(rename = "spec-id")]
    pub spec_id: i32,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotLogEntry {
    #[serde(rename = "timestamp-ms")]
    pub timestamp_ms: i64,
    #[serde(rename = "snapshot-id")]
    pub snapshot_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    #[serde(rename = "snapshot-id")]
    pub snapshot_id: i64,
    #[serde(rename = "parent-snapshot-id", skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    #[serde(rename = "sequence-number")]
    pub sequence_number: i64,
    #[serde(rename = "timestamp-ms")]
    pub timestamp_ms: i64,
    #[serde(rename = "manifest-list")]
    pub manifest_list: String,
    pub summary: SnapshotSummary,
    #[serde(rename = "schema-id")]
    pub schema_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    pub format_version: i32,
    pub table_uuid: String,
    pub location: String,
    pub last_sequence_number: i64,
    pub last_updated_ms: i64,
    pub last_column_id: i32,
    pub schemas: Vec<Schema>,
    pub current_schema_id: i32,
    pub partition_specs: Vec<PartitionSpec>,
    pub default_spec_id: i32,
    pub last_partition_id: i32,
    pub properties: HashMap<String, String>,
    pub current_snapshot_id: Option<i64>,
    pub snapshots: Vec<SnapshotEntry>,
    pub snapshot_log: Vec<SnapshotLogEntry>,
}

impl TableMetadata {
    pub fn new_empty(location: impl Into<String>, now: Instant) -> Self {
        TableMetadata {
            format_version: 2,
            table_uuid: uuid::Uuid::new_v4().to_string(),
            location: location.into(),
            last_sequence_number: 0,
            last_updated_ms: now.as_micros() / 1000,
            last_column_id: 0,
            schemas: vec![Schema { schema_id: 0, fields: vec![] }],
            current_schema_id: 0,
            partition_specs: vec![PartitionSpec::default()],
            default_spec_id: 0,
            last_partition_id: 999,
            properties: HashMap::new(),
            current_snapshot_id: None,
            snapshots: vec![],
            snapshot_log: vec![],
        }
    }

    /// Append-only schema evolution (§3): new fields get fresh field ids;
    /// existing fields are never removed or retyped here.
    pub fn evolve_schema(&mut self, observed_fields: &[(&str, &str)]) {
        let schema = self.schemas.last().expect("schemas is never empty");
        let mut fields = schema.fields.clone();
        let mut next_id = self.last_column_id;
        let mut changed = false;
        for (name, logical_type) in observed_fields {
            if !fields.iter().any(|f| f.name == *name) {
                next_id += 1;
                fields.push(SchemaField {
                    field_id: next_id,
                    name: name.to_string(),
                    logical_type: logical_type.to_string(),
                    required: false,
                });
                changed = true;
            }
        }
        if changed {
            let schema_id = self.schemas.len() as i32;
            self.schemas.push(Schema { schema_id, fields });
            self.current_schema_id = schema_id;
            self.last_column_id = next_id;
        }
    }

    pub fn record_snapshot(&mut self, entry: SnapshotEntry, now: Instant) {
        self.last_sequence_number = entry.sequence_number;
        self.current_snapshot_id = Some(entry.snapshot_id);
        self.snapshot_log.push(SnapshotLogEntry {
            timestamp_ms: now.as_micros() / 1000,
            snapshot_id: entry.snapshot_id,
        });
        self.snapshots.push(entry);
        self.last_updated_ms = now.as_micros() / 1000;
    }

    pub fn snapshot_at_version(&self, version: u64) -> Option<&SnapshotEntry> {
        self.snapshots.get(version as usize)
    }

    /// Resolve the snapshot whose commit timestamp is the latest one `<=
    /// at`, for time-travel-by-timestamp (§4.G step 1).
    pub fn snapshot_as_of(&self, at: Instant) -> Option<&SnapshotEntry> {
        let at_ms = at.as_micros() / 1000;
        self.snapshots.iter().filter(|s| s.timestamp_ms <= at_ms).last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_evolution_is_append_only() {
        let mut metadata = TableMetadata::new_empty("mem://t", Instant::from_micros(0));
        metadata.evolve_schema(&[("name", "string"), ("age", "long")]);
        assert_eq!(metadata.schemas.len(), 2);
        metadata.evolve_schema(&[("name", "string")]); // no new fields
        assert_eq!(metadata.schemas.len(), 2);
        metadata.evolve_schema(&[("nickname", "string")]);
        assert_eq!(metadata.schemas.len(), 3);
        let ids: Vec<_> = metadata.schemas.last().unwrap().fields.iter().map(|f| f.field_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn snapshot_log_is_gap_free_by_version_index() {
        let mut metadata = TableMetadata::new_empty("mem://t", Instant::from_micros(0));
        for i in 0..3 {
            metadata.record_snapshot(
                SnapshotEntry {
                    snapshot_id: i,
                    parent_snapshot_id: if i == 0 { None } else { Some(i - 1) },
                    sequence_number: i,
                    timestamp_ms: i * 1000,
                    manifest_list: format!("snap-{i}.avro"),
                    summary: SnapshotSummary { operation: "WRITE".into() },
                    schema_id: 0,
                },
                Instant::from_micros(i * 1_000_000),
            );
        }
        assert_eq!(metadata.snapshot_at_version(1).unwrap().snapshot_id, 1);
        assert_eq!(metadata.current_snapshot_id, Some(2));
    }
}

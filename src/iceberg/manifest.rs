//! Avro-encoded manifest and manifest-list files (§4.D).
//!
//! Binary compatibility is load-bearing: external engines (Spark, DuckDB,
//! Snowflake) open these files expecting the Avro object-container magic
//! `0x4F 0x62 0x6A 0x01` and schemas literally named `manifest_entry` and
//! `manifest_file`. `apache_avro`'s `Writer` produces a standard object
//! container file, so the magic comes for free; we're responsible for the
//! schema names and required fields.

use crate::columnar::{encode_bound, ColumnKind, ColumnStats};
use crate::error::{DbResult, Error};
use apache_avro::types::Value as AvroValue;
use apache_avro::{Reader, Schema, Writer};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const MANIFEST_ENTRY_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "manifest_entry",
  "fields": [
    {"name": "status", "type": "int"},
    {"name": "snapshot_id", "type": "long"},
    {"name": "sequence_number", "type": "long"},
    {"name": "file_sequence_number", "type": "long"},
    {"name": "data_file", "type": {
      "type": "record",
      "name": "data_file",
      "fields": [
        {"name": "path", "type": "string"},
        {"name": "format", "type": "string"},
        {"name": "partition", "type": {"type": "map", "values": "string"}},
        {"name": "record_count", "type": "long"},
        {"name": "file_size_in_bytes", "type": "long"},
        {"name": "lower_bounds", "type": {"type": "map", "values": "bytes"}},
        {"name": "upper_bounds", "type": {"type": "map", "values": "bytes"}}
      ]
    }}
  ]
}
"#;

pub const MANIFEST_FILE_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "manifest_file",
  "fields": [
    {"name": "manifest_path", "type": "string"},
    {"name": "manifest_length", "type": "long"},
    {"name": "partition_spec_id", "type": "int"},
    {"name": "added_snapshot_id", "type": "long"}
  ]
}
"#;

static ENTRY_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(MANIFEST_ENTRY_SCHEMA).expect("manifest_entry schema is valid"));
static FILE_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(MANIFEST_FILE_SCHEMA).expect("manifest_file schema is valid"));

/// `status` values from the Iceberg manifest-entry spec: 0 = EXISTING,
/// 1 = ADDED, 2 = DELETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Existing = 0,
    Added = 1,
    Deleted = 2,
}

#[derive(Debug, Clone)]
pub struct DataFile {
    pub path: String,
    pub format: String,
    pub record_count: i64,
    pub file_size_in_bytes: i64,
    /// Column name -> raw bound bytes (§4.B bound encoding).
    pub lower_bounds: BTreeMap<String, Vec<u8>>,
    pub upper_bounds: BTreeMap<String, Vec<u8>>,
}

impl DataFile {
    pub fn from_add(path: String, size: u64, record_count: i64, stats: &BTreeMap<String, ColumnStats>, kinds: &BTreeMap<String, ColumnKind>) -> Self {
        let mut lower_bounds = BTreeMap::new();
        let mut upper_bounds = BTreeMap::new();
        for (name, stat) in stats {
            let Some(kind) = kinds.get(name).copied() else { continue };
            if matches!(kind, ColumnKind::Variant) {
                continue;
            }
            if let Some(min) = &stat.min {
                lower_bounds.insert(name.clone(), encode_bound(kind, min));
            }
            if let Some(max) = &stat.max {
                upper_bounds.insert(name.clone(), encode_bound(kind, max));
            }
        }
        DataFile {
            path,
            format: "PARQUET".to_string(),
            record_count,
            file_size_in_bytes: size as i64,
            lower_bounds,
            upper_bounds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub status: EntryStatus,
    pub snapshot_id: i64,
    pub sequence_number: i64,
    pub file_sequence_number: i64,
    pub data_file: DataFile,
}

fn bytes_map_to_avro(map: &BTreeMap<String, Vec<u8>>) -> AvroValue {
    AvroValue::Map(map.iter().map(|(k, v)| (k.clone(), AvroValue::Bytes(v.clone()))).collect())
}

fn entry_to_avro(entry: &ManifestEntry) -> AvroValue {
    AvroValue::Record(vec![
        ("status".to_string(), AvroValue::Int(entry.status as i32)),
        ("snapshot_id".to_string(), AvroValue::Long(entry.snapshot_id)),
        ("sequence_number".to_string(), AvroValue::Long(entry.sequence_number)),
        ("file_sequence_number".to_string(), AvroValue::Long(entry.file_sequence_number)),
        (
            "data_file".to_string(),
            AvroValue::Record(vec![
                ("path".to_string(), AvroValue::String(entry.data_file.path.clone())),
                ("format".to_string(), AvroValue::String(entry.data_file.format.clone())),
                ("partition".to_string(), AvroValue::Map(BTreeMap::new())),
                ("record_count".to_string(), AvroValue::Long(entry.data_file.record_count)),
                ("file_size_in_bytes".to_string(), AvroValue::Long(entry.data_file.file_size_in_bytes)),
                ("lower_bounds".to_string(), bytes_map_to_avro(&entry.data_file.lower_bounds)),
                ("upper_bounds".to_string(), bytes_map_to_avro(&entry.data_file.upper_bounds)),
            ]),
        ),
    ])
}

pub fn write_manifest(entries: &[ManifestEntry]) -> DbResult<Bytes> {
    let mut writer = Writer::new(&ENTRY_SCHEMA, Vec::new());
    for entry in entries {
        writer.append(entry_to_avro(entry))?;
    }
    let bytes = writer.into_inner()?;
    Ok(Bytes::from(bytes))
}

fn avro_str(fields: &[(String, AvroValue)], name: &str) -> DbResult<String> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| match v {
            AvroValue::String(s) => Some(s.clone()),
            _ => None,
        })
        .ok_or_else(|| Error::corrupted("<manifest>", format!("missing field {name}")))
}

fn avro_long(fields: &[(String, AvroValue)], name: &str) -> DbResult<i64> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| match v {
            AvroValue::Long(l) => Some(*l),
            _ => None,
        })
        .ok_or_else(|| Error::corrupted("<manifest>", format!("missing field {name}")))
}

fn avro_int(fields: &[(String, AvroValue)], name: &str) -> DbResult<i32> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| match v {
            AvroValue::Int(i) => Some(*i),
            _ => None,
        })
        .ok_or_else(|| Error::corrupted("<manifest>", format!("missing field {name}")))
}

fn avro_bytes_map(fields: &[(String, AvroValue)], name: &str) -> BTreeMap<String, Vec<u8>> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| match v {
            AvroValue::Map(m) => Some(
                m.iter()
                    .filter_map(|(k, v)| match v {
                        AvroValue::Bytes(b) => Some((k.clone(), b.clone())),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

pub fn read_manifest(bytes: &Bytes) -> DbResult<Vec<ManifestEntry>> {
    if bytes.len() < 4 || &bytes[..4] != b"Obj\x01" {
        return Err(Error::corrupted("<manifest>", "missing avro object-container magic"));
    }
    let reader = Reader::new(&bytes[..])?;
    let mut out = Vec::new();
    for value in reader {
        let AvroValue::Record(fields) = value? else {
            return Err(Error::corrupted("<manifest>", "manifest_entry row is not a record"));
        };
        let status = match avro_int(&fields, "status")? {
            0 => EntryStatus::Existing,
            1 => EntryStatus::Added,
            2 => EntryStatus::Deleted,
            other => return Err(Error::corrupted("<manifest>", format!("unknown status {other}"))),
        };
        let snapshot_id = avro_long(&fields, "snapshot_id")?;
        let sequence_number = avro_long(&fields, "sequence_number")?;
        let file_sequence_number = avro_long(&fields, "file_sequence_number")?;
        let AvroValue::Record(data_file_fields) = fields
            .iter()
            .find(|(k, _)| k == "data_file")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::corrupted("<manifest>", "missing data_file"))?
        else {
            return Err(Error::corrupted("<manifest>", "data_file is not a record"));
        };
        let data_file = DataFile {
            path: avro_str(&data_file_fields, "path")?,
            format: avro_str(&data_file_fields, "format")?,
            record_count: avro_long(&data_file_fields, "record_count")?,
            file_size_in_bytes: avro_long(&data_file_fields, "file_size_in_bytes")?,
            lower_bounds: avro_bytes_map(&data_file_fields, "lower_bounds"),
            upper_bounds: avro_bytes_map(&data_file_fields, "upper_bounds"),
        };
        out.push(ManifestEntry {
            status,
            snapshot_id,
            sequence_number,
            file_sequence_number,
            data_file,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ManifestListEntry {
    pub manifest_path: String,
    pub manifest_length: i64,
    pub partition_spec_id: i32,
    pub added_snapshot_id: i64,
}

pub fn write_manifest_list(entries: &[ManifestListEntry]) -> DbResult<Bytes> {
    let mut writer = Writer::new(&FILE_SCHEMA, Vec::new());
    for entry in entries {
        writer.append(AvroValue::Record(vec![
            ("manifest_path".to_string(), AvroValue::String(entry.manifest_path.clone())),
            ("manifest_length".to_string(), AvroValue::Long(entry.manifest_length)),
            ("partition_spec_id".to_string(), AvroValue::Int(entry.partition_spec_id)),
            ("added_snapshot_id".to_string(), AvroValue::Long(entry.added_snapshot_id)),
        ]))?;
    }
    Ok(Bytes::from(writer.into_inner()?))
}

pub fn read_manifest_list(bytes: &Bytes) -> DbResult<Vec<ManifestListEntry>> {
    if bytes.len() < 4 || &bytes[..4] != b"Obj\x01" {
        return Err(Error::corrupted("<manifest-list>", "missing avro object-container magic"));
    }
    let reader = Reader::new(&bytes[..])?;
    let mut out = Vec::new();
    for value in reader {
        let AvroValue::Record(fields) = value? else {
            return Err(Error::corrupted("<manifest-list>", "manifest_file row is not a record"));
        };
        out.push(ManifestListEntry {
            manifest_path: avro_str(&fields, "manifest_path")?,
            manifest_length: avro_long(&fields, "manifest_length")?,
            partition_spec_id: avro_int(&fields, "partition_spec_id")?,
            added_snapshot_id: avro_long(&fields, "added_snapshot_id")?,
        });
    }
    Ok(out)
}

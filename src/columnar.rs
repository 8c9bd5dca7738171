//! The columnar data-file codec (§4.B).
//!
//! Each data file is a sequence of row groups; each row group holds one
//! column chunk per reserved/shredded/variant column, with per-chunk
//! statistics (`min`, `max`, `nullCount`) for types with a total order.
//! Variant columns omit min/max -- pushdown treats missing statistics as
//! "unknown" and never skips on them (§4.H).
//!
//! The on-disk layout mirrors Parquet's footer-at-the-end convention (data
//! first, footer last, trailing length + magic) without depending on the
//! `parquet` crate for the crate's own native file format; `parquet` is
//! reserved for Delta checkpoint interop (§4.D').

use crate::error::{DbResult, Error};
use crate::value::Value;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const MAGIC: &[u8; 4] = b"PDB1";
pub const FILE_EXTENSION: &str = "pdbcol";
pub const DEFAULT_ROW_GROUP_SIZE: usize = 10_000;

/// The closed set of column kinds (Design Notes §9: "a small tagged variant
/// with an explicit dispatch table, not an open trait hierarchy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    String,
    Instant,
    /// Self-describing JSON payload; the `$data` column and any nested
    /// shredded struct leaves that aren't promoted to a typed column.
    Variant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColumnStats {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
}

impl ColumnStats {
    fn observe(&mut self, value: Option<&Value>) {
        match value {
            None => self.null_count += 1,
            Some(v) => {
                // total-order types only; composite/variant values never
                // reach here because callers skip stats for them.
                self.min = Some(min_bound(self.min.take(), v));
                self.max = Some(max_bound(self.max.take(), v));
            }
        }
    }
}

fn min_bound(current: Option<Value>, candidate: &Value) -> Value {
    match current {
        None => candidate.clone(),
        Some(cur) => match cur.partial_compare(candidate) {
            Some(Ordering::Greater) => candidate.clone(),
            _ => cur,
        },
    }
}

fn max_bound(current: Option<Value>, candidate: &Value) -> Value {
    match current {
        None => candidate.clone(),
        Some(cur) => match cur.partial_compare(candidate) {
            Some(Ordering::Less) => candidate.clone(),
            _ => cur,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnChunkMeta {
    pub name: String,
    pub kind: ColumnKind,
    pub offset: u64,
    pub length: u64,
    pub stats: ColumnStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowGroupMeta {
    pub row_count: u64,
    pub columns: Vec<ColumnChunkMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFooter {
    pub row_count: u64,
    pub row_groups: Vec<RowGroupMeta>,
}

impl FileFooter {
    /// File-level statistics: the union of all row-group statistics per
    /// column, used for manifest-entry bounds (§4.D) and coarse file
    /// skipping ahead of row-group skipping (§4.G step 2-3).
    pub fn file_stats(&self) -> BTreeMap<String, ColumnStats> {
        let mut merged: BTreeMap<String, ColumnStats> = BTreeMap::new();
        for rg in &self.row_groups {
            for col in &rg.columns {
                let entry = merged.entry(col.name.clone()).or_default();
                entry.null_count += col.stats.null_count;
                if let Some(min) = &col.stats.min {
                    entry.min = Some(min_bound(entry.min.take(), min));
                }
                if let Some(max) = &col.stats.max {
                    entry.max = Some(max_bound(entry.max.take(), max));
                }
            }
        }
        merged
    }
}

/// One column's worth of row values, some possibly null, destined for a
/// single row group.
pub struct ColumnInput {
    pub name: String,
    pub kind: ColumnKind,
    pub values: Vec<Option<Value>>,
}

fn encode_column(input: &ColumnInput) -> (Bytes, ColumnStats) {
    let mut buf = BytesMut::new();
    let mut stats = ColumnStats::default();
    let track_bounds = !matches!(input.kind, ColumnKind::Variant);
    for value in &input.values {
        match value {
            None => {
                buf.put_u8(0);
                stats.null_count += 1;
            }
            Some(v) => {
                buf.put_u8(1);
                if track_bounds {
                    stats.observe(Some(v));
                }
                encode_value_payload(&mut buf, input.kind, v);
            }
        }
    }
    (buf.freeze(), stats)
}

/// Encodes a single bound value using the same fixed/variable-width layout
/// as column payloads: "integers as fixed 4/8-byte little-endian; strings as
/// UTF-8 bytes; instants as microseconds since epoch" (§4.B). Used by the
/// Iceberg manifest writer for `lower-bounds`/`upper-bounds`.
pub fn encode_bound(kind: ColumnKind, v: &Value) -> Vec<u8> {
    match kind {
        ColumnKind::Bool => vec![if v.as_bool().unwrap_or(false) { 1 } else { 0 }],
        ColumnKind::Int => v.as_i64().unwrap_or_default().to_le_bytes().to_vec(),
        ColumnKind::Float => v.as_f64().unwrap_or_default().to_le_bytes().to_vec(),
        ColumnKind::Instant => {
            let micros = match v {
                Value::Instant(i) => i.as_micros(),
                other => other.as_i64().unwrap_or_default(),
            };
            micros.to_le_bytes().to_vec()
        }
        ColumnKind::String => v.as_str().unwrap_or_default().as_bytes().to_vec(),
        ColumnKind::Variant => Vec::new(),
    }
}

pub fn decode_bound(kind: ColumnKind, bytes: &[u8]) -> DbResult<Value> {
    let value = match kind {
        ColumnKind::Bool => Value::Bool(bytes.first().copied().unwrap_or(0) != 0),
        ColumnKind::Int => Value::Int(i64::from_le_bytes(
            bytes.try_into().map_err(|_| Error::corrupted("<bound>", "wrong width for int bound"))?,
        )),
        ColumnKind::Float => Value::Float(f64::from_le_bytes(
            bytes.try_into().map_err(|_| Error::corrupted("<bound>", "wrong width for float bound"))?,
        )),
        ColumnKind::Instant => Value::Instant(crate::value::Instant::from_micros(i64::from_le_bytes(
            bytes.try_into().map_err(|_| Error::corrupted("<bound>", "wrong width for instant bound"))?,
        ))),
        ColumnKind::String => Value::String(
            std::str::from_utf8(bytes)
                .map_err(|e| Error::corrupted("<bound>", e.to_string()))?
                .to_string(),
        ),
        ColumnKind::Variant => return Err(Error::internal("variant columns have no bounds")),
    };
    Ok(value)
}

fn encode_value_payload(buf: &mut BytesMut, kind: ColumnKind, v: &Value) {
    match kind {
        ColumnKind::Bool => buf.put_u8(if v.as_bool().unwrap_or(false) { 1 } else { 0 }),
        ColumnKind::Int => buf.put_i64_le(v.as_i64().unwrap_or_default()),
        ColumnKind::Float => buf.put_f64_le(v.as_f64().unwrap_or_default()),
        ColumnKind::Instant => {
            let micros = match v {
                Value::Instant(i) => i.as_micros(),
                other => other.as_i64().unwrap_or_default(),
            };
            buf.put_i64_le(micros);
        }
        ColumnKind::String => {
            let s = v.as_str().unwrap_or_default();
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        ColumnKind::Variant => {
            let json = serde_json::to_vec(&serde_json::Value::from(v)).unwrap_or_default();
            buf.put_u32_le(json.len() as u32);
            buf.put_slice(&json);
        }
    }
}

fn decode_column(mut bytes: &[u8], kind: ColumnKind, row_count: usize) -> DbResult<Vec<Option<Value>>> {
    let mut out = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        if bytes.is_empty() {
            return Err(Error::corrupted("<column>", "truncated column chunk"));
        }
        let present = bytes.get_u8();
        if present == 0 {
            out.push(None);
            continue;
        }
        let value = match kind {
            ColumnKind::Bool => Value::Bool(bytes.get_u8() != 0),
            ColumnKind::Int => Value::Int(bytes.get_i64_le()),
            ColumnKind::Float => Value::Float(bytes.get_f64_le()),
            ColumnKind::Instant => Value::Instant(crate::value::Instant::from_micros(bytes.get_i64_le())),
            ColumnKind::String => {
                let len = bytes.get_u32_le() as usize;
                let s = std::str::from_utf8(&bytes[..len])
                    .map_err(|e| Error::corrupted("<column>", e.to_string()))?
                    .to_string();
                bytes.advance(len);
                Value::String(s)
            }
            ColumnKind::Variant => {
                let len = bytes.get_u32_le() as usize;
                let json: serde_json::Value = serde_json::from_slice(&bytes[..len])?;
                bytes.advance(len);
                Value::from(&json)
            }
        };
        out.push(Some(value));
    }
    Ok(out)
}

/// Writes one data file (possibly multiple row groups) from row-major
/// column inputs, computing a content-dependent path (§4.B).
pub struct ColumnarWriter {
    row_group_size: usize,
}

impl Default for ColumnarWriter {
    fn default() -> Self {
        ColumnarWriter {
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }
}

/// Result of encoding a batch: the bytes to persist plus the metadata the
/// commit coordinator needs for its `add` action (§4.D/§4.D').
pub struct EncodedFile {
    pub bytes: Bytes,
    pub footer: FileFooter,
}

impl ColumnarWriter {
    pub fn with_row_group_size(row_group_size: usize) -> Self {
        ColumnarWriter { row_group_size: row_group_size.max(1) }
    }

    /// `columns` holds one [`ColumnInput`] per column, all with the same
    /// `values.len()` (the total row count of the batch); it is sliced into
    /// row groups here.
    pub fn encode(&self, row_count: usize, columns: Vec<ColumnInput>) -> DbResult<EncodedFile> {
        let mut data = BytesMut::new();
        data.put_slice(MAGIC);
        let mut row_groups = Vec::new();

        let mut start = 0usize;
        while start < row_count || (row_count == 0 && row_groups.is_empty()) {
            let end = (start + self.row_group_size).min(row_count);
            let mut chunk_metas = Vec::with_capacity(columns.len());
            for col in &columns {
                let slice = ColumnInput {
                    name: col.name.clone(),
                    kind: col.kind,
                    values: col.values[start..end].to_vec(),
                };
                let (bytes, stats) = encode_column(&slice);
                let offset = (data.len() - MAGIC.len()) as u64;
                data.put_slice(&bytes);
                chunk_metas.push(ColumnChunkMeta {
                    name: col.name.clone(),
                    kind: col.kind,
                    offset,
                    length: bytes.len() as u64,
                    stats,
                });
            }
            row_groups.push(RowGroupMeta {
                row_count: (end - start) as u64,
                columns: chunk_metas,
            });
            if row_count == 0 {
                break;
            }
            start = end;
        }

        let footer = FileFooter {
            row_count: row_count as u64,
            row_groups,
        };
        let footer_json = serde_json::to_vec(&footer)?;
        data.put_slice(&footer_json);
        data.put_u64_le(footer_json.len() as u64);
        data.put_slice(MAGIC);

        Ok(EncodedFile {
            bytes: data.freeze(),
            footer,
        })
    }

    /// A content-dependent path: `{uuid}-{hash-prefix}.pdbcol` (§4.B).
    pub fn path_for(bytes: &Bytes) -> String {
        let digest = crate::util::content_hash(bytes);
        format!("{}-{}.{FILE_EXTENSION}", uuid::Uuid::new_v4(), &digest[..12])
    }
}

/// Reads a data file, decoding only the requested columns, and applies
/// row-group-level skipping against caller-provided predicates before
/// decoding anything (§4.G step 3, §4.H).
pub struct ColumnarReader;

impl ColumnarReader {
    pub fn read_footer(bytes: &Bytes) -> DbResult<FileFooter> {
        if bytes.len() < MAGIC.len() * 2 + 8 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::corrupted("<file>", "missing leading magic"));
        }
        let trailer_start = bytes.len() - MAGIC.len();
        if &bytes[trailer_start..] != MAGIC {
            return Err(Error::corrupted("<file>", "missing trailing magic"));
        }
        let len_start = trailer_start - 8;
        let footer_len = (&bytes[len_start..trailer_start]).get_u64_le() as usize;
        let footer_start = len_start - footer_len;
        let footer: FileFooter = serde_json::from_slice(&bytes[footer_start..len_start])?;
        Ok(footer)
    }

    /// Decode the given row group, returning only the requested column
    /// names, as parallel `Vec<Option<Value>>` keyed by column name.
    pub fn decode_row_group(
        bytes: &Bytes,
        row_group: &RowGroupMeta,
        projection: &[String],
    ) -> DbResult<BTreeMap<String, Vec<Option<Value>>>> {
        let data_start = MAGIC.len();
        let mut out = BTreeMap::new();
        for col in &row_group.columns {
            if !projection.is_empty() && !projection.iter().any(|p| p == &col.name) {
                continue;
            }
            let start = data_start + col.offset as usize;
            let end = start + col.length as usize;
            let decoded = decode_column(&bytes[start..end], col.kind, row_group.row_count as usize)?;
            out.insert(col.name.clone(), decoded);
        }
        Ok(out)
    }
}

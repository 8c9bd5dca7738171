//! Delta Lake log actions (§4.D').
//!
//! Each commit file is newline-delimited JSON where every line is a
//! single-key object naming the action it carries -- `protocol`, `metaData`,
//! `add`, `remove`, or `commitInfo` -- matching the real Delta transaction
//! log format byte-for-byte closely enough that `delta-rs`/Spark can read it.

use crate::value::Instant;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Protocol {
    #[serde(rename = "minReaderVersion")]
    pub min_reader_version: i32,
    #[serde(rename = "minWriterVersion")]
    pub min_writer_version: i32,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol { min_reader_version: 1, min_writer_version: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Format {
    pub provider: String,
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Format { provider: "parquet".to_string(), options: HashMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaData {
    pub id: String,
    pub format: Format,
    #[serde(rename = "schemaString")]
    pub schema_string: String,
    #[serde(rename = "partitionColumns")]
    pub partition_columns: Vec<String>,
    pub configuration: HashMap<String, String>,
    #[serde(rename = "createdTime")]
    pub created_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Add {
    pub path: String,
    #[serde(rename = "partitionValues")]
    pub partition_values: HashMap<String, String>,
    pub size: i64,
    #[serde(rename = "modificationTime")]
    pub modification_time: i64,
    #[serde(rename = "dataChange")]
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Remove {
    pub path: String,
    #[serde(rename = "deletionTimestamp")]
    pub deletion_timestamp: i64,
    #[serde(rename = "dataChange")]
    pub data_change: bool,
    #[serde(rename = "extendedFileMetadata")]
    pub extended_file_metadata: bool,
    #[serde(rename = "partitionValues")]
    pub partition_values: HashMap<String, String>,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub timestamp: i64,
    pub operation: String,
    #[serde(rename = "operationParameters")]
    pub operation_parameters: HashMap<String, String>,
    #[serde(rename = "readVersion", skip_serializing_if = "Option::is_none")]
    pub read_version: Option<i64>,
    #[serde(rename = "isolationLevel")]
    pub isolation_level: String,
    #[serde(rename = "isBlindAppend")]
    pub is_blind_append: bool,
}

/// One line of a Delta commit file: `{"add": {...}}`, `{"remove": {...}}`,
/// etc. `#[serde(rename_all = "camelCase")]` on the enum isn't enough here --
/// Delta's action keys (`metaData`, `commitInfo`) aren't uniform camelCase of
/// the Rust variant name, so each is spelled out explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Action {
    #[serde(rename = "protocol")]
    Protocol(Protocol),
    #[serde(rename = "metaData")]
    MetaData(MetaData),
    #[serde(rename = "add")]
    Add(Add),
    #[serde(rename = "remove")]
    Remove(Remove),
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
}

pub fn now_millis(now: Instant) -> i64 {
    now.as_micros() / 1000
}

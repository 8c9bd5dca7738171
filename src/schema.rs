//! Namespace schema tracking: which top-level fields get shredded into
//! typed columns, and the append-only evolution rule that governs adding
//! them (§3 "Namespace", §4.B "shredded fields").
//!
//! This sits above [`crate::iceberg::TableMetadata::evolve_schema`] and the
//! Delta `schemaString` -- both dialects already evolve their own on-disk
//! schema record append-only; this module decides *what* to hand them by
//! watching the shapes of entities as they're written.

use crate::columnar::ColumnKind;
use crate::error::{DbResult, Error};
use crate::value::{OrderedMap, Value};
use std::collections::BTreeMap;

fn scalar_kind(value: &Value) -> Option<ColumnKind> {
    match value {
        Value::Bool(_) => Some(ColumnKind::Bool),
        Value::Int(_) => Some(ColumnKind::Int),
        Value::Float(_) => Some(ColumnKind::Float),
        Value::String(_) => Some(ColumnKind::String),
        Value::Instant(_) => Some(ColumnKind::Instant),
        // Arrays and maps stay in the `$data` variant column only -- only
        // scalar top-level fields are shredding candidates (§4.B).
        Value::Array(_) | Value::Map(_) | Value::Null => None,
    }
}

/// Maps a [`ColumnKind`] onto the logical-type string each dialect's schema
/// record expects (Iceberg's `type` field, Delta's Spark-style type name).
pub fn logical_type_name(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool => "boolean",
        ColumnKind::Int => "long",
        ColumnKind::Float => "double",
        ColumnKind::String => "string",
        ColumnKind::Instant => "timestamp",
        ColumnKind::Variant => "string", // the `$data` column itself is never a schema_hints entry
    }
}

/// A namespace's observed, append-only shredded-field schema (§3: "Schema
/// is created from the entity's observed fields on first commit and
/// evolves append-only").
#[derive(Debug, Clone, Default)]
pub struct NamespaceSchema {
    columns: BTreeMap<String, ColumnKind>,
}

impl NamespaceSchema {
    pub fn new() -> Self {
        NamespaceSchema::default()
    }

    pub fn column_kinds(&self) -> &BTreeMap<String, ColumnKind> {
        &self.columns
    }

    pub fn shredded_paths(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn shredded_fields(&self) -> Vec<(String, ColumnKind)> {
        self.columns.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn schema_hints(&self) -> Vec<(String, String)> {
        self.columns
            .iter()
            .map(|(name, kind)| (name.clone(), logical_type_name(*kind).to_string()))
            .collect()
    }

    /// Folds one entity's top-level scalar fields into the schema. New
    /// fields are added with whatever kind they're first observed as.
    /// A field seen again under a different scalar kind is widened
    /// int->float automatically (§7 `SchemaIncompatible`: "only type
    /// widening is permitted automatically"); any other kind mismatch is
    /// rejected rather than silently dropped from shredding, since a
    /// column whose bounds mix incomparable types would violate the
    /// statistics invariant in §3.
    pub fn observe(&mut self, data: &OrderedMap) -> DbResult<()> {
        for (name, value) in data {
            let Some(kind) = scalar_kind(value) else { continue };
            match self.columns.get(name) {
                None => {
                    self.columns.insert(name.clone(), kind);
                }
                Some(existing) if *existing == kind => {}
                Some(ColumnKind::Int) if kind == ColumnKind::Float => {
                    self.columns.insert(name.clone(), ColumnKind::Float);
                }
                Some(ColumnKind::Float) if kind == ColumnKind::Int => {} // already wide enough
                Some(existing) => {
                    return Err(Error::SchemaIncompatible(format!(
                        "field `{name}` was previously observed as {existing:?}, got {kind:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

//! Entities: the unit of storage (§3).
//!
//! An entity is a map from string keys to [`Value`]s with a fixed set of
//! reserved attributes (`$id`, `$type`, `name`, `version`, `createdAt`,
//! `updatedAt`, `deletedAt`) plus arbitrary user fields.

use crate::error::{DbResult, Error, InvalidKind};
use crate::value::{Instant, OrderedMap, Value};

pub const FIELD_ID: &str = "$id";
pub const FIELD_TYPE: &str = "$type";
pub const FIELD_NAME: &str = "name";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
pub const FIELD_DELETED_AT: &str = "deletedAt";
/// The self-describing variant column holding everything not shredded out
/// into its own typed column (§3, §4.B).
pub const FIELD_DATA: &str = "$data";

pub const RESERVED_FIELDS: &[&str] = &[
    FIELD_ID,
    FIELD_TYPE,
    FIELD_NAME,
    FIELD_VERSION,
    FIELD_CREATED_AT,
    FIELD_UPDATED_AT,
    FIELD_DELETED_AT,
];

/// An entity's identity, `"{namespace}/{local}"` (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub namespace: String,
    pub local: String,
}

impl EntityId {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        EntityId {
            namespace: namespace.into(),
            local: local.into(),
        }
    }

    pub fn generate(namespace: impl Into<String>) -> Self {
        EntityId::new(namespace, uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.local)
    }
}

impl EntityId {
    pub fn parse(s: &str) -> DbResult<Self> {
        match s.split_once('/') {
            Some((ns, local)) if !ns.is_empty() && !local.is_empty() => {
                Ok(EntityId::new(ns, local))
            }
            _ => Err(Error::invalid(
                InvalidKind::Id,
                format!("malformed entity id: {s}"),
            )),
        }
    }
}

/// A fully materialized entity: reserved fields plus user data.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub name: String,
    pub version: u64,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub deleted_at: Option<Instant>,
    /// Everything else, stored in the self-describing `$data` column.
    pub data: OrderedMap,
}

impl Entity {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Render as the public JSON wire shape: reserved fields flattened
    /// alongside user data, matching §6's "entity wire format."
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(FIELD_ID.into(), serde_json::Value::String(self.id.to_string()));
        map.insert(FIELD_TYPE.into(), serde_json::Value::String(self.entity_type.clone()));
        map.insert(FIELD_NAME.into(), serde_json::Value::String(self.name.clone()));
        map.insert(FIELD_VERSION.into(), serde_json::Value::from(self.version));
        map.insert(
            FIELD_CREATED_AT.into(),
            serde_json::Value::String(self.created_at.to_rfc3339()),
        );
        map.insert(
            FIELD_UPDATED_AT.into(),
            serde_json::Value::String(self.updated_at.to_rfc3339()),
        );
        if let Some(deleted_at) = &self.deleted_at {
            map.insert(
                FIELD_DELETED_AT.into(),
                serde_json::Value::String(deleted_at.to_rfc3339()),
            );
        }
        for (k, v) in &self.data {
            map.insert(k.clone(), serde_json::Value::from(v));
        }
        serde_json::Value::Object(map)
    }

    /// Look up a field by dotted path, checking reserved fields first.
    pub fn get(&self, path: &str) -> Option<Value> {
        match path {
            FIELD_ID => Some(Value::String(self.id.to_string())),
            FIELD_TYPE => Some(Value::String(self.entity_type.clone())),
            FIELD_NAME => Some(Value::String(self.name.clone())),
            FIELD_VERSION => Some(Value::Int(self.version as i64)),
            FIELD_CREATED_AT => Some(Value::Instant(self.created_at)),
            FIELD_UPDATED_AT => Some(Value::Instant(self.updated_at)),
            FIELD_DELETED_AT => self.deleted_at.map(Value::Instant),
            other => {
                let segments: Vec<&str> = other.split('.').collect();
                let (head, rest) = segments.split_first()?;
                let first = self.data.get(*head)?;
                if rest.is_empty() {
                    Some(first.clone())
                } else {
                    first.get_path(rest).cloned()
                }
            }
        }
    }

    /// One row's worth of reserved + `$data` column values, in the fixed
    /// column order the columnar writer expects (§4.B, §4.C).
    pub fn to_columns_row(&self) -> Vec<(&'static str, Option<Value>)> {
        vec![
            (FIELD_ID, Some(Value::String(self.id.to_string()))),
            (FIELD_TYPE, Some(Value::String(self.entity_type.clone()))),
            (FIELD_NAME, Some(Value::String(self.name.clone()))),
            (FIELD_VERSION, Some(Value::Int(self.version as i64))),
            (FIELD_CREATED_AT, Some(Value::Instant(self.created_at))),
            (FIELD_UPDATED_AT, Some(Value::Instant(self.updated_at))),
            (FIELD_DELETED_AT, self.deleted_at.map(Value::Instant)),
            (FIELD_DATA, Some(Value::Map(self.data.clone()))),
        ]
    }

    /// Reconstructs an entity from a decoded row keyed by column name
    /// (the inverse of [`Entity::to_columns_row`]).
    pub fn from_columns_row(row: &std::collections::BTreeMap<String, Option<Value>>) -> DbResult<Entity> {
        let id_str = row
            .get(FIELD_ID)
            .and_then(|v| v.as_ref())
            .and_then(Value::as_str)
            .ok_or_else(|| Error::corrupted(FIELD_ID, "missing $id column"))?;
        let entity_type = row
            .get(FIELD_TYPE)
            .and_then(|v| v.as_ref())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = row
            .get(FIELD_NAME)
            .and_then(|v| v.as_ref())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let version = row
            .get(FIELD_VERSION)
            .and_then(|v| v.as_ref())
            .and_then(Value::as_i64)
            .unwrap_or(1) as u64;
        let created_at = match row.get(FIELD_CREATED_AT).and_then(|v| v.as_ref()) {
            Some(Value::Instant(i)) => *i,
            _ => Instant::from_micros(0),
        };
        let updated_at = match row.get(FIELD_UPDATED_AT).and_then(|v| v.as_ref()) {
            Some(Value::Instant(i)) => *i,
            _ => created_at,
        };
        let deleted_at = match row.get(FIELD_DELETED_AT).and_then(|v| v.as_ref()) {
            Some(Value::Instant(i)) => Some(*i),
            _ => None,
        };
        let data = match row.get(FIELD_DATA).and_then(|v| v.as_ref()) {
            Some(Value::Map(m)) => m.clone(),
            _ => OrderedMap::new(),
        };
        Ok(Entity {
            id: EntityId::parse(id_str)?,
            entity_type,
            name,
            version,
            created_at,
            updated_at,
            deleted_at,
            data,
        })
    }
}

/// Assigns identity, version, and timestamps for a brand-new entity from
/// caller-supplied JSON (the "entity assembler" of spec.md §2's data flow).
pub fn assemble_new(
    namespace: &str,
    entity_type: &str,
    input: serde_json::Value,
    now: Instant,
) -> DbResult<Entity> {
    let serde_json::Value::Object(mut map) = input else {
        return Err(Error::invalid(InvalidKind::Data, "entity data must be an object"));
    };

    let name = match map.remove(FIELD_NAME) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s,
        Some(_) => {
            return Err(Error::invalid(InvalidKind::Data, "`name` must be a non-empty string"))
        }
        None => return Err(Error::invalid(InvalidKind::Data, "`name` is required")),
    };

    let local = match map.remove(FIELD_ID) {
        Some(serde_json::Value::String(s)) => s,
        _ => uuid::Uuid::new_v4().to_string(),
    };

    // Drop any other reserved fields the caller may have supplied; they are
    // engine-assigned and not user-settable on create.
    for reserved in RESERVED_FIELDS {
        map.remove(*reserved);
    }

    let data = map
        .into_iter()
        .map(|(k, v)| (k, Value::from(&v)))
        .collect::<OrderedMap>();

    Ok(Entity {
        id: EntityId::new(namespace, local),
        entity_type: entity_type.to_string(),
        name,
        version: 1,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_assigns_id_and_version() {
        let now = Instant::from_micros(1_000_000);
        let entity = assemble_new("posts", "Post", serde_json::json!({"name": "hello", "age": 3}), now).unwrap();
        assert_eq!(entity.version, 1);
        assert_eq!(entity.created_at, entity.updated_at);
        assert!(entity.deleted_at.is_none());
        assert_eq!(entity.get("age"), Some(Value::Int(3)));
    }

    #[test]
    fn assemble_rejects_missing_name() {
        let now = Instant::now();
        let err = assemble_new("posts", "Post", serde_json::json!({}), now).unwrap_err();
        assert!(matches!(err, Error::Invalid { kind: InvalidKind::Data, .. }));
    }

    #[test]
    fn columns_round_trip_preserves_entity() {
        let now = Instant::from_micros(5_000_000);
        let entity = assemble_new("posts", "Post", serde_json::json!({"name": "hi", "tags": []}), now).unwrap();
        let row: std::collections::BTreeMap<String, Option<Value>> = entity
            .to_columns_row()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = Entity::from_columns_row(&row).unwrap();
        assert_eq!(back.id, entity.id);
        assert_eq!(back.name, entity.name);
        assert_eq!(back.data.get("tags"), Some(&Value::Array(vec![])));
    }

    #[test]
    fn entity_id_parses_namespace_and_local() {
        let id = EntityId::parse("posts/abc").unwrap();
        assert_eq!(id.namespace, "posts");
        assert_eq!(id.local, "abc");
        assert!(EntityId::parse("posts").is_err());
    }
}

//! The variant value lattice (§3, Design Notes §9).
//!
//! `Value` is a tagged sum over the types a self-describing document column
//! can hold. It is the runtime representation of both reserved fields and
//! arbitrary user data; the columnar codec encodes/decodes it without any
//! heuristic type guessing (instants are a distinct variant from integers).

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::fmt;

/// Microseconds since the Unix epoch. A dedicated type rather than a bare
/// `i64` so the codec can restore instants "by type, not by heuristic"
/// (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Instant(pub i64);

impl Instant {
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        Instant(micros)
    }

    pub fn from_micros(micros: i64) -> Self {
        Instant(micros)
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn to_rfc3339(&self) -> String {
        let secs = self.0.div_euclid(1_000_000);
        let micros_rem = self.0.rem_euclid(1_000_000);
        let nanos = (micros_rem * 1000) as u32;
        chrono::DateTime::from_timestamp(secs, nanos)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// An ordered map with string keys, preserving the order fields were
/// inserted (matching the teacher's `indexmap`-based struct fields).
pub type OrderedMap = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Instant(Instant),
    Array(Vec<Value>),
    Map(OrderedMap),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Instant(_) => "instant",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&OrderedMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Navigate a dotted field path (`"$data.year"` style, minus the
    /// `$data.` prefix) through nested maps. Returns `None` if any segment
    /// is absent or not a map -- absence, not null (schema evolution rule,
    /// §3).
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = self;
        for segment in path {
            cur = cur.as_map()?.get(*segment)?;
        }
        Some(cur)
    }

    /// Partial order over comparable variants, used by pushdown bound
    /// comparisons (§4.H) and shredded-column statistics (§4.B). Values of
    /// different types, and the composite types (array/map), are
    /// incomparable.
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.partial_cmp(b),
            (Int(a), Int(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (String(a), String(b)) => a.partial_cmp(b),
            (Instant(a), Instant(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Instant> for Value {
    fn from(i: Instant) -> Self {
        Value::Instant(i)
    }
}

/// Round-trips through `serde_json::Value`, used both as the wire format
/// for the public entity API and as the intermediate form the variant codec
/// serializes into the self-describing `$data` column (§4.B).
impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(a) => Value::Array(a.iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect())
            }
        }
    }
}

/// Manual `Serialize`/`Deserialize` via the JSON bridge above, so `Value`
/// can be embedded directly in the columnar footer (column statistics) and
/// in Iceberg/Delta metadata JSON without a second encoding.
impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from(&json))
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            // Instants are serialized as RFC3339 strings on the JSON wire;
            // the columnar codec encodes them as microsecond integers
            // instead (see `variant::encode_value`).
            Value::Instant(i) => serde_json::Value::String(i.to_rfc3339()),
            Value::Array(a) => serde_json::Value::Array(a.iter().map(serde_json::Value::from).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collections_are_distinct_from_null() {
        let empty_arr = Value::Array(vec![]);
        let empty_map = Value::Map(OrderedMap::new());
        assert_ne!(empty_arr, Value::Null);
        assert_ne!(empty_map, Value::Null);
        assert_ne!(empty_arr, empty_map);
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let json = serde_json::json!({
            "a": 1,
            "b": [1, 2, 3],
            "c": {},
            "d": [],
            "e": null,
        });
        let value = Value::from(&json);
        let back = serde_json::Value::from(&value);
        assert_eq!(json, back);
    }

    #[test]
    fn get_path_navigates_nested_maps() {
        let json = serde_json::json!({"year": {"month": 7}});
        let value = Value::from(&json);
        assert_eq!(value.get_path(&["year", "month"]), Some(&Value::Int(7)));
        assert_eq!(value.get_path(&["year", "day"]), None);
        assert_eq!(value.get_path(&["missing"]), None);
    }

    #[test]
    fn partial_compare_is_none_across_types() {
        assert_eq!(Value::Int(1).partial_compare(&Value::String("1".into())), None);
        assert_eq!(Value::Int(1).partial_compare(&Value::Int(2)), Some(Ordering::Less));
    }
}

//! The find-filter AST and update-operator vocabulary (§6).
//!
//! Filters parse from the public JSON wire shape (MongoDB-flavored operator
//! keys) into a tree that both the pushdown analyzer (§4.H) and the residual
//! in-memory evaluator (used post-decode and for compatibility checks in the
//! materialized-view optimizer, §4.J) share.

use crate::entity::Entity;
use crate::error::{DbResult, Error, InvalidKind};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum CompareOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex(String),
    StartsWith(String),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `{path: {$op: value}}` or the bare-value shorthand `{path: value}`.
    Field { path: String, op: CompareOp },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Nor(Vec<Filter>),
    /// Top-level `{$text: "query"}` full-text directive (§4.I).
    Text(String),
    /// Top-level `{$vector: {query, k}}` ANN directive (§4.I).
    Vector { query: Vec<f32>, k: usize },
    /// `{}` — matches everything.
    MatchAll,
}

fn parse_compare_op(key: &str, value: &serde_json::Value) -> DbResult<CompareOp> {
    let as_value = || Value::from(value);
    Ok(match key {
        "$eq" => CompareOp::Eq(as_value()),
        "$ne" => CompareOp::Ne(as_value()),
        "$gt" => CompareOp::Gt(as_value()),
        "$gte" => CompareOp::Gte(as_value()),
        "$lt" => CompareOp::Lt(as_value()),
        "$lte" => CompareOp::Lte(as_value()),
        "$in" => CompareOp::In(value.as_array().map(|a| a.iter().map(Value::from).collect()).unwrap_or_default()),
        "$nin" => CompareOp::Nin(value.as_array().map(|a| a.iter().map(Value::from).collect()).unwrap_or_default()),
        "$regex" => CompareOp::Regex(value.as_str().unwrap_or_default().to_string()),
        "$startsWith" => CompareOp::StartsWith(value.as_str().unwrap_or_default().to_string()),
        "$exists" => CompareOp::Exists(value.as_bool().unwrap_or(true)),
        other => return Err(Error::invalid(InvalidKind::Filter, format!("unknown operator {other}"))),
    })
}

fn parse_field_value(path: &str, value: &serde_json::Value) -> DbResult<Filter> {
    match value {
        serde_json::Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            let mut ops = Vec::new();
            for (k, v) in map {
                ops.push(Filter::Field { path: path.to_string(), op: parse_compare_op(k, v)? });
            }
            Ok(if ops.len() == 1 { ops.into_iter().next().unwrap() } else { Filter::And(ops) })
        }
        other => Ok(Filter::Field { path: path.to_string(), op: CompareOp::Eq(Value::from(other)) }),
    }
}

/// Parses the public JSON filter shape (§6) into a [`Filter`] tree.
pub fn parse_filter(json: &serde_json::Value) -> DbResult<Filter> {
    let serde_json::Value::Object(map) = json else {
        return Err(Error::invalid(InvalidKind::Filter, "filter must be an object"));
    };
    if map.is_empty() {
        return Ok(Filter::MatchAll);
    }

    let mut clauses = Vec::new();
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Filter::And(parse_array(value)?),
            "$or" => Filter::Or(parse_array(value)?),
            "$nor" => Filter::Nor(parse_array(value)?),
            "$not" => Filter::Not(Box::new(parse_filter(value)?)),
            "$text" => Filter::Text(value.as_str().unwrap_or_default().to_string()),
            "$vector" => {
                let query = value
                    .get("query")
                    .and_then(|q| q.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect())
                    .unwrap_or_default();
                let k = value.get("k").and_then(|k| k.as_u64()).unwrap_or(10) as usize;
                Filter::Vector { query, k }
            }
            path => parse_field_value(path, value)?,
        };
        clauses.push(clause);
    }
    Ok(if clauses.len() == 1 { clauses.into_iter().next().unwrap() } else { Filter::And(clauses) })
}

fn parse_array(value: &serde_json::Value) -> DbResult<Vec<Filter>> {
    value
        .as_array()
        .ok_or_else(|| Error::invalid(InvalidKind::Filter, "expected an array of sub-filters"))?
        .iter()
        .map(parse_filter)
        .collect()
}

fn compare(lhs: Option<&Value>, op: &CompareOp) -> bool {
    use std::cmp::Ordering;
    match op {
        CompareOp::Eq(v) => lhs == Some(v),
        CompareOp::Ne(v) => lhs != Some(v),
        CompareOp::Gt(v) => lhs.and_then(|l| l.partial_compare(v)) == Some(Ordering::Greater),
        CompareOp::Gte(v) => matches!(lhs.and_then(|l| l.partial_compare(v)), Some(Ordering::Greater) | Some(Ordering::Equal)),
        CompareOp::Lt(v) => lhs.and_then(|l| l.partial_compare(v)) == Some(Ordering::Less),
        CompareOp::Lte(v) => matches!(lhs.and_then(|l| l.partial_compare(v)), Some(Ordering::Less) | Some(Ordering::Equal)),
        CompareOp::In(vs) => lhs.is_some_and(|l| vs.contains(l)),
        CompareOp::Nin(vs) => !lhs.is_some_and(|l| vs.contains(l)),
        CompareOp::Regex(pattern) => lhs.and_then(Value::as_str).is_some_and(|s| regex_like_match(pattern, s)),
        CompareOp::StartsWith(prefix) => lhs.and_then(Value::as_str).is_some_and(|s| s.starts_with(prefix.as_str())),
        CompareOp::Exists(want) => lhs.is_some() == *want,
    }
}

/// A deliberately small regex dialect (literal text, `.` and `*`) so the
/// crate doesn't need a full regex engine dependency for this one operator;
/// anything fancier should go through `$text`.
fn regex_like_match(pattern: &str, haystack: &str) -> bool {
    fn matches(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'*') => matches(&pattern[1..], text) || (!text.is_empty() && matches(pattern, &text[1..])),
            Some(&p) => {
                if let Some(&t) = text.first() {
                    let ok = p == b'.' || p == t;
                    ok && matches(&pattern[1..], &text[1..])
                } else {
                    false
                }
            }
        }
    }
    matches(pattern.as_bytes(), haystack.as_bytes())
}

/// Evaluates a filter against a fully materialized entity (used for the
/// post-decode residual and as a fallback when pushdown can't fully resolve
/// a predicate).
pub fn eval(filter: &Filter, entity: &Entity) -> bool {
    match filter {
        Filter::MatchAll => true,
        Filter::Field { path, op } => compare(entity.get(path).as_ref(), op),
        Filter::And(clauses) => clauses.iter().all(|c| eval(c, entity)),
        Filter::Or(clauses) => clauses.iter().any(|c| eval(c, entity)),
        Filter::Not(inner) => !eval(inner, entity),
        Filter::Nor(clauses) => !clauses.iter().any(|c| eval(c, entity)),
        Filter::Text(_) | Filter::Vector { .. } => true, // resolved upstream by the ranking stage, not a boolean predicate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(std::collections::BTreeMap<String, Value>),
    Unset(Vec<String>),
    Inc(std::collections::BTreeMap<String, f64>),
    Push { path: String, value: Value },
    Pull { path: String, value: Value },
    AddToSet { path: String, value: Value },
}

pub fn parse_update(json: &serde_json::Value) -> DbResult<Vec<UpdateOp>> {
    let serde_json::Value::Object(map) = json else {
        return Err(Error::invalid(InvalidKind::Update, "update must be an object"));
    };
    let mut ops = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "$set" => {
                let obj = value.as_object().ok_or_else(|| Error::invalid(InvalidKind::Update, "$set expects an object"))?;
                ops.push(UpdateOp::Set(obj.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect()));
            }
            "$unset" => {
                let obj = value.as_object().ok_or_else(|| Error::invalid(InvalidKind::Update, "$unset expects an object"))?;
                ops.push(UpdateOp::Unset(obj.keys().cloned().collect()));
            }
            "$inc" => {
                let obj = value.as_object().ok_or_else(|| Error::invalid(InvalidKind::Update, "$inc expects an object"))?;
                ops.push(UpdateOp::Inc(obj.iter().map(|(k, v)| (k.clone(), v.as_f64().unwrap_or(0.0))).collect()));
            }
            "$push" => {
                let obj = value.as_object().ok_or_else(|| Error::invalid(InvalidKind::Update, "$push expects an object"))?;
                for (path, v) in obj {
                    ops.push(UpdateOp::Push { path: path.clone(), value: Value::from(v) });
                }
            }
            "$pull" => {
                let obj = value.as_object().ok_or_else(|| Error::invalid(InvalidKind::Update, "$pull expects an object"))?;
                for (path, v) in obj {
                    ops.push(UpdateOp::Pull { path: path.clone(), value: Value::from(v) });
                }
            }
            "$addToSet" => {
                let obj = value.as_object().ok_or_else(|| Error::invalid(InvalidKind::Update, "$addToSet expects an object"))?;
                for (path, v) in obj {
                    ops.push(UpdateOp::AddToSet { path: path.clone(), value: Value::from(v) });
                }
            }
            other => return Err(Error::invalid(InvalidKind::Update, format!("unknown update operator {other}"))),
        }
    }
    Ok(ops)
}

/// Applies update operators to an entity's user data in place. Reserved
/// fields (`version`, `updatedAt`, ...) are bumped by the caller, not here --
/// update operators only ever touch `data` (§3).
pub fn apply_update(data: &mut crate::value::OrderedMap, ops: &[UpdateOp]) -> DbResult<()> {
    for op in ops {
        match op {
            UpdateOp::Set(fields) => {
                for (k, v) in fields {
                    data.insert(k.clone(), v.clone());
                }
            }
            UpdateOp::Unset(keys) => {
                for k in keys {
                    data.shift_remove(k);
                }
            }
            UpdateOp::Inc(fields) => {
                for (k, delta) in fields {
                    let current = data.get(k).and_then(Value::as_f64).unwrap_or(0.0);
                    data.insert(k.clone(), Value::Float(current + delta));
                }
            }
            UpdateOp::Push { path, value } => {
                let entry = data.entry(path.clone()).or_insert_with(|| Value::Array(vec![]));
                match entry {
                    Value::Array(items) => items.push(value.clone()),
                    _ => return Err(Error::invalid(InvalidKind::Update, format!("{path} is not an array"))),
                }
            }
            UpdateOp::Pull { path, value } => {
                if let Some(Value::Array(items)) = data.get_mut(path) {
                    items.retain(|v| v != value);
                }
            }
            UpdateOp::AddToSet { path, value } => {
                let entry = data.entry(path.clone()).or_insert_with(|| Value::Array(vec![]));
                match entry {
                    Value::Array(items) => {
                        if !items.contains(value) {
                            items.push(value.clone());
                        }
                    }
                    _ => return Err(Error::invalid(InvalidKind::Update, format!("{path} is not an array"))),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::assemble_new;
    use crate::value::Instant;

    fn entity() -> Entity {
        assemble_new("posts", "Post", serde_json::json!({"name": "hi", "age": 30}), Instant::from_micros(0)).unwrap()
    }

    #[test]
    fn bare_value_leaf_parses_as_eq() {
        let filter = parse_filter(&serde_json::json!({"age": 30})).unwrap();
        assert!(eval(&filter, &entity()));
    }

    #[test]
    fn range_filter_matches_within_bounds() {
        let filter = parse_filter(&serde_json::json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
        assert!(eval(&filter, &entity()));
        let filter = parse_filter(&serde_json::json!({"age": {"$gte": 65}})).unwrap();
        assert!(!eval(&filter, &entity()));
    }

    #[test]
    fn and_or_not_compose() {
        let filter = parse_filter(&serde_json::json!({"$or": [{"age": 1}, {"name": "hi"}]})).unwrap();
        assert!(eval(&filter, &entity()));
        let filter = parse_filter(&serde_json::json!({"$not": {"name": "hi"}})).unwrap();
        assert!(!eval(&filter, &entity()));
    }

    #[test]
    fn set_and_inc_mutate_data() {
        let mut data = entity().data;
        let ops = parse_update(&serde_json::json!({"$set": {"city": "nyc"}, "$inc": {"age": 1}})).unwrap();
        apply_update(&mut data, &ops).unwrap();
        assert_eq!(data.get("city"), Some(&Value::String("nyc".into())));
        assert_eq!(data.get("age"), Some(&Value::Float(31.0)));
    }

    #[test]
    fn push_and_add_to_set_differ_on_duplicates() {
        let mut data = crate::value::OrderedMap::new();
        data.insert("tags".into(), Value::Array(vec![Value::String("a".into())]));
        let ops = parse_update(&serde_json::json!({"$addToSet": {"tags": "a"}})).unwrap();
        apply_update(&mut data, &ops).unwrap();
        assert_eq!(data["tags"], Value::Array(vec![Value::String("a".into())]));
        let ops = parse_update(&serde_json::json!({"$push": {"tags": "a"}})).unwrap();
        apply_update(&mut data, &ops).unwrap();
        assert_eq!(data["tags"], Value::Array(vec![Value::String("a".into()), Value::String("a".into())]));
    }
}

//! Query pushdown: filter lowering to statistics predicates and the
//! file/row-group skip rules they drive (§4.H).
//!
//! This module is pure, non-suspending computation (§5) -- it never touches
//! the blob store. [`crate::read`] is the caller that applies
//! [`StatsPredicate::skips`] against manifest-entry and row-group bounds.

use crate::filter::{CompareOp, Filter};
use crate::value::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsPredicate {
    pub column: String,
    pub op: PredicateOp,
}

/// Bounds the skip rule evaluates against (§4.H table). Missing bounds mean
/// "unknown" and the rule never fires (conservative: never skip).
#[derive(Debug, Clone, Default)]
pub struct ColumnBounds<'a> {
    pub min: Option<&'a Value>,
    pub max: Option<&'a Value>,
}

impl StatsPredicate {
    /// True if the row group/file provably contains no matching row, per
    /// the skip-rule table in §4.H.
    pub fn skips(&self, bounds: &ColumnBounds) -> bool {
        let (Some(min), Some(max)) = (bounds.min, bounds.max) else {
            return false;
        };
        let lt = |a: &Value, b: &Value| a.partial_compare(b) == Some(Ordering::Less);
        let gt = |a: &Value, b: &Value| a.partial_compare(b) == Some(Ordering::Greater);
        match &self.op {
            PredicateOp::Eq(v) => lt(v, min) || gt(v, max),
            PredicateOp::Gt(v) => !gt(max, v), // skip iff max <= v
            PredicateOp::Gte(v) => lt(max, v), // skip iff max < v
            PredicateOp::Lt(v) => !lt(min, v), // skip iff min >= v
            PredicateOp::Lte(v) => gt(min, v), // skip iff min > v
            PredicateOp::Ne(v) => min == max && min == v,
            PredicateOp::In(values) => values.iter().all(|v| lt(v, min) || gt(v, max)),
        }
    }
}

/// Transforms a filter into the ordered list of statistics predicates that
/// are eligible for bounds-based skipping (§4.H). `$or`, `$not`, `$nor`,
/// `$regex`, `$text`, `$vector`, and dotted paths that aren't in
/// `shredded_paths` produce no predicates -- they are residual-only.
pub fn lower(filter: &Filter, shredded_paths: &[String]) -> Vec<StatsPredicate> {
    let mut out = Vec::new();
    lower_into(filter, shredded_paths, &mut out);
    out
}

fn eligible_column(path: &str, shredded_paths: &[String]) -> Option<String> {
    if !path.contains('.') {
        return Some(path.to_string());
    }
    shredded_paths.iter().find(|p| p.as_str() == path).cloned()
}

fn lower_into(filter: &Filter, shredded_paths: &[String], out: &mut Vec<StatsPredicate>) {
    match filter {
        Filter::And(clauses) => {
            for clause in clauses {
                lower_into(clause, shredded_paths, out);
            }
        }
        Filter::Field { path, op } => {
            let Some(column) = eligible_column(path, shredded_paths) else { return };
            let predicate_op = match op {
                CompareOp::Eq(v) => Some(PredicateOp::Eq(v.clone())),
                CompareOp::Ne(v) => Some(PredicateOp::Ne(v.clone())),
                CompareOp::Gt(v) => Some(PredicateOp::Gt(v.clone())),
                CompareOp::Gte(v) => Some(PredicateOp::Gte(v.clone())),
                CompareOp::Lt(v) => Some(PredicateOp::Lt(v.clone())),
                CompareOp::Lte(v) => Some(PredicateOp::Lte(v.clone())),
                CompareOp::In(vs) => Some(PredicateOp::In(vs.clone())),
                // $nin, $regex, $startsWith, $exists: no skip rule defined, residual only.
                CompareOp::Nin(_) | CompareOp::Regex(_) | CompareOp::StartsWith(_) | CompareOp::Exists(_) => None,
            };
            if let Some(op) = predicate_op {
                out.push(StatsPredicate { column, op });
            }
        }
        // $or/$not/$nor/$text/$vector/MatchAll contribute no pushdown predicates.
        Filter::Or(_) | Filter::Not(_) | Filter::Nor(_) | Filter::Text(_) | Filter::Vector { .. } | Filter::MatchAll => {}
    }
}

/// Rewrites filters on shredded dotted paths (e.g. `$data.year`) to target
/// their typed sub-column, so they become eligible for [`lower`] (§4.H
/// "Shredded variants"). The rewritten path IS the sub-column name; storage
/// for shredded columns already uses the dotted path as its column name
/// (see `wal::encode_batch`).
pub fn rewrite_shredded(filter: &Filter, shredded_paths: &[String]) -> Filter {
    match filter {
        Filter::Field { path, op } if shredded_paths.iter().any(|p| p == path) => {
            Filter::Field { path: path.clone(), op: op.clone() }
        }
        Filter::And(clauses) => Filter::And(clauses.iter().map(|c| rewrite_shredded(c, shredded_paths)).collect()),
        Filter::Or(clauses) => Filter::Or(clauses.iter().map(|c| rewrite_shredded(c, shredded_paths)).collect()),
        Filter::Nor(clauses) => Filter::Nor(clauses.iter().map(|c| rewrite_shredded(c, shredded_paths)).collect()),
        Filter::Not(inner) => Filter::Not(Box::new(rewrite_shredded(inner, shredded_paths))),
        other => other.clone(),
    }
}

/// Counts leaves of a filter tree that are shredded-eligible vs. total
/// comparison leaves, for the "pushdown effectiveness" estimate (§4.H).
fn count_leaves(filter: &Filter, shredded_paths: &[String], shredded: &mut usize, total: &mut usize) {
    match filter {
        Filter::Field { path, .. } => {
            *total += 1;
            if eligible_column(path, shredded_paths).is_some() {
                *shredded += 1;
            }
        }
        Filter::And(cs) | Filter::Or(cs) | Filter::Nor(cs) => {
            for c in cs {
                count_leaves(c, shredded_paths, shredded, total);
            }
        }
        Filter::Not(inner) => count_leaves(inner, shredded_paths, shredded, total),
        Filter::Text(_) | Filter::Vector { .. } | Filter::MatchAll => {}
    }
}

pub const EFFECTIVENESS_THRESHOLD: f64 = 0.5;

/// `(#shredded leaves / #total leaves)`, and whether it clears the 0.5
/// threshold the planner logs against (§4.H).
pub fn pushdown_effectiveness(filter: &Filter, shredded_paths: &[String]) -> (f64, bool) {
    let mut shredded = 0usize;
    let mut total = 0usize;
    count_leaves(filter, shredded_paths, &mut shredded, &mut total);
    let ratio = if total == 0 { 0.0 } else { shredded as f64 / total as f64 };
    (ratio, ratio > EFFECTIVENESS_THRESHOLD)
}

/// The set of columns a scan must read: reserved entity columns, any
/// shredded column referenced by the filter, plus the caller's projection.
/// Non-shredded user fields always require the `$data` variant column
/// (§4.H "Projection").
pub fn projected_columns(filter: &Filter, shredded_paths: &[String], user_projection: &[String]) -> Vec<String> {
    use crate::entity::{FIELD_CREATED_AT, FIELD_DATA, FIELD_DELETED_AT, FIELD_ID, FIELD_NAME, FIELD_TYPE, FIELD_UPDATED_AT, FIELD_VERSION};
    let mut columns: Vec<String> = vec![
        FIELD_ID, FIELD_TYPE, FIELD_NAME, FIELD_VERSION, FIELD_CREATED_AT, FIELD_UPDATED_AT, FIELD_DELETED_AT,
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    let mut referenced = Vec::new();
    collect_referenced_paths(filter, &mut referenced);
    for path in referenced {
        if let Some(col) = eligible_column(&path, shredded_paths) {
            if !columns.contains(&col) {
                columns.push(col);
            }
        } else if !columns.contains(&FIELD_DATA.to_string()) {
            columns.push(FIELD_DATA.to_string());
        }
    }

    if user_projection.is_empty() {
        if !columns.contains(&FIELD_DATA.to_string()) {
            columns.push(FIELD_DATA.to_string());
        }
    } else {
        for field in user_projection {
            if let Some(col) = eligible_column(field, shredded_paths) {
                if !columns.contains(&col) {
                    columns.push(col);
                }
            } else if !columns.contains(&FIELD_DATA.to_string()) {
                columns.push(FIELD_DATA.to_string());
            }
        }
    }
    columns
}

fn collect_referenced_paths(filter: &Filter, out: &mut Vec<String>) {
    match filter {
        Filter::Field { path, .. } => out.push(path.clone()),
        Filter::And(cs) | Filter::Or(cs) | Filter::Nor(cs) => {
            for c in cs {
                collect_referenced_paths(c, out);
            }
        }
        Filter::Not(inner) => collect_referenced_paths(inner, out),
        Filter::Text(_) | Filter::Vector { .. } | Filter::MatchAll => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse_filter;

    #[test]
    fn range_filter_skips_disjoint_row_group() {
        let filter = parse_filter(&serde_json::json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
        let predicates = lower(&filter, &[]);
        assert_eq!(predicates.len(), 2);

        let within = ColumnBounds { min: Some(&Value::Int(20)), max: Some(&Value::Int(50)) };
        assert!(!predicates.iter().any(|p| p.skips(&within)));

        let above = ColumnBounds { min: Some(&Value::Int(70)), max: Some(&Value::Int(90)) };
        assert!(predicates.iter().any(|p| p.skips(&above)));

        let below = ColumnBounds { min: Some(&Value::Int(10)), max: Some(&Value::Int(15)) };
        assert!(predicates.iter().any(|p| p.skips(&below)));
    }

    #[test]
    fn missing_stats_never_skip() {
        let filter = parse_filter(&serde_json::json!({"age": 30})).unwrap();
        let predicates = lower(&filter, &[]);
        let unknown = ColumnBounds::default();
        assert!(!predicates.iter().any(|p| p.skips(&unknown)));
    }

    #[test]
    fn or_and_regex_produce_no_predicates() {
        let filter = parse_filter(&serde_json::json!({"$or": [{"age": 1}, {"age": 2}]})).unwrap();
        assert!(lower(&filter, &[]).is_empty());
        let filter = parse_filter(&serde_json::json!({"name": {"$regex": "a.*"}})).unwrap();
        assert!(lower(&filter, &[]).is_empty());
    }

    #[test]
    fn dotted_path_requires_shredded_declaration() {
        let filter = parse_filter(&serde_json::json!({"year.month": 7})).unwrap();
        assert!(lower(&filter, &[]).is_empty());
        assert_eq!(lower(&filter, &["year.month".to_string()]).len(), 1);
    }

    #[test]
    fn effectiveness_reports_ratio_and_threshold() {
        let filter = parse_filter(&serde_json::json!({"$and": [{"year.month": 7}, {"name": "x"}]})).unwrap();
        let (ratio, over) = pushdown_effectiveness(&filter, &["year.month".to_string()]);
        assert_eq!(ratio, 0.5);
        assert!(!over); // strictly greater than the threshold is required
    }

    #[test]
    fn projection_always_includes_data_for_non_shredded_fields() {
        let filter = parse_filter(&serde_json::json!({"age": 30})).unwrap();
        let columns = projected_columns(&filter, &[], &[]);
        assert!(columns.contains(&"$data".to_string()));
    }
}

//! Scenario 5 from spec.md §8: the row-group/manifest-entry skip decision
//! for a range filter against three different bound ranges.

use lakedoc::filter::parse_filter;
use lakedoc::pushdown::{lower, ColumnBounds};
use lakedoc::Value;

fn bounds(min: i64, max: i64) -> (Value, Value) {
    (Value::Int(min), Value::Int(max))
}

#[test]
fn age_range_filter_skips_exactly_the_disjoint_bounds() {
    let filter = parse_filter(&serde_json::json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
    let predicates = lower(&filter, &[]);
    assert_eq!(predicates.len(), 2); // one predicate per comparison op

    let skips = |min: i64, max: i64| {
        let (min, max) = bounds(min, max);
        let column_bounds = ColumnBounds { min: Some(&min), max: Some(&max) };
        predicates.iter().any(|p| p.skips(&column_bounds))
    };

    assert!(!skips(20, 50), "overlapping range [20,50] must not be skipped");
    assert!(skips(70, 90), "range entirely above the filter's upper bound must be skipped");
    assert!(skips(10, 15), "range entirely below the filter's lower bound must be skipped");
}

#[test]
fn missing_statistics_are_never_skipped() {
    let filter = parse_filter(&serde_json::json!({"age": {"$gte": 18}})).unwrap();
    let predicates = lower(&filter, &[]);
    let column_bounds = ColumnBounds { min: None, max: None };
    assert!(predicates.iter().all(|p| !p.skips(&column_bounds)));
}

//! Materialized-view optimizer: candidate discovery, cost model, staleness
//! detection, and filter-implication rewriting (§4.J).
//!
//! This module is pure, non-suspending computation like [`crate::pushdown`]
//! -- it decides *whether* to use a materialized view and how to rewrite the
//! query, but does not itself read or refresh anything; the caller (`db`)
//! supplies table statistics and issues the chosen query.

use crate::filter::{CompareOp, Filter};
use crate::value::Instant;
use std::collections::HashSet;

/// A persisted, named query over one source namespace (§4.J).
#[derive(Debug, Clone)]
pub struct MvDefinition {
    pub from: String,
    pub filter: Option<Filter>,
    pub select: Option<Vec<String>>,
    pub group_by: Option<Vec<String>>,
    /// Opaque pipeline stages (`$compute`/`$expand`/`$flatten`); the
    /// optimizer only needs to know a view carries them, not their shape.
    pub compute: Option<serde_json::Value>,
    pub expand: Option<serde_json::Value>,
    pub flatten: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct MvMetadata {
    pub last_refreshed_at: Instant,
    pub row_count: u64,
    pub lineage: String,
    /// Source namespace's commit version at the time of the last refresh,
    /// used to compute staleness against the current source version.
    pub source_version_at_refresh: u64,
}

#[derive(Debug, Clone)]
pub struct MaterializedView {
    pub name: String,
    pub definition: MvDefinition,
    pub metadata: MvMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
pub struct StalenessReport {
    pub status: Staleness,
    pub percent: f64,
}

/// Summarizes an MV's staleness relative to its source's current commit
/// version. `Invalid` covers structural breakage (the view's `$from` no
/// longer matches the queried namespace); otherwise staleness grows with
/// how many source commits have landed since the view was last refreshed.
pub fn staleness(mv: &MaterializedView, queried_namespace: &str, source_current_version: u64) -> StalenessReport {
    if mv.definition.from != queried_namespace {
        return StalenessReport { status: Staleness::Invalid, percent: 100.0 };
    }
    if source_current_version <= mv.metadata.source_version_at_refresh {
        return StalenessReport { status: Staleness::Fresh, percent: 0.0 };
    }
    let behind = source_current_version - mv.metadata.source_version_at_refresh;
    let percent = (behind as f64 / source_current_version.max(1) as f64 * 100.0).min(100.0);
    StalenessReport { status: Staleness::Stale, percent }
}

/// Options controlling the optimizer's decision (§4.J steps 1/4).
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    pub min_coverage_score: f64,
    pub min_cost_savings: f64,
    pub max_staleness_percent: f64,
    pub allow_stale_reads: bool,
    /// Per-row scan cost unit, shared by source and MV cost estimates.
    pub per_row_scan_cost: f64,
    /// Further cost reduction applied to MV scans beyond row-count
    /// reduction (an MV is assumed pre-filtered/pre-compacted).
    pub base_reduction: f64,
    /// Additional reduction for aggregation (`$groupBy`) MVs.
    pub aggregation_reduction: f64,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        OptimizeOptions {
            min_coverage_score: 0.8,
            min_cost_savings: 0.1,
            max_staleness_percent: 50.0,
            allow_stale_reads: true,
            per_row_scan_cost: 1.0,
            base_reduction: 0.5,
            aggregation_reduction: 0.5,
        }
    }
}

/// The query being optimized: a namespace, a filter, and whether it's an
/// aggregate query (only aggregation MVs are eligible candidates for those).
#[derive(Debug, Clone)]
pub struct OptimizeQuery<'a> {
    pub namespace: &'a str,
    pub filter: &'a Filter,
    pub is_aggregate: bool,
    pub requested_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CandidateExplanation {
    pub name: String,
    pub coverage: f64,
    pub compatible: bool,
    pub staleness: StalenessReport,
    pub source_cost: f64,
    pub mv_cost: f64,
    pub savings: f64,
    pub rejected_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OptimizeResult {
    pub candidates: Vec<CandidateExplanation>,
    pub selected: Option<String>,
    pub use_mv: bool,
    pub rewritten_filter: Filter,
    pub source_cost: f64,
    pub mv_cost: Option<f64>,
    pub savings: Option<f64>,
    pub explanation: String,
}

/// Flattens the top-level `$and` conjunction into leaf `(path, op)` clauses,
/// the same restricted traversal [`crate::pushdown::lower`] uses -- `$or`/
/// `$not`/`$nor` are not decomposed, so an MV filter containing them is
/// never considered compatible (conservative, never a false "implies").
fn and_leaves(filter: &Filter) -> Vec<(&str, &CompareOp)> {
    fn walk<'a>(filter: &'a Filter, out: &mut Vec<(&'a str, &'a CompareOp)>) -> bool {
        match filter {
            Filter::And(clauses) => clauses.iter().all(|c| walk(c, out)),
            Filter::Field { path, op } => {
                out.push((path, op));
                true
            }
            Filter::MatchAll => true,
            _ => false,
        }
    }
    let mut out = Vec::new();
    if walk(filter, &mut out) {
        out
    } else {
        Vec::new()
    }
}

/// True iff `query_filter` implies `mv_filter` (§4.J step 2): every leaf
/// clause of `mv_filter` appears verbatim among `query_filter`'s leaves.
fn implies(query_filter: &Filter, mv_filter: &Filter) -> bool {
    let mv_leaves = and_leaves(mv_filter);
    if mv_leaves.is_empty() && !matches!(mv_filter, Filter::MatchAll) {
        return false; // mv_filter used $or/$not/$nor: can't prove implication
    }
    let query_leaves = and_leaves(query_filter);
    mv_leaves.iter().all(|(path, op)| query_leaves.iter().any(|(qp, qop)| qp == path && qop == op))
}

/// Field coverage: fraction of `requested_fields` the MV's `$select` covers.
/// An MV with no `$select` carries every source field, so coverage is 1.0.
fn coverage(mv: &MvDefinition, requested_fields: &[String]) -> f64 {
    if requested_fields.is_empty() {
        return 1.0;
    }
    match &mv.select {
        None => 1.0,
        Some(selected) => {
            let selected: HashSet<&str> = selected.iter().map(|s| s.as_str()).collect();
            let covered = requested_fields.iter().filter(|f| selected.contains(f.as_str())).count();
            covered as f64 / requested_fields.len() as f64
        }
    }
}

/// Strips clauses of `query_filter` that are implied by `mv_filter` (§4.J
/// step 5) -- they are already enforced by the view's own definition.
fn rewrite(query_filter: &Filter, mv_filter: &Filter) -> Filter {
    let mv_leaves = and_leaves(mv_filter);
    fn strip(filter: &Filter, mv_leaves: &[(&str, &CompareOp)]) -> Option<Filter> {
        match filter {
            Filter::Field { path, op } => {
                if mv_leaves.iter().any(|(p, o)| *p == path && *o == op) {
                    None
                } else {
                    Some(Filter::Field { path: path.clone(), op: op.clone() })
                }
            }
            Filter::And(clauses) => {
                let remaining: Vec<Filter> = clauses.iter().filter_map(|c| strip(c, mv_leaves)).collect();
                match remaining.len() {
                    0 => Some(Filter::MatchAll),
                    1 => Some(remaining.into_iter().next().unwrap()),
                    _ => Some(Filter::And(remaining)),
                }
            }
            other => Some(other.clone()),
        }
    }
    strip(query_filter, &mv_leaves).unwrap_or(Filter::MatchAll)
}

fn cost(row_count: u64, opts: &OptimizeOptions) -> f64 {
    row_count as f64 * opts.per_row_scan_cost
}

/// Runs the full candidate → compatibility → cost → decision → rewrite
/// pipeline (§4.J).
pub fn optimize(
    query: &OptimizeQuery,
    source_row_count: u64,
    source_current_version: u64,
    views: &[MaterializedView],
    opts: &OptimizeOptions,
) -> OptimizeResult {
    let source_cost = cost(source_row_count, opts);
    let mut candidates = Vec::new();
    let mut best: Option<(&MaterializedView, f64, f64, f64)> = None; // (mv, mv_cost, savings, staleness_pct)

    for mv in views {
        if mv.definition.from != query.namespace {
            continue;
        }
        if mv.definition.group_by.is_some() && !query.is_aggregate {
            continue;
        }
        let cov = coverage(&mv.definition, &query.requested_fields);
        if cov < opts.min_coverage_score {
            continue;
        }
        let compatible = match &mv.definition.filter {
            None => true,
            Some(f) => implies(query.filter, f),
        };
        let stale = staleness(mv, query.namespace, source_current_version);

        let mut rejected_reason = None;
        if !compatible {
            rejected_reason = Some("query filter does not imply the view's filter".to_string());
        } else if stale.status == Staleness::Invalid {
            rejected_reason = Some("view is structurally invalid for this namespace".to_string());
        } else if !opts.allow_stale_reads && stale.status == Staleness::Stale {
            rejected_reason = Some("stale reads disallowed and view is stale".to_string());
        } else if stale.percent > opts.max_staleness_percent {
            rejected_reason = Some(format!("staleness {:.1}% exceeds max {:.1}%", stale.percent, opts.max_staleness_percent));
        }

        let mv_cost_base = cost(mv.metadata.row_count, opts) * opts.base_reduction;
        let mv_cost = if mv.definition.group_by.is_some() { mv_cost_base * opts.aggregation_reduction } else { mv_cost_base }
            * (1.0 + stale.percent / 100.0);
        let savings = if source_cost > 0.0 { (source_cost - mv_cost) / source_cost } else { 0.0 };

        if rejected_reason.is_none() && savings >= opts.min_cost_savings {
            let better = match &best {
                None => true,
                Some((_, _, best_savings, _)) => savings > *best_savings,
            };
            if better {
                best = Some((mv, mv_cost, savings, stale.percent));
            }
        }

        candidates.push(CandidateExplanation {
            name: mv.name.clone(),
            coverage: cov,
            compatible,
            staleness: stale,
            source_cost,
            mv_cost,
            savings,
            rejected_reason,
        });
    }

    match best {
        Some((mv, mv_cost, savings, _)) => {
            let mv_filter = mv.definition.filter.clone().unwrap_or(Filter::MatchAll);
            let rewritten_filter = rewrite(query.filter, &mv_filter);
            OptimizeResult {
                explanation: format!("selected view '{}': {:.1}% estimated cost savings over source scan", mv.name, savings * 100.0),
                selected: Some(mv.name.clone()),
                use_mv: true,
                rewritten_filter,
                source_cost,
                mv_cost: Some(mv_cost),
                savings: Some(savings),
                candidates,
            }
        }
        None => OptimizeResult {
            explanation: "no view cleared the cost-savings threshold; using source".to_string(),
            selected: None,
            use_mv: false,
            rewritten_filter: query.filter.clone(),
            source_cost,
            mv_cost: None,
            savings: None,
            candidates,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn active_filter() -> Filter {
        Filter::Field { path: "status".to_string(), op: CompareOp::Eq(Value::String("active".to_string())) }
    }

    fn view(name: &str, row_count: u64, refreshed_version: u64) -> MaterializedView {
        MaterializedView {
            name: name.to_string(),
            definition: MvDefinition {
                from: "orders".to_string(),
                filter: Some(active_filter()),
                select: None,
                group_by: None,
                compute: None,
                expand: None,
                flatten: None,
            },
            metadata: MvMetadata {
                last_refreshed_at: Instant::from_micros(0),
                row_count,
                lineage: "orders".to_string(),
                source_version_at_refresh: refreshed_version,
            },
        }
    }

    #[test]
    fn concrete_scenario_selects_mv_and_strips_implied_clause() {
        let query_filter = Filter::And(vec![
            active_filter(),
            Filter::Field { path: "total".to_string(), op: CompareOp::Gt(Value::Int(100)) },
        ]);
        let query = OptimizeQuery { namespace: "orders", filter: &query_filter, is_aggregate: false, requested_fields: vec![] };
        let views = vec![view("active_orders", 10_000, 5)];
        let result = optimize(&query, 1_000_000, 5, &views, &OptimizeOptions::default());

        assert!(result.use_mv);
        assert_eq!(result.selected.as_deref(), Some("active_orders"));
        match &result.rewritten_filter {
            Filter::Field { path, op } => {
                assert_eq!(path, "total");
                assert_eq!(*op, CompareOp::Gt(Value::Int(100)));
            }
            other => panic!("expected a single residual clause, got {other:?}"),
        }
    }

    #[test]
    fn incompatible_filter_is_rejected() {
        let query_filter = Filter::Field { path: "status".to_string(), op: CompareOp::Eq(Value::String("cancelled".to_string())) };
        let query = OptimizeQuery { namespace: "orders", filter: &query_filter, is_aggregate: false, requested_fields: vec![] };
        let views = vec![view("active_orders", 10_000, 5)];
        let result = optimize(&query, 1_000_000, 5, &views, &OptimizeOptions::default());
        assert!(!result.use_mv);
        assert_eq!(result.candidates[0].rejected_reason.as_deref(), Some("query filter does not imply the view's filter"));
    }

    #[test]
    fn stale_view_rejected_when_stale_reads_disallowed() {
        let query = OptimizeQuery { namespace: "orders", filter: &Filter::MatchAll, is_aggregate: false, requested_fields: vec![] };
        let mut v = view("all_orders", 10_000, 5);
        v.definition.filter = None;
        let views = vec![v];
        let opts = OptimizeOptions { allow_stale_reads: false, ..Default::default() };
        let result = optimize(&query, 1_000_000, 50, &views, &opts);
        assert!(!result.use_mv);
    }

    #[test]
    fn aggregation_view_ignored_for_non_aggregate_query() {
        let query = OptimizeQuery { namespace: "orders", filter: &Filter::MatchAll, is_aggregate: false, requested_fields: vec![] };
        let mut v = view("orders_by_status", 10, 5);
        v.definition.filter = None;
        v.definition.group_by = Some(vec!["status".to_string()]);
        let views = vec![v];
        let result = optimize(&query, 1_000_000, 5, &views, &OptimizeOptions::default());
        assert!(result.candidates.is_empty());
        assert!(!result.use_mv);
    }

    #[test]
    fn staleness_is_fresh_when_versions_match() {
        let v = view("active_orders", 10_000, 5);
        let report = staleness(&v, "orders", 5);
        assert_eq!(report.status, Staleness::Fresh);
        assert_eq!(report.percent, 0.0);
    }

    #[test]
    fn staleness_is_invalid_when_namespace_mismatches() {
        let v = view("active_orders", 10_000, 5);
        let report = staleness(&v, "other_namespace", 5);
        assert_eq!(report.status, Staleness::Invalid);
    }
}

//! A minimal full-text scorer (§4.I supplement).
//!
//! RRF fusion needs two independent rankings to fuse; the spec names
//! `$ftsRank` as one of them but otherwise leaves full text unspecified.
//! This is deliberately a term-frequency "good enough" match, not an
//! inverted-index search engine -- that scope is explicitly out (§ Non-goals,
//! "a full-text search engine beyond the minimal scorer needed for RRF
//! fusion is likewise out of scope").

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// Term-frequency overlap score between a query and a document: the count of
/// query tokens present in the document, normalized by query length. Ties
/// are broken by the caller via stable sort.
pub fn score(query: &str, document: &str) -> f32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens: std::collections::HashSet<String> = tokenize(document).into_iter().collect();
    let hits = query_tokens.iter().filter(|t| doc_tokens.contains(*t)).count();
    hits as f32 / query_tokens.len() as f32
}

/// Ranks a set of `(doc_id, text)` pairs against `query`, descending by
/// score, dropping zero-score documents. Ties keep input order (stable sort)
/// so ranking is deterministic given the same input order.
pub fn rank<'a>(query: &str, documents: impl Iterator<Item = (&'a str, &'a str)>) -> Vec<(&'a str, f32)> {
    let mut scored: Vec<(&str, f32)> = documents.map(|(id, text)| (id, score(query, text))).filter(|(_, s)| *s > 0.0).collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

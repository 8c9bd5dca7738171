//! Vector search: the HNSW approximate-nearest-neighbor graph ([`hnsw`]),
//! hybrid pre-/post-filter strategies and RRF fusion ([`hybrid`]), and the
//! minimal full-text scorer RRF fuses against ([`fts`]) (§4.I).

pub mod fts;
pub mod hnsw;
pub mod hybrid;

pub use hnsw::{HnswConfig, HnswIndex};
pub use hybrid::{hybrid_search, HybridOptions, HybridResult, HybridStrategy};

//! `lakedoc` -- an embeddable document database whose on-disk representation
//! is a set of open lakehouse tables (Apache Iceberg and Delta Lake) over a
//! pluggable blob store (SPEC_FULL §1).
//!
//! [`Database`] is the single stateful handle client code holds; it is
//! assembled from the modules below the way the teacher kernel assembles a
//! `Table` from its `log_segment`, `schema`, and `scan` modules: a blob
//! store capability ([`blob`]), a columnar codec ([`columnar`], [`value`]),
//! two commit-coordinator dialects ([`iceberg`], [`delta`]) behind one
//! retry loop ([`commit`]), a write-ahead log and batcher ([`wal`]), the
//! read path and its pushdown planner ([`read`], [`pushdown`], [`filter`]),
//! and the two indexes layered on top ([`vector`], [`mview`]).
//!
//! Nothing here reaches for a process-level singleton (Design Notes §9):
//! every piece is constructed with the state it needs and held by
//! [`Database`] or passed to it explicitly.

pub mod blob;
pub mod cancel;
pub mod columnar;
pub mod commit;
pub mod db;
pub mod delta;
pub mod embed;
pub mod entity;
pub mod error;
pub mod filter;
pub mod iceberg;
pub mod maintenance;
pub mod mview;
pub mod pushdown;
pub mod read;
pub mod schema;
pub mod util;
pub mod value;
pub mod vector;
pub mod wal;

pub use blob::{BlobStore, LocalFsBlobStore, MemoryBlobStore, WriteOptions};
pub use db::{DbConfig, Database, DeleteManyResult, FindOptions, Projection, Snapshot, SortDirection};
pub use embed::{Embedder, EmbeddingCache};
pub use entity::{Entity, EntityId};
pub use error::{DbResult, Error, InvalidKind};
pub use filter::{Filter, UpdateOp};
pub use maintenance::{compact, vacuum, CompactOptions, MaintenanceReport, VacuumOptions};
pub use mview::{MaterializedView, MvDefinition, MvMetadata, OptimizeOptions, OptimizeQuery, OptimizeResult};
pub use read::TableFormat;
pub use value::{Instant, Value};
pub use vector::{hybrid_search, HnswConfig, HnswIndex, HybridOptions, HybridResult, HybridStrategy};

/// The crate version, re-exported the way the teacher exposes its own
/// build metadata to callers that want to log it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

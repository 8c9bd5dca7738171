//! The Delta Lake table dialect (§4.D').
//!
//! [`actions`] models the JSON action records; [`log`] is the
//! newline-delimited commit-file codec; [`checkpoint`] is the Parquet
//! checkpoint writer/reader; [`commit`] wires all three into a
//! [`crate::commit::CommitDialect`].

pub mod actions;
pub mod checkpoint;
pub mod commit;
pub mod log;

pub use commit::DeltaDialect;

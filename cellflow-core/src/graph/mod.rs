//! Dual Dependency Graphs
//!
//! The engine tracks two relations over the same set of cells:
//!
//! - The dependency graph: an edge from producer to consumer for every
//!   declared dependency of a derived cell. Fixed at cell construction.
//! - The pointer graph: an edge from pointed-to cell to pointer holder for
//!   every committed pointer value. Rewired as pointer values change.
//!
//! Keeping the relations separate matters for update scheduling: a value
//! flowing through a dependency edge feeds a recomputation, while a value
//! flowing through a pointer edge is surfaced as-is by the holder. The
//! update engine traverses their union when deciding what might change, and
//! each graph individually when deciding what is safe to recompute.

mod dag;

pub use dag::{partial_topological_sort, strictly_reachable, Dag};

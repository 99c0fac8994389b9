//! Cellflow Core
//!
//! This crate provides the core runtime of Cellflow, a reactive
//! incremental-computation engine. It implements:
//!
//! - Typed cells: sources written from outside and derived cells computed
//!   from fixed dependency lists, with memoization and change cutoff
//! - A dual-graph model: the dependency graph plus a pointer graph for
//!   cells whose value is itself a reference to another cell
//! - A wave-based update engine with rank-based cancellation, so stale
//!   asynchronous results are discarded instead of clobbering newer ones
//! - Error values that flow through the graph like data, with a registry
//!   of failing cells
//! - Scopes for grouped teardown, mark-based collection of unobserved
//!   subgraphs, and an optional persistence side channel
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `cell`: cell identity, the value model, and the public handles
//! - `graph`: graph storage and the reachability machinery of the update
//!   engine
//! - `engine`: the engine context, the update algorithm, and scopes
//! - `storage`: the pluggable persistence backend
//! - `debug`: read-only snapshots and DOT export
//!
//! # Example
//!
//! ```rust
//! use cellflow_core::{Compute, Engine};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let engine: Engine<i64> = Engine::new();
//!
//!     let a = engine.new_source(3);
//!     let b = engine.new_source(5);
//!     let sum = engine
//!         .derive(&[a.id(), b.id()], |v| Compute::Value(v[0] + v[1]))
//!         .unwrap();
//!     assert_eq!(sum.value(), Some(Ok(8)));
//!
//!     // one write settles the whole affected region
//!     a.set(8).await;
//!     assert_eq!(sum.value(), Some(Ok(13)));
//! }
//! ```

pub mod cell;
pub mod debug;
pub mod engine;
pub mod error;
pub mod graph;
pub mod storage;

pub use cell::{CellId, CellRef, CellValue, Compute, DerivedCell, SourceCell, Subscription, Value};
pub use engine::{DeriveOptions, Engine, EngineBuilder, EngineStats, Scope};
pub use error::{CellError, EngineError};
pub use storage::{json_marshaller, MemoryStorage, Storage};

//! Cells
//!
//! The unit of state in the engine. A *source* cell is written from
//! outside; a *derived* cell recomputes from a fixed list of dependencies.
//! Either kind may hold a plain value, an error value, or a pointer at
//! another cell, and either kind starts out unset until its first value
//! arrives.
//!
//! Handles ([`SourceCell`], [`DerivedCell`]) are cheap clones into the
//! engine; the engine-internal record per cell lives in `slot`.

pub(crate) mod handle;
pub(crate) mod id;
pub(crate) mod slot;
pub(crate) mod value;

pub use handle::{CellRef, DerivedCell, SourceCell, Subscription};
pub use id::{CellId, Rank, SubscriberId};
pub use slot::{ComputeFn, SubscriberFn};
pub use value::{CellValue, Compute, Value};

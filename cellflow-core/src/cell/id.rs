//! Cell Identity
//!
//! This module defines the identifier and rank types used throughout the
//! engine. Identifiers are allocated from process-wide atomic counters and
//! are never reused, so a stale handle can never alias a newer cell.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    /// Allocate a new unique cell ID.
    pub fn fresh() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computation rank of a cell.
///
/// Every computation started at a cell carries the rank it was started
/// under. Commits are gated on it: a completion with a rank lower than the
/// rank of the value already committed is stale and gets discarded. The
/// invariant `value_rank <= current_rank` holds at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Rank(u64);

impl Rank {
    /// Advance to the next rank and return it.
    pub fn bump(&mut self) -> Rank {
        self.0 += 1;
        *self
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a subscriber attached to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a new unique subscriber ID.
    pub fn fresh() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

//! Cell State
//!
//! The engine-internal record kept for every cell: its kind, its fixed
//! dependency list, the committed value, and the two ranks that drive
//! cancellation.
//!
//! # Ranks
//!
//! `current_rank` advances every time a computation is started at the cell,
//! `value_rank` records the rank of the committed value. The cell is settled
//! when the two are equal; a gap means a computation is in flight. Commits
//! carrying a rank below `value_rank` are stale results of superseded
//! computations and are discarded.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::cell::id::{CellId, Rank, SubscriberId};
use crate::cell::value::{CellValue, Compute, Value};

/// A derived cell's compute function. Receives the dereferenced dependency
/// values in declaration order, plus the cell's previous plain value when
/// the cell was built with `use_previous`.
pub type ComputeFn<V> = Arc<dyn Fn(&[V], Option<&V>) -> Compute<V> + Send + Sync>;

/// A subscriber callback. Only ever invoked with a defined value.
pub type SubscriberFn<V> = Arc<dyn Fn(&CellValue<V>) + Send + Sync>;

pub(crate) enum CellKind<V> {
    /// Externally written, no dependencies.
    Source,
    /// Computed from its dependency list.
    Derived {
        compute: ComputeFn<V>,
        /// Pass the previous committed plain value to the compute function.
        use_previous: bool,
        /// The function is not expected to fail; error results are logged.
        no_fail: bool,
    },
}

pub(crate) struct CellSlot<V> {
    pub id: CellId,
    pub kind: CellKind<V>,
    /// Fixed at construction, in declaration order. Empty for sources.
    pub dependencies: SmallVec<[CellId; 4]>,
    /// None until the first commit.
    pub value: Option<Value<V>>,
    pub value_rank: Rank,
    pub current_rank: Rank,
    /// Whether the cell currently holds (or, before the first commit, may
    /// still turn out to hold) a pointer. Conservatively true until a plain
    /// value is committed.
    pub is_pointer: bool,
    /// Current pointer target, mirrored in the pointer graph.
    pub pointed: Option<CellId>,
    pub subscribers: Vec<(SubscriberId, SubscriberFn<V>)>,
    /// Key under which committed plain values are persisted.
    pub storage_key: Option<String>,
    /// Whether the committed value is an error originating here, i.e. an
    /// entry exists for this cell in the error registry.
    pub registered_error: bool,
}

impl<V> CellSlot<V> {
    pub fn source(id: CellId) -> Self {
        CellSlot {
            id,
            kind: CellKind::Source,
            dependencies: SmallVec::new(),
            value: None,
            value_rank: Rank::default(),
            current_rank: Rank::default(),
            is_pointer: true,
            pointed: None,
            subscribers: Vec::new(),
            storage_key: None,
            registered_error: false,
        }
    }

    pub fn derived(
        id: CellId,
        dependencies: SmallVec<[CellId; 4]>,
        compute: ComputeFn<V>,
        use_previous: bool,
        no_fail: bool,
    ) -> Self {
        CellSlot {
            id,
            kind: CellKind::Derived { compute, use_previous, no_fail },
            dependencies,
            value: None,
            value_rank: Rank::default(),
            current_rank: Rank::default(),
            is_pointer: true,
            pointed: None,
            subscribers: Vec::new(),
            storage_key: None,
            registered_error: false,
        }
    }

    /// No computation in flight.
    pub fn settled(&self) -> bool {
        self.value_rank == self.current_rank
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, CellKind::Derived { .. })
    }

    /// The previous committed plain value, for `use_previous` functions.
    pub fn plain_value(&self) -> Option<&V> {
        match &self.value {
            Some(Value::Val(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_source_is_settled_and_unset() {
        let slot: CellSlot<i32> = CellSlot::source(CellId::fresh());
        assert!(slot.settled());
        assert!(slot.value.is_none());
        assert!(slot.is_pointer);
    }

    #[test]
    fn rank_gap_means_in_flight() {
        let mut slot: CellSlot<i32> = CellSlot::source(CellId::fresh());
        slot.current_rank.bump();
        assert!(!slot.settled());
        slot.value_rank = slot.current_rank;
        assert!(slot.settled());
    }

    #[test]
    fn plain_value_skips_pointers_and_errors() {
        let mut slot: CellSlot<i32> = CellSlot::source(CellId::fresh());
        assert!(slot.plain_value().is_none());
        slot.value = Some(Value::Val(7));
        assert_eq!(slot.plain_value(), Some(&7));
        slot.value = Some(Value::Cell(CellId::fresh()));
        assert!(slot.plain_value().is_none());
    }
}

//! Error Types
//!
//! Two distinct failure families live here and must not be confused:
//!
//! - [`EngineError`] is a structural error: the caller asked for something
//!   the graph cannot do (deleting a cell that still has dependents,
//!   deriving from a deleted cell, functionally updating a pointer). These
//!   are returned as `Result::Err` from engine and handle methods.
//! - [`CellError`] is a value. A failed computation commits an error value
//!   into its cell, the error flows through the graph like any other value,
//!   and readers receive it from `get()` and subscriptions. Reading an
//!   error-valued cell is not itself an error.

use std::fmt;
use std::sync::Arc;

use crate::cell::CellId;

/// Structural errors returned by graph-mutating operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Deletion refused: the listed cells still depend on a cell in the
    /// deletion set. Nothing was deleted.
    #[error("cells still referenced by {0:?}")]
    ReferencesLeft(Vec<CellId>),

    /// The cell no longer exists in the engine.
    #[error("cell {0} has been deleted")]
    Deleted(CellId),

    /// The cell has never held a value.
    #[error("cell {0} is not initialized")]
    Uninitialized(CellId),

    /// The cell currently holds an error value.
    #[error("cell {0} holds an error")]
    ErrorValue(CellId),

    /// The cell currently points at another cell.
    #[error("cell {0} is a pointer")]
    PointerCell(CellId),

    /// The cell has an outstanding computation.
    #[error("cell {0} has a computation in flight")]
    Busy(CellId),
}

/// An error produced by a cell computation.
///
/// The `source` is the cell where the error originated. Cells downstream of
/// a failed cell carry the same `Arc<CellError>`, so `source` identifies the
/// origin no matter where the error was observed.
#[derive(Debug, PartialEq, Eq)]
pub struct CellError {
    source: CellId,
    source_name: Option<String>,
    reason: String,
}

impl CellError {
    pub(crate) fn new(source: CellId, source_name: Option<String>, reason: impl Into<String>) -> Arc<Self> {
        Arc::new(CellError {
            source,
            source_name,
            reason: reason.into(),
        })
    }

    /// Cell where the error originated.
    pub fn source(&self) -> CellId {
        self.source
    }

    /// Name of the originating cell, when one was assigned.
    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    /// Human-readable failure reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub(crate) fn is_origin(&self, id: CellId) -> bool {
        self.source == id
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source_name {
            Some(name) => write!(f, "cell {} has an error: {}", name, self.reason),
            None => write!(f, "cell {} has an error: {}", self.source, self.reason),
        }
    }
}

impl std::error::Error for CellError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_error_display_prefers_name() {
        let id = CellId::fresh();
        let named = CellError::new(id, Some("price".into()), "divide by zero");
        assert_eq!(format!("{named}"), "cell price has an error: divide by zero");

        let anon = CellError::new(id, None, "divide by zero");
        assert_eq!(format!("{anon}"), format!("cell {id} has an error: divide by zero"));
    }

    #[test]
    fn origin_check() {
        let a = CellId::fresh();
        let b = CellId::fresh();
        let err = CellError::new(a, None, "boom");
        assert!(err.is_origin(a));
        assert!(!err.is_origin(b));
    }
}

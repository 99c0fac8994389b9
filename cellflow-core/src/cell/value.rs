//! Cell Values
//!
//! The committed contents of a cell and the results a compute function may
//! produce.
//!
//! # The value union
//!
//! A settled cell holds a [`Value`]: a plain application value, an error
//! value, or a pointer at another cell. Pointers are what make the engine's
//! second graph necessary: when a computation returns a cell, readers of the
//! computed cell transparently see the pointed-to cell's contents, and the
//! update engine has to treat the pointed-to cell as feeding the pointer
//! holder.
//!
//! # Compute results
//!
//! A compute function returns a [`Compute`]: a value, a pointer, an error,
//! an abort (drop this computation, keep whatever the cell had), or a boxed
//! future resolving to one of those. Returning a future is how asynchronous
//! cells are built; the update engine awaits it outside the engine lock.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::cell::CellId;
use crate::error::CellError;

/// What readers receive from a cell: the plain value or the error value.
pub type CellValue<V> = Result<V, Arc<CellError>>;

/// The committed contents of a settled cell.
#[derive(Debug, Clone)]
pub enum Value<V> {
    /// A plain application value.
    Val(V),
    /// An error value. Shared with every downstream cell it propagated to.
    Err(Arc<CellError>),
    /// A pointer at another cell.
    Cell(CellId),
}

impl<V> Value<V> {
    /// The pointer target, when this value is a pointer.
    pub fn pointed(&self) -> Option<CellId> {
        match self {
            Value::Cell(id) => Some(*id),
            _ => None,
        }
    }
}

/// Result of one invocation of a compute function.
pub enum Compute<V> {
    /// Commit this plain value.
    Value(V),
    /// Commit a pointer at this cell.
    Cell(CellId),
    /// Commit an error value originating at the computed cell.
    Error(String),
    /// Abort: discard the computation, keep waiting. The cell's previous
    /// value (if any) stays in place and nobody is notified.
    Abort,
    /// Asynchronous continuation. Awaited, then handled as above.
    Future(BoxFuture<'static, Compute<V>>),
}

impl<V> Compute<V> {
    /// Wrap a future producing a plain value.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = V> + Send + 'static,
    {
        Compute::Future(Box::pin(async move { Compute::Value(fut.await) }))
    }
}

impl<V> From<V> for Compute<V> {
    fn from(v: V) -> Self {
        Compute::Value(v)
    }
}

impl<V> std::fmt::Debug for Compute<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compute::Value(_) => f.write_str("Compute::Value(..)"),
            Compute::Cell(id) => write!(f, "Compute::Cell({id})"),
            Compute::Error(reason) => write!(f, "Compute::Error({reason:?})"),
            Compute::Abort => f.write_str("Compute::Abort"),
            Compute::Future(_) => f.write_str("Compute::Future(..)"),
        }
    }
}

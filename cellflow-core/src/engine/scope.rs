//! Scopes
//!
//! A scope is a bookkeeping view over an engine: every cell created through
//! it is remembered, so a whole group (a widget's cells, one request's
//! cells) can be awaited and torn down together. Scopes add no isolation;
//! scoped cells live in the same graphs and may be read from anywhere.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::handle::{DerivedCell, ScopeCells, SourceCell};
use crate::cell::id::CellId;
use crate::cell::value::{Compute, Value};
use crate::engine::{DeriveOptions, EngineInner};
use crate::error::{CellError, EngineError};

/// A group of cells created together and destroyed together.
pub struct Scope<V> {
    inner: Arc<EngineInner<V>>,
    cells: Arc<ScopeCells>,
}

impl<V> Clone for Scope<V> {
    fn clone(&self) -> Self {
        Scope { inner: self.inner.clone(), cells: self.cells.clone() }
    }
}

impl<V: Clone + Send + Sync + 'static> Scope<V> {
    pub(crate) fn new(inner: Arc<EngineInner<V>>) -> Self {
        Scope { inner, cells: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Source cell holding `value`, tracked by this scope.
    pub fn new_source(&self, value: V) -> SourceCell<V> {
        self.inner
            .source_cell(Some(Value::Val(value)), None, None, Some(self.cells.clone()))
    }

    /// Unset source cell tracked by this scope.
    pub fn new_source_unset(&self) -> SourceCell<V> {
        self.inner.source_cell(None, None, None, Some(self.cells.clone()))
    }

    /// Derived cell tracked by this scope.
    pub fn derive<F>(&self, deps: &[CellId], f: F) -> Result<DerivedCell<V>, EngineError>
    where
        F: Fn(&[V]) -> Compute<V> + Send + Sync + 'static,
    {
        self.inner.derive_cell(
            deps,
            Arc::new(move |vals: &[V], _: Option<&V>| f(vals)),
            DeriveOptions::default(),
            Some(self.cells.clone()),
        )
    }

    /// Derived cell with full options, tracked by this scope.
    pub fn derive_with<F>(
        &self,
        deps: &[CellId],
        f: F,
        opts: DeriveOptions,
    ) -> Result<DerivedCell<V>, EngineError>
    where
        F: Fn(&[V], Option<&V>) -> Compute<V> + Send + Sync + 'static,
    {
        self.inner.derive_cell(deps, Arc::new(f), opts, Some(self.cells.clone()))
    }

    /// Number of cells tracked by this scope.
    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }

    /// Wait until every cell of the scope settled.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.settle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let ids = self.cells.lock().clone();
                let st = self.inner.state.lock();
                let settled = ids
                    .iter()
                    .all(|id| st.cells.get(id).map_or(true, |s| s.settled()));
                if settled {
                    return;
                }
            }
            notified.as_mut().await;
        }
    }

    /// Errors of the engine's registry originating in this scope's cells.
    pub fn errors(&self) -> Vec<(CellId, Arc<CellError>)> {
        let ids = self.cells.lock().clone();
        let st = self.inner.state.lock();
        let mut out: Vec<_> = ids
            .iter()
            .filter_map(|id| st.errors.get(id).map(|e| (*id, e.clone())))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Delete every cell of the scope at once. Refuses when a cell outside
    /// the scope still depends on one of them; nothing is deleted then.
    pub fn destroy(self) -> Result<(), EngineError> {
        let ids = self.cells.lock().clone();
        self.inner.delete_ids(&ids)
    }
}

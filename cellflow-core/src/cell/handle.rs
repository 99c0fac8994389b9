//! Cell Handles
//!
//! The public face of a cell. A handle is a cheap clone of an `Arc` into
//! the engine plus the cell's ID; dropping handles never destroys the cell
//! (see [`crate::engine::Engine::delete`] and scopes for teardown).
//!
//! [`SourceCell`] and [`DerivedCell`] both deref to [`CellRef`], which
//! carries everything shared: reads, waits, subscriptions and mapping.
//! Writes live on [`SourceCell`] only.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::cell::id::{CellId, SubscriberId};
use crate::cell::slot::SubscriberFn;
use crate::cell::value::{CellValue, Compute, Value};
use crate::engine::{DeriveOptions, EngineInner};
use crate::error::{CellError, EngineError};

/// Cells created through a scope share this list for bulk teardown.
pub(crate) type ScopeCells = Mutex<Vec<CellId>>;

/// Shared handle to a cell.
pub struct CellRef<V> {
    pub(crate) inner: Arc<EngineInner<V>>,
    pub(crate) id: CellId,
    pub(crate) scope: Option<Arc<ScopeCells>>,
}

impl<V> Clone for CellRef<V> {
    fn clone(&self) -> Self {
        CellRef { inner: self.inner.clone(), id: self.id, scope: self.scope.clone() }
    }
}

impl<V: Clone + Send + Sync + 'static> CellRef<V> {
    pub fn id(&self) -> CellId {
        self.id
    }

    /// Diagnostic name, falling back to the ID.
    pub fn name(&self) -> String {
        self.inner
            .name_of(self.id)
            .unwrap_or_else(|| format!("cell{}", self.id.raw()))
    }

    /// Current value without waiting: `None` while unset, or while a
    /// pointer chain leads to an unset cell. Errors are values.
    pub fn value(&self) -> Option<CellValue<V>> {
        self.inner.peek(self.id)
    }

    /// Wait for the first defined value. Does not wait out an in-flight
    /// recomputation once a value is defined.
    pub async fn get(&self) -> CellValue<V> {
        match self.inner.await_value(self.id).await {
            Some(v) => v,
            None => Err(CellError::new(self.id, None, "cell deleted")),
        }
    }

    /// Wait until the cell and every transitively pointed-to cell settled,
    /// then return the dereferenced value.
    pub async fn consolidated(&self) -> CellValue<V> {
        match self.inner.consolidated(self.id).await {
            Some(v) => v,
            None => Err(CellError::new(self.id, None, "cell deleted")),
        }
    }

    /// Whether the cell currently holds a pointer.
    pub fn is_pointer(&self) -> bool {
        let st = self.inner.state.lock();
        st.cells.get(&self.id).map_or(false, |s| s.pointed.is_some())
    }

    /// The current error value, when the cell holds one (dereferenced
    /// through pointers).
    pub fn error(&self) -> Option<Arc<CellError>> {
        match self.value() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Register a callback invoked with the current value (immediately, if
    /// one is defined) and after every net change. Never invoked while the
    /// value is undefined. The subscription lives until
    /// [`Subscription::unsubscribe`]; dropping the returned handle does not
    /// detach it.
    pub fn subscribe(
        &self,
        cb: impl Fn(&CellValue<V>) + Send + Sync + 'static,
    ) -> Subscription<V> {
        let sub = SubscriberId::fresh();
        let cb: SubscriberFn<V> = Arc::new(cb);
        let payload = {
            let mut st = self.inner.state.lock();
            match st.cells.get_mut(&self.id) {
                Some(slot) => slot.subscribers.push((sub, cb.clone())),
                None => warn!(id = %self.id, "subscribe on a deleted cell"),
            }
            EngineInner::peek_locked(&st, self.id)
        };
        if let Some(payload) = payload {
            cb(&payload);
        }
        Subscription { inner: self.inner.clone(), cell: self.id, sub }
    }

    /// Single-dependency derive, registered under the same scope as this
    /// handle.
    pub fn map<F>(&self, f: F) -> Result<DerivedCell<V>, EngineError>
    where
        F: Fn(&V) -> Compute<V> + Send + Sync + 'static,
    {
        self.inner.derive_cell(
            &[self.id],
            Arc::new(move |vals: &[V], _: Option<&V>| f(&vals[0])),
            DeriveOptions::default(),
            self.scope.clone(),
        )
    }

    /// Force an update pass rooted here without a value change, for values
    /// mutated in place.
    pub async fn refresh(&self) {
        self.inner.run_update(vec![self.id]).await;
    }
}

/// Handle to an externally written cell.
pub struct SourceCell<V>(CellRef<V>);

impl<V> Clone for SourceCell<V> {
    fn clone(&self) -> Self {
        SourceCell(self.0.clone())
    }
}

impl<V> Deref for SourceCell<V> {
    type Target = CellRef<V>;

    fn deref(&self) -> &CellRef<V> {
        &self.0
    }
}

impl<V: Clone + Send + Sync + 'static> SourceCell<V> {
    pub(crate) fn new(
        inner: Arc<EngineInner<V>>,
        id: CellId,
        scope: Option<Arc<ScopeCells>>,
    ) -> Self {
        SourceCell(CellRef { inner, id, scope })
    }

    /// Write a value and propagate it. Returns once the affected region
    /// settled. Writing an equal value does nothing.
    pub async fn set(&self, value: V) {
        self.0.inner.set_root(self.0.id, Value::Val(value)).await;
    }

    /// Point this cell at another cell and propagate.
    pub async fn set_cell(&self, target: CellId) {
        self.0.inner.set_root(self.0.id, Value::Cell(target)).await;
    }

    /// Register a value still being produced. The cell is unsettled until
    /// the future resolves; a failed future commits an error value
    /// originating here. Requires a tokio runtime.
    pub fn set_future<F>(&self, fut: F)
    where
        F: Future<Output = Result<V, String>> + Send + 'static,
    {
        self.0.inner.set_future_root(self.0.id, Box::pin(fut));
    }

    /// Functional update of the current plain value. Refuses when the cell
    /// is unset, holds an error, holds a pointer, or has a computation in
    /// flight.
    pub async fn update<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&V) -> V,
    {
        let id = self.0.id;
        let next = {
            let st = self.0.inner.state.lock();
            let slot = st.cells.get(&id).ok_or(EngineError::Deleted(id))?;
            if !slot.settled() {
                return Err(EngineError::Busy(id));
            }
            match &slot.value {
                None => return Err(EngineError::Uninitialized(id)),
                Some(Value::Err(_)) => return Err(EngineError::ErrorValue(id)),
                Some(Value::Cell(_)) => return Err(EngineError::PointerCell(id)),
                Some(Value::Val(v)) => f(v),
            }
        };
        self.0.inner.set_root(id, Value::Val(next)).await;
        Ok(())
    }
}

/// Handle to a computed cell.
pub struct DerivedCell<V>(CellRef<V>);

impl<V> std::fmt::Debug for DerivedCell<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DerivedCell").field(&self.0.id).finish()
    }
}

impl<V> Clone for DerivedCell<V> {
    fn clone(&self) -> Self {
        DerivedCell(self.0.clone())
    }
}

impl<V> Deref for DerivedCell<V> {
    type Target = CellRef<V>;

    fn deref(&self) -> &CellRef<V> {
        &self.0
    }
}

impl<V: Clone + Send + Sync + 'static> DerivedCell<V> {
    pub(crate) fn new(
        inner: Arc<EngineInner<V>>,
        id: CellId,
        scope: Option<Arc<ScopeCells>>,
    ) -> Self {
        DerivedCell(CellRef { inner, id, scope })
    }
}

/// An active subscription. Detached only by [`Subscription::unsubscribe`].
#[must_use = "dropping a Subscription does not detach the callback"]
pub struct Subscription<V> {
    inner: Arc<EngineInner<V>>,
    cell: CellId,
    sub: SubscriberId,
}

impl<V> Subscription<V> {
    /// Detach the callback. No further invocations happen after this
    /// returns.
    pub fn unsubscribe(self) {
        let mut st = self.inner.state.lock();
        if let Some(slot) = st.cells.get_mut(&self.cell) {
            slot.subscribers.retain(|(sid, _)| *sid != self.sub);
        }
    }
}

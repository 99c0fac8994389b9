//! Cell Engine
//!
//! The engine owns every cell, the two graphs relating them, the error
//! registry and the garbage-collection marks. All of that state lives behind
//! a single mutex; the lock is only ever held for short, non-blocking
//! sections and never across an await or a user callback.
//!
//! # Settlement
//!
//! Readers waiting for a value (`get`, `consolidated`, dependency gathering
//! across an in-flight computation, `wait`) share one engine-wide
//! [`tokio::sync::Notify`]. Every commit and every end-of-update fires it;
//! waiters re-check their predicate under the lock and go back to sleep if
//! it does not hold yet. The notified future is armed before the check, so
//! a commit landing between check and sleep cannot be missed.
//!
//! # Commits
//!
//! [`EngineInner::commit`] is the single point through which any computation
//! result enters a cell, whether it came from `set`, a resolved future, an
//! update wave or a derived cell's first computation. It enforces the rank
//! gate, the injected equality cutoff, pointer edge maintenance, error
//! registry upkeep and the persistence write-through.

mod scope;
mod update;

pub use scope::Scope;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::cell::handle::{DerivedCell, ScopeCells, SourceCell};
use crate::cell::id::{CellId, Rank};
use crate::cell::slot::{CellSlot, ComputeFn, SubscriberFn};
use crate::cell::value::{CellValue, Compute, Value};
use crate::error::{CellError, EngineError};
use crate::graph::{partial_topological_sort, Dag};
use crate::storage::{MarshalFn, Storage, UnmarshalFn};

/// Injected value equality, the engine's change cutoff.
pub type EqFn<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

/// Options for [`Engine::derive_with`].
#[derive(Default)]
pub struct DeriveOptions {
    /// Name for diagnostics and error messages.
    pub name: Option<String>,
    /// Pass the previous committed plain value to the compute function.
    pub use_previous: bool,
    /// The function is not expected to fail; error results are logged.
    pub no_fail: bool,
}

/// Counters reported by [`Engine::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Cells ever created in this engine.
    pub count: u64,
    /// Cells currently alive.
    pub size: usize,
}

/// A settled computation outcome, as recorded in an update's bookkeeping.
#[derive(Clone, Debug)]
pub(crate) enum Settled<V> {
    /// Committed (or at least produced) this value.
    Done(Value<V>),
    /// Aborted; the cell keeps its previous contents.
    Canceled,
}

/// One dependency input of a computation job.
#[derive(Clone)]
pub(crate) enum DepInput<V> {
    /// The dependency was settled (or already computed this update).
    Ready(Settled<V>),
    /// The dependency has a computation in flight; await its settlement.
    Wait(CellId),
}

pub(crate) struct State<V> {
    pub cells: IndexMap<CellId, CellSlot<V>>,
    pub deps: Dag,
    pub pointers: Dag,
    pub names: HashMap<CellId, String>,
    /// Origin errors, keyed by the failing cell.
    pub errors: HashMap<CellId, Arc<CellError>>,
    /// Cells marked for collection at the end of the running update.
    pub gc: BTreeSet<CellId>,
    /// Roots written while an update was running, flushed after it settles.
    pub queued: Vec<CellId>,
    /// Cells whose value changed under a deferred commit and which have not
    /// been notified yet.
    pub changed: HashSet<CellId>,
    pub updating: bool,
    /// Spawned computation drivers currently alive.
    pub in_flight: usize,
    /// Cells ever created.
    pub created: u64,
}

pub(crate) struct EngineInner<V> {
    pub(crate) state: Mutex<State<V>>,
    pub(crate) settle: Notify,
    pub(crate) equality: EqFn<V>,
    storage: Option<Arc<dyn Storage>>,
    marshal: Option<MarshalFn<V>>,
    unmarshal: Option<UnmarshalFn<V>>,
}

/// A reactive cell engine over values of type `V`.
///
/// Cheap to clone; clones share the same cells. Asynchronous features
/// (pending values, compute functions returning futures, cross-computation
/// waits) require a tokio runtime; fully synchronous graphs do not.
pub struct Engine<V> {
    pub(crate) inner: Arc<EngineInner<V>>,
}

impl<V> Clone for Engine<V> {
    fn clone(&self) -> Self {
        Engine { inner: self.inner.clone() }
    }
}

/// Configures an [`Engine`]: value equality, persistence backend and
/// marshalling hooks.
pub struct EngineBuilder<V> {
    equality: EqFn<V>,
    storage: Option<Arc<dyn Storage>>,
    marshal: Option<MarshalFn<V>>,
    unmarshal: Option<UnmarshalFn<V>>,
}

impl<V: Clone + Send + Sync + 'static> EngineBuilder<V> {
    /// Builder with an explicit equality predicate, for value types without
    /// a usable `PartialEq`.
    pub fn with_equality(eq: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        EngineBuilder {
            equality: Arc::new(eq),
            storage: None,
            marshal: None,
            unmarshal: None,
        }
    }

    /// Override the equality predicate.
    pub fn equality(mut self, eq: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        self.equality = Arc::new(eq);
        self
    }

    /// Install a persistence backend for cells created with a storage key.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Install marshal/unmarshal hooks for the persistence side channel.
    pub fn marshaller(mut self, marshal: MarshalFn<V>, unmarshal: UnmarshalFn<V>) -> Self {
        self.marshal = Some(marshal);
        self.unmarshal = Some(unmarshal);
        self
    }

    pub fn build(self) -> Engine<V> {
        Engine {
            inner: Arc::new(EngineInner {
                state: Mutex::new(State {
                    cells: IndexMap::new(),
                    deps: Dag::new(),
                    pointers: Dag::new(),
                    names: HashMap::new(),
                    errors: HashMap::new(),
                    gc: BTreeSet::new(),
                    queued: Vec::new(),
                    changed: HashSet::new(),
                    updating: false,
                    in_flight: 0,
                    created: 0,
                }),
                settle: Notify::new(),
                equality: self.equality,
                storage: self.storage,
                marshal: self.marshal,
                unmarshal: self.unmarshal,
            }),
        }
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> Engine<V> {
    /// Engine with `PartialEq` as the change cutoff and no persistence.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder pre-filled with `PartialEq` equality.
    pub fn builder() -> EngineBuilder<V> {
        EngineBuilder::with_equality(|a: &V, b: &V| a == b)
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> Default for Engine<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Engine<V> {
    // ---- cell construction ----

    /// Source cell holding `value`.
    pub fn new_source(&self, value: V) -> SourceCell<V> {
        self.source_cell(Some(Value::Val(value)), None, None)
    }

    /// Named source cell holding `value`.
    pub fn new_source_named(&self, value: V, name: &str) -> SourceCell<V> {
        self.source_cell(Some(Value::Val(value)), Some(name.to_string()), None)
    }

    /// Source cell with no value yet. Readers wait until the first `set`.
    pub fn new_source_unset(&self) -> SourceCell<V> {
        self.source_cell(None, None, None)
    }

    /// Source cell whose first value is still being produced. A failed
    /// future commits an error value originating at this cell.
    pub fn new_source_pending<F>(&self, fut: F) -> SourceCell<V>
    where
        F: Future<Output = Result<V, String>> + Send + 'static,
    {
        let cell = self.source_cell(None, None, None);
        self.inner.set_future_root(cell.id(), Box::pin(fut));
        cell
    }

    /// Source cell persisted under `key`: seeded from storage when a stored
    /// value exists, falling back to `default`, and written through on
    /// every committed change.
    pub fn new_source_stored(&self, default: V, key: &str) -> SourceCell<V> {
        let stored = self
            .inner
            .storage
            .as_deref()
            .and_then(|s| s.get(key))
            .and_then(|raw| self.inner.unmarshal.as_ref().and_then(|u| u(&raw)));
        let value = stored.unwrap_or(default);
        self.source_cell(Some(Value::Val(value)), None, Some(key.to_string()))
    }

    fn source_cell(
        &self,
        value: Option<Value<V>>,
        name: Option<String>,
        storage_key: Option<String>,
    ) -> SourceCell<V> {
        self.inner.source_cell(value, name, storage_key, None)
    }

    /// Derived cell computed from `deps` by `f`. Fails when a dependency
    /// has been deleted. The first computation is triggered immediately.
    pub fn derive<F>(&self, deps: &[CellId], f: F) -> Result<DerivedCell<V>, EngineError>
    where
        F: Fn(&[V]) -> Compute<V> + Send + Sync + 'static,
    {
        self.derive_with(deps, move |vals, _| f(vals), DeriveOptions::default())
    }

    /// Named variant of [`Engine::derive`].
    pub fn derive_named<F>(
        &self,
        deps: &[CellId],
        f: F,
        name: &str,
    ) -> Result<DerivedCell<V>, EngineError>
    where
        F: Fn(&[V]) -> Compute<V> + Send + Sync + 'static,
    {
        self.derive_with(
            deps,
            move |vals, _| f(vals),
            DeriveOptions { name: Some(name.to_string()), ..DeriveOptions::default() },
        )
    }

    /// Derived cell with full options. The compute function additionally
    /// receives the previous committed plain value when `use_previous` is
    /// set.
    pub fn derive_with<F>(
        &self,
        deps: &[CellId],
        f: F,
        opts: DeriveOptions,
    ) -> Result<DerivedCell<V>, EngineError>
    where
        F: Fn(&[V], Option<&V>) -> Compute<V> + Send + Sync + 'static,
    {
        self.inner.derive_cell(deps, Arc::new(f), opts, None)
    }

    // ---- lifecycle ----

    /// Delete cells, refusing with [`EngineError::ReferencesLeft`] when any
    /// surviving cell still depends on one of them. All-or-nothing.
    pub fn delete(&self, ids: &[CellId]) -> Result<(), EngineError> {
        self.inner.delete_ids(ids)
    }

    /// Mark cells, plus everything they transitively depend on, for
    /// deletion at the end of the current (or next) update.
    pub fn collect(&self, ids: &[CellId]) {
        let mut st = self.inner.state.lock();
        for &id in ids {
            let inputs = partial_topological_sort(&[id], |n| st.deps.predecessors(n), false);
            st.gc.insert(id);
            st.gc.extend(inputs);
        }
    }

    // ---- observation ----

    /// Wait until no computation is in flight anywhere in the engine.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.settle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.idle() {
                return;
            }
            notified.as_mut().await;
        }
    }

    /// Whether any computation is currently in flight.
    pub fn is_working(&self) -> bool {
        !self.inner.idle()
    }

    pub fn stats(&self) -> EngineStats {
        let st = self.inner.state.lock();
        EngineStats { count: st.created, size: st.cells.len() }
    }

    /// Snapshot of the error registry: every cell currently failing at the
    /// origin, in ID order.
    pub fn errors(&self) -> Vec<(CellId, Arc<CellError>)> {
        let st = self.inner.state.lock();
        let mut out: Vec<_> = st.errors.iter().map(|(&id, e)| (id, e.clone())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Assign a diagnostic name to a cell.
    pub fn bless(&self, id: CellId, name: &str) {
        self.inner.state.lock().names.insert(id, name.to_string());
    }

    /// Diagnostic name of a cell, falling back to its ID.
    pub fn name(&self, id: CellId) -> String {
        self.inner
            .name_of(id)
            .unwrap_or_else(|| format!("cell{}", id.raw()))
    }

    /// A scope tracking every cell created through it, for bulk teardown.
    pub fn scope(&self) -> Scope<V> {
        Scope::new(self.inner.clone())
    }
}

impl<V: Clone + Send + Sync + 'static> EngineInner<V> {
    pub(crate) fn source_cell(
        self: &Arc<Self>,
        value: Option<Value<V>>,
        name: Option<String>,
        storage_key: Option<String>,
        scope: Option<Arc<ScopeCells>>,
    ) -> SourceCell<V> {
        let id = CellId::fresh();
        let mut slot = CellSlot::source(id);
        slot.is_pointer = value.as_ref().map_or(true, |v| matches!(v, Value::Cell(_)));
        if let Some(v) = value {
            slot.value = Some(v);
        }
        slot.storage_key = storage_key;
        self.add_slot(slot, name);
        if let Some(scope) = &scope {
            scope.lock().push(id);
        }
        SourceCell::new(self.clone(), id, scope)
    }

    pub(crate) fn add_slot(&self, slot: CellSlot<V>, name: Option<String>) {
        let mut st = self.state.lock();
        let id = slot.id;
        st.deps.add_node(id);
        st.pointers.add_node(id);
        st.cells.insert(id, slot);
        if let Some(name) = name {
            st.names.insert(id, name);
        }
        st.created += 1;
    }

    pub(crate) fn derive_cell(
        self: &Arc<Self>,
        deps: &[CellId],
        compute: ComputeFn<V>,
        opts: DeriveOptions,
        scope: Option<Arc<ScopeCells>>,
    ) -> Result<DerivedCell<V>, EngineError> {
        let id = CellId::fresh();
        {
            let mut st = self.state.lock();
            for &d in deps {
                if !st.cells.contains_key(&d) {
                    return Err(EngineError::Deleted(d));
                }
            }
            let slot = CellSlot::derived(
                id,
                deps.iter().copied().collect(),
                compute,
                opts.use_previous,
                opts.no_fail,
            );
            st.deps.add_node(id);
            st.pointers.add_node(id);
            for &d in deps {
                st.deps.add_edge(d, id);
            }
            st.cells.insert(id, slot);
            if let Some(name) = opts.name {
                st.names.insert(id, name);
            }
            st.created += 1;
        }
        if let Some(scope) = &scope {
            scope.lock().push(id);
        }
        self.initial_compute(id);
        Ok(DerivedCell::new(self.clone(), id, scope))
    }

    pub(crate) fn name_of(&self, id: CellId) -> Option<String> {
        self.state.lock().names.get(&id).cloned()
    }

    fn idle(&self) -> bool {
        let st = self.state.lock();
        st.in_flight == 0
            && !st.updating
            && st.queued.is_empty()
            && st.cells.values().all(|s| s.settled())
    }

    // ---- commit ----

    /// Commit a computation result at `id` under `rank`.
    ///
    /// `result` of `None` is an aborted computation: only the settlement
    /// bookkeeping moves (and only when the rank is still current). With
    /// `defer` the change is recorded for end-of-update notification;
    /// without it subscribers are invoked here.
    ///
    /// Returns whether the committed value is a net change.
    pub(crate) fn commit(
        &self,
        id: CellId,
        rank: Rank,
        result: Option<Value<V>>,
        defer: bool,
    ) -> bool {
        let mut storage_write: Option<(String, String)> = None;
        let mut callbacks: Vec<(SubscriberFn<V>, CellValue<V>)> = Vec::new();
        let changed = {
            let mut st = self.state.lock();
            let Some(slot) = st.cells.get_mut(&id) else {
                warn!(%id, "commit for a deleted cell, dropped");
                return false;
            };
            match result {
                None => {
                    if slot.current_rank == rank {
                        slot.value_rank = rank;
                        trace!(%id, %rank, "computation aborted, cell keeps waiting");
                    }
                    false
                }
                Some(value) => {
                    if rank < slot.value_rank {
                        trace!(%id, %rank, current = %slot.value_rank, "stale commit discarded");
                        return false;
                    }
                    let changed = match (&slot.value, &value) {
                        (None, _) => true,
                        (Some(Value::Val(a)), Value::Val(b)) => !(self.equality)(a, b),
                        (Some(Value::Cell(a)), Value::Cell(b)) => a != b,
                        // errors never compare equal
                        _ => true,
                    };
                    slot.value_rank = rank;
                    if changed {
                        let old_pointed = slot.pointed;
                        let new_pointed = value.pointed();
                        let old_edge_is_dep =
                            old_pointed.map_or(false, |o| slot.dependencies.contains(&o));
                        let was_registered = slot.registered_error;
                        let origin_error = match &value {
                            Value::Err(e) if e.is_origin(id) => Some(e.clone()),
                            _ => None,
                        };
                        // persistence write-through for plain values
                        if let (Value::Val(v), Some(key), Some(marshal)) =
                            (&value, &slot.storage_key, &self.marshal)
                        {
                            if let Some(raw) = marshal(v) {
                                storage_write = Some((key.clone(), raw));
                            }
                        }
                        slot.is_pointer = new_pointed.is_some();
                        slot.pointed = new_pointed;
                        slot.registered_error = origin_error.is_some();
                        slot.value = Some(value);

                        // error registry upkeep
                        match origin_error {
                            Some(e) => {
                                st.errors.insert(id, e);
                            }
                            None if was_registered => {
                                st.errors.remove(&id);
                            }
                            None => {}
                        }
                        // pointer edge upkeep; the old edge survives when a
                        // declared dependency duplicates it
                        if old_pointed != new_pointed {
                            if let Some(old) = old_pointed {
                                if !old_edge_is_dep {
                                    st.pointers.remove_edge(old, id);
                                }
                            }
                            if let Some(new) = new_pointed {
                                st.pointers.add_edge(new, id);
                            }
                        }
                        debug!(%id, %rank, "committed new value");
                        if defer {
                            st.changed.insert(id);
                        } else if let Some(payload) = Self::peek_locked(&st, id) {
                            if let Some(slot) = st.cells.get(&id) {
                                for (_, cb) in &slot.subscribers {
                                    callbacks.push((cb.clone(), payload.clone()));
                                }
                            }
                        }
                    } else {
                        trace!(%id, %rank, "commit without change");
                    }
                    changed
                }
            }
        };
        if let (Some((key, raw)), Some(storage)) = (storage_write, &self.storage) {
            storage.set(&key, &raw);
        }
        self.settle.notify_waiters();
        for (cb, payload) in callbacks {
            cb(&payload);
        }
        changed
    }

    /// Notify a cell's subscribers with its current dereferenced value.
    /// Skipped entirely while the cell (or its pointer chain) is unset.
    pub(crate) fn notify_subscribers(&self, id: CellId) {
        let callbacks = {
            let st = self.state.lock();
            match Self::peek_locked(&st, id) {
                None => Vec::new(),
                Some(payload) => st
                    .cells
                    .get(&id)
                    .map(|slot| {
                        slot.subscribers
                            .iter()
                            .map(|(_, cb)| (cb.clone(), payload.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
            }
        };
        for (cb, payload) in callbacks {
            cb(&payload);
        }
    }

    // ---- reads ----

    /// Reader-facing value of `id`: the committed value, dereferenced
    /// through pointer chains while the targets hold defined values.
    pub(crate) fn peek(&self, id: CellId) -> Option<CellValue<V>> {
        let st = self.state.lock();
        Self::peek_locked(&st, id)
    }

    pub(crate) fn peek_locked(st: &State<V>, id: CellId) -> Option<CellValue<V>> {
        let mut seen = HashSet::new();
        let mut at = id;
        loop {
            if !seen.insert(at) {
                warn!(%id, "pointer cycle while dereferencing");
                return None;
            }
            let slot = st.cells.get(&at)?;
            match &slot.value {
                None => return None,
                Some(Value::Val(v)) => return Some(Ok(v.clone())),
                Some(Value::Err(e)) => return Some(Err(e.clone())),
                Some(Value::Cell(t)) => at = *t,
            }
        }
    }

    /// Snapshot a dependency's settled outcome, or where to wait for it.
    pub(crate) fn dep_input_locked(st: &State<V>, d: CellId) -> DepInput<V> {
        match st.cells.get(&d) {
            None => DepInput::Ready(Settled::Canceled),
            Some(slot) if slot.settled() => match &slot.value {
                Some(v) => DepInput::Ready(Settled::Done(v.clone())),
                None => DepInput::Ready(Settled::Canceled),
            },
            Some(_) => DepInput::Wait(d),
        }
    }

    /// Wait until `d` settles, then report its outcome. A deleted cell and
    /// a settled-but-unset cell both count as canceled.
    pub(crate) async fn await_settled(&self, d: CellId) -> Settled<V> {
        loop {
            let notified = self.settle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock();
                match st.cells.get(&d) {
                    None => return Settled::Canceled,
                    Some(slot) if slot.settled() => {
                        return match &slot.value {
                            Some(v) => Settled::Done(v.clone()),
                            None => Settled::Canceled,
                        };
                    }
                    Some(_) => {}
                }
            }
            notified.as_mut().await;
        }
    }

    /// Wait for the first defined, dereferenced value at `id`. `None` when
    /// the cell disappears while waiting.
    pub(crate) async fn await_value(&self, id: CellId) -> Option<CellValue<V>> {
        loop {
            let notified = self.settle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock();
                if !st.cells.contains_key(&id) {
                    return None;
                }
                if let Some(v) = Self::peek_locked(&st, id) {
                    return Some(v);
                }
            }
            notified.as_mut().await;
        }
    }

    /// Settled, fully dereferenced value: waits out outstanding
    /// computations at the cell and at every pointed-to cell along the
    /// chain. `None` when a cell on the chain disappears.
    pub(crate) async fn consolidated(&self, id: CellId) -> Option<CellValue<V>> {
        let mut at = id;
        let mut hops = 0usize;
        loop {
            let v = loop {
                let notified = self.settle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let st = self.state.lock();
                    match st.cells.get(&at) {
                        None => return None,
                        Some(slot) if slot.settled() => {
                            if let Some(v) = &slot.value {
                                break v.clone();
                            }
                        }
                        Some(_) => {}
                    }
                }
                notified.as_mut().await;
            };
            match v {
                Value::Val(x) => return Some(Ok(x)),
                Value::Err(e) => return Some(Err(e)),
                Value::Cell(t) => {
                    hops += 1;
                    let limit = self.state.lock().cells.len();
                    if hops > limit {
                        warn!(%id, "pointer cycle while consolidating");
                        return None;
                    }
                    at = t;
                }
            }
        }
    }

    // ---- writes ----

    /// Commit a new value at a source cell and run the resulting update.
    /// An unchanged value settles the rank and does nothing else.
    pub(crate) async fn set_root(self: &Arc<Self>, id: CellId, value: Value<V>) {
        let rank = {
            let mut st = self.state.lock();
            let Some(slot) = st.cells.get_mut(&id) else {
                warn!(%id, "set on a deleted cell, ignored");
                return;
            };
            slot.current_rank.bump()
        };
        if self.commit(id, rank, Some(value), true) {
            self.run_update(vec![id]).await;
        }
    }

    /// Register a pending value at a source cell. The cell is unsettled
    /// until the future resolves; a failed future commits an error value.
    pub(crate) fn set_future_root(
        self: &Arc<Self>,
        id: CellId,
        fut: BoxFuture<'static, Result<V, String>>,
    ) {
        let rank = {
            let mut st = self.state.lock();
            let Some(slot) = st.cells.get_mut(&id) else {
                warn!(%id, "set on a deleted cell, ignored");
                return;
            };
            let rank = slot.current_rank.bump();
            st.in_flight += 1;
            rank
        };
        let inner = self.clone();
        tokio::spawn(async move {
            let value = match fut.await {
                Ok(v) => Value::Val(v),
                Err(reason) => {
                    let name = inner.name_of(id);
                    Value::Err(CellError::new(id, name, reason))
                }
            };
            if inner.commit(id, rank, Some(value), true) {
                inner.run_update(vec![id]).await;
            }
            inner.end_work();
        });
    }

    pub(crate) fn end_work(&self) {
        {
            let mut st = self.state.lock();
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        self.settle.notify_waiters();
    }

    // ---- deletion ----

    pub(crate) fn delete_ids(&self, ids: &[CellId]) -> Result<(), EngineError> {
        {
            let mut st = self.state.lock();
            let idset: HashSet<CellId> = ids.iter().copied().collect();
            let mut leftover: BTreeSet<CellId> = BTreeSet::new();
            for &id in ids {
                for d in partial_topological_sort(&[id], |n| st.deps.successors(n), false) {
                    if !idset.contains(&d) {
                        leftover.insert(d);
                    }
                }
            }
            if !leftover.is_empty() {
                return Err(EngineError::ReferencesLeft(leftover.into_iter().collect()));
            }
            for &id in ids {
                st.deps.remove_node(id);
                st.pointers.remove_node(id);
                st.cells.shift_remove(&id);
                st.names.remove(&id);
                st.errors.remove(&id);
                st.gc.remove(&id);
                st.changed.remove(&id);
            }
            debug!(count = ids.len(), "cells deleted");
        }
        self.settle.notify_waiters();
        Ok(())
    }
}

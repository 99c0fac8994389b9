//! Update Engine
//!
//! Propagates a change from a set of root cells through both graphs until
//! the affected region settles.
//!
//! # How an update runs
//!
//! Each pass iterates over a frontier of settled cells. One iteration:
//!
//! 1. Selection: everything forward-reachable from the frontier through the
//!    union of the two graphs might change. Cells reachable from a pointer
//!    in that region are *grey*: the pointer may retarget, so their inputs
//!    are not trustworthy yet. Updatable cells are the might-change cells
//!    that are not grey; the ones with a producer in the updatable set or
//!    the frontier get recomputed, the rest pass through unchanged.
//! 2. The recompute wave runs, producers before consumers, each computation
//!    under a freshly bumped rank.
//! 3. Cancellation: aborted computations are recorded, and a completed cell
//!    that still surfaces a canceled cell through a chain of pointers is
//!    poisoned and treated as canceled too.
//! 4. Border: pointers updated this iteration whose target left the grey
//!    region are *green*; their dependents become reachable for the next
//!    step unless they can still see grey through either graph.
//!
//! The next frontier is the updatable set plus the recomputed border. When
//! it is empty the pass is over: the garbage-collection marks are drained,
//! and any roots queued by writes that arrived during the pass start the
//! next one. Only when no queued roots remain are subscribers notified,
//! exactly once per cell whose value is a net change (plus the pointer
//! holders surfacing such a cell), so a value superseded by a queued write
//! is never observed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace, warn};

use crate::cell::id::{CellId, Rank};
use crate::cell::slot::{CellKind, ComputeFn};
use crate::cell::value::{Compute, Value};
use crate::engine::{DepInput, EngineInner, Settled, State};
use crate::error::CellError;
use crate::graph::{partial_topological_sort, strictly_reachable};

/// One scheduled recomputation.
pub(crate) struct Job<V> {
    id: CellId,
    rank: Rank,
    compute: ComputeFn<V>,
    inputs: Vec<DepInput<V>>,
    previous: Option<V>,
    no_fail: bool,
    /// Notification mode of the commit: deferred to the end of the update,
    /// or immediate (first computations of fresh cells).
    defer: bool,
}

struct Selection {
    /// Might-change cells that are not grey, in topological order.
    updatable: Vec<CellId>,
    /// Updatable cells with a producer in the updatable set or frontier.
    to_be_recomputed: Vec<CellId>,
    /// Cells downstream of a pointer that might retarget.
    grey: HashSet<CellId>,
}

struct Border {
    /// Border cells that cannot see grey anymore.
    safe: Vec<CellId>,
    /// Safe border cells with a producer among the updated cells or the
    /// frontier.
    to_be_recomputed: Vec<CellId>,
}

enum Resolved<V> {
    Canceled,
    Error(Arc<CellError>),
    Params(Vec<V>),
}

impl<V: Clone + Send + Sync + 'static> EngineInner<V> {
    /// Run an update from `roots`, or queue them when one is in flight.
    pub(crate) async fn run_update(self: &Arc<Self>, roots: Vec<CellId>) {
        {
            let mut st = self.state.lock();
            if st.updating {
                trace!(?roots, "update in flight, roots queued");
                st.queued.extend(roots);
                return;
            }
            st.updating = true;
        }
        let mut roots = roots;
        loop {
            self.update_pass(roots).await;
            let mut st = self.state.lock();
            if !st.queued.is_empty() {
                roots = std::mem::take(&mut st.queued);
                roots.sort();
                roots.dedup();
                continue;
            }

            // Notification happens once per run, after every queued write
            // drained: a value superseded by a queued write is never
            // observed, only the final settled one is delivered. Pointer
            // holders surface their target's contents without a commit of
            // their own, so holders reaching a changed cell are notified
            // too.
            let changed: Vec<CellId> = st.changed.drain().collect();
            let mut to_notify: HashSet<CellId> = changed.iter().copied().collect();
            for &id in &changed {
                let holders =
                    partial_topological_sort(&[id], |n| st.pointers.successors(n), false);
                to_notify.extend(holders);
            }
            st.updating = false;
            drop(st);
            self.settle.notify_waiters();

            let mut to_notify: Vec<CellId> = to_notify.into_iter().collect();
            to_notify.sort();
            for id in to_notify {
                self.notify_subscribers(id);
            }
            return;
        }
    }

    async fn update_pass(self: &Arc<Self>, roots: Vec<CellId>) {
        let mut computations: HashMap<CellId, Settled<V>> = HashMap::new();
        let mut done: HashSet<CellId> = HashSet::new();
        let mut canceled: HashSet<CellId> = HashSet::new();

        let mut frontier: Vec<CellId> = Vec::new();
        {
            let st = self.state.lock();
            for &r in &roots {
                if !st.cells.contains_key(&r) {
                    warn!(id = %r, "update root no longer exists, skipped");
                    continue;
                }
                frontier.push(r);
                done.insert(r);
                if let DepInput::Ready(settled) = Self::dep_input_locked(&st, r) {
                    computations.insert(r, settled);
                }
            }
        }
        debug!(roots = frontier.len(), "update pass started");

        while !frontier.is_empty() {
            frontier = self
                .update_iteration(frontier, &mut done, &mut canceled, &mut computations)
                .await;
        }

        // drain garbage-collection marks
        let marks: Vec<CellId> = {
            let mut st = self.state.lock();
            let marks: Vec<CellId> = st.gc.iter().copied().collect();
            st.gc.clear();
            marks
        };
        if !marks.is_empty() {
            if let Err(err) = self.delete_ids(&marks) {
                warn!(%err, "garbage collection refused, marks dropped");
            }
        }
    }

    async fn update_iteration(
        self: &Arc<Self>,
        frontier: Vec<CellId>,
        done: &mut HashSet<CellId>,
        canceled: &mut HashSet<CellId>,
        computations: &mut HashMap<CellId, Settled<V>>,
    ) -> Vec<CellId> {
        let selection = {
            let st = self.state.lock();
            select_updatable(&st, &frontier)
        };
        for id in &selection.to_be_recomputed {
            if done.contains(id) || canceled.contains(id) {
                warn!(%id, "cell selected twice within one update pass");
            }
        }
        trace!(
            updatable = selection.updatable.len(),
            recompute = selection.to_be_recomputed.len(),
            grey = selection.grey.len(),
            "iteration selection"
        );

        self.compute_wave(&selection.to_be_recomputed, computations).await;
        self.register_cancel_and_done(&selection.updatable, computations, done, canceled);

        let border = {
            let st = self.state.lock();
            select_border(&st, &frontier, &selection.updatable, &selection.grey)
        };
        self.compute_wave(&border.to_be_recomputed, computations).await;
        self.register_cancel_and_done(&border.safe, computations, done, canceled);

        let mut next = selection.updatable;
        next.extend(border.to_be_recomputed);
        next
    }

    /// Record which of `ids` finished and which were canceled this
    /// iteration. A finished cell that still surfaces a canceled cell
    /// through pointer chains is poisoned.
    fn register_cancel_and_done(
        &self,
        ids: &[CellId],
        computations: &HashMap<CellId, Settled<V>>,
        done: &mut HashSet<CellId>,
        canceled: &mut HashSet<CellId>,
    ) {
        let mut maybe_done: Vec<CellId> = Vec::new();
        for &id in ids {
            match computations.get(&id) {
                Some(Settled::Canceled) => {
                    canceled.insert(id);
                }
                // absent means passed through unchanged
                _ => maybe_done.push(id),
            }
        }
        let poisoned = {
            let st = self.state.lock();
            strictly_reachable(
                &maybe_done,
                |n| canceled.contains(&n),
                |n| st.pointers.predecessors(n),
            )
        };
        for id in maybe_done {
            if poisoned.contains(&id) {
                trace!(%id, "poisoned by a canceled pointed cell");
                canceled.insert(id);
            } else {
                done.insert(id);
            }
        }
    }

    /// Recompute `ids`, producers before consumers. Cells of the wave that
    /// feed other cells of the wave are grouped into layers; layers run
    /// sequentially, the computations inside a layer run concurrently.
    async fn compute_wave(
        self: &Arc<Self>,
        ids: &[CellId],
        computations: &mut HashMap<CellId, Settled<V>>,
    ) {
        if ids.is_empty() {
            return;
        }
        let layers = {
            let st = self.state.lock();
            wave_layers(&st, ids)
        };
        for layer in layers {
            let jobs: Vec<Job<V>> = {
                let mut st = self.state.lock();
                layer
                    .iter()
                    .filter_map(|&id| Self::prepare_job(&mut st, id, computations))
                    .collect()
            };
            let mut running: FuturesUnordered<_> =
                jobs.into_iter().map(|job| run_job(self.clone(), job)).collect();
            while let Some((id, settled)) = running.next().await {
                computations.insert(id, settled);
            }
        }
    }

    /// Bump the cell's rank and snapshot its inputs: results already
    /// produced by this update first, then the live cell state.
    fn prepare_job(
        st: &mut State<V>,
        id: CellId,
        computations: &HashMap<CellId, Settled<V>>,
    ) -> Option<Job<V>> {
        let Some(slot) = st.cells.get_mut(&id) else {
            warn!(%id, "recompute requested for a deleted cell");
            return None;
        };
        let CellKind::Derived { compute, use_previous, no_fail } = &slot.kind else {
            warn!(%id, "recompute requested for a source cell");
            return None;
        };
        let compute = compute.clone();
        let no_fail = *no_fail;
        let previous = if *use_previous { slot.plain_value().cloned() } else { None };
        let deps: Vec<CellId> = slot.dependencies.to_vec();
        let rank = slot.current_rank.bump();
        let inputs = deps
            .iter()
            .map(|&d| match computations.get(&d) {
                Some(settled) => DepInput::Ready(settled.clone()),
                None => Self::dep_input_locked(st, d),
            })
            .collect();
        Some(Job { id, rank, compute, inputs, previous, no_fail, defer: true })
    }

    /// First computation of a freshly constructed derived cell. Runs fully
    /// synchronously when every input is settled and the function returns a
    /// plain result; otherwise a driver task is spawned.
    pub(crate) fn initial_compute(self: &Arc<Self>, id: CellId) {
        let job = {
            let mut st = self.state.lock();
            let Some(mut job) = Self::prepare_job(&mut st, id, &HashMap::new()) else {
                return;
            };
            job.defer = false;
            if job.inputs.iter().any(|i| matches!(i, DepInput::Wait(_))) {
                st.in_flight += 1;
                let inner = self.clone();
                drop(st);
                tokio::spawn(async move {
                    run_job(inner.clone(), job).await;
                    inner.end_work();
                });
                return;
            }
            job
        };

        let settled: Vec<Settled<V>> = job
            .inputs
            .iter()
            .map(|i| match i {
                DepInput::Ready(s) => s.clone(),
                DepInput::Wait(_) => Settled::Canceled,
            })
            .collect();
        match self.resolve_params(settled) {
            Resolved::Canceled => {
                self.commit(id, job.rank, None, false);
            }
            Resolved::Error(e) => {
                self.commit(id, job.rank, Some(Value::Err(e)), false);
            }
            Resolved::Params(params) => {
                let out = (job.compute)(&params, job.previous.as_ref());
                if let Compute::Future(fut) = out {
                    {
                        self.state.lock().in_flight += 1;
                    }
                    let inner = self.clone();
                    let (rank, no_fail) = (job.rank, job.no_fail);
                    tokio::spawn(async move {
                        let mut out = Compute::Future(fut);
                        while let Compute::Future(f) = out {
                            out = f.await;
                        }
                        finish_computation(&inner, id, rank, out, no_fail, false);
                        inner.end_work();
                    });
                } else {
                    finish_computation(self, id, job.rank, out, job.no_fail, false);
                }
            }
        }
    }

    /// Turn settled dependency outcomes into compute-function parameters.
    /// Pointer values are dereferenced to the target's current contents;
    /// an unset or canceled input cancels the computation; the first error
    /// input propagates instead of invoking the function.
    fn resolve_params(&self, settled: Vec<Settled<V>>) -> Resolved<V> {
        let mut params = Vec::with_capacity(settled.len());
        for s in settled {
            match s {
                Settled::Canceled => return Resolved::Canceled,
                Settled::Done(v) => {
                    let reader = match v {
                        Value::Val(x) => Some(Ok(x)),
                        Value::Err(e) => Some(Err(e)),
                        Value::Cell(t) => self.peek(t),
                    };
                    match reader {
                        None => return Resolved::Canceled,
                        Some(Ok(x)) => params.push(x),
                        Some(Err(e)) => return Resolved::Error(e),
                    }
                }
            }
        }
        Resolved::Params(params)
    }
}

/// Drive one computation to its commit. Returns the settled outcome for
/// the update's bookkeeping.
pub(crate) async fn run_job<V: Clone + Send + Sync + 'static>(
    inner: Arc<EngineInner<V>>,
    job: Job<V>,
) -> (CellId, Settled<V>) {
    let Job { id, rank, compute, inputs, previous, no_fail, defer } = job;

    let mut settled = Vec::with_capacity(inputs.len());
    for input in inputs {
        settled.push(match input {
            DepInput::Ready(s) => s,
            DepInput::Wait(d) => inner.await_settled(d).await,
        });
    }
    let params = match inner.resolve_params(settled) {
        Resolved::Canceled => {
            inner.commit(id, rank, None, defer);
            return (id, Settled::Canceled);
        }
        Resolved::Error(e) => {
            let v = Value::Err(e);
            inner.commit(id, rank, Some(v.clone()), defer);
            return (id, Settled::Done(v));
        }
        Resolved::Params(p) => p,
    };

    // superseded while gathering inputs
    {
        let st = inner.state.lock();
        match st.cells.get(&id) {
            Some(slot) if slot.current_rank == rank => {}
            _ => {
                trace!(%id, %rank, "computation superseded before running");
                return (id, Settled::Canceled);
            }
        }
    }

    let mut out = (compute)(&params, previous.as_ref());
    while let Compute::Future(fut) = out {
        out = fut.await;
    }
    finish_computation(&inner, id, rank, out, no_fail, defer)
}

fn finish_computation<V: Clone + Send + Sync + 'static>(
    inner: &EngineInner<V>,
    id: CellId,
    rank: Rank,
    out: Compute<V>,
    no_fail: bool,
    defer: bool,
) -> (CellId, Settled<V>) {
    match out {
        Compute::Abort => {
            inner.commit(id, rank, None, defer);
            (id, Settled::Canceled)
        }
        Compute::Value(v) => {
            let val = Value::Val(v);
            inner.commit(id, rank, Some(val.clone()), defer);
            (id, Settled::Done(val))
        }
        Compute::Cell(target) => {
            let val = Value::Cell(target);
            inner.commit(id, rank, Some(val.clone()), defer);
            (id, Settled::Done(val))
        }
        Compute::Error(reason) => {
            if no_fail {
                warn!(%id, %reason, "failure in a cell marked no-fail");
            }
            let e = CellError::new(id, inner.name_of(id), reason);
            let val = Value::Err(e);
            inner.commit(id, rank, Some(val.clone()), defer);
            (id, Settled::Done(val))
        }
        Compute::Future(_) => {
            warn!(%id, "unresolved future reached the commit path");
            inner.commit(id, rank, None, defer);
            (id, Settled::Canceled)
        }
    }
}

fn union_next<V>(st: &State<V>, id: CellId) -> Vec<CellId> {
    let mut out = st.deps.successors(id);
    out.extend(st.pointers.successors(id));
    out.sort();
    out.dedup();
    out
}

fn select_updatable<V>(st: &State<V>, frontier: &[CellId]) -> Selection {
    let might_change = partial_topological_sort(frontier, |n| union_next(st, n), false);
    let pointers: Vec<CellId> = might_change
        .iter()
        .copied()
        .filter(|id| st.cells.get(id).map_or(false, |s| s.is_pointer))
        .collect();
    let grey: HashSet<CellId> =
        partial_topological_sort(&pointers, |n| union_next(st, n), false).into_iter().collect();
    let updatable: Vec<CellId> =
        might_change.into_iter().filter(|id| !grey.contains(id)).collect();

    let updatable_set: HashSet<CellId> = updatable.iter().copied().collect();
    let frontier_set: HashSet<CellId> = frontier.iter().copied().collect();
    let to_be_recomputed: Vec<CellId> = updatable
        .iter()
        .copied()
        .filter(|&id| {
            st.deps
                .predecessors(id)
                .iter()
                .any(|p| updatable_set.contains(p) || frontier_set.contains(p))
        })
        .collect();

    Selection { updatable, to_be_recomputed, grey }
}

fn select_border<V>(
    st: &State<V>,
    frontier: &[CellId],
    updated: &[CellId],
    grey: &HashSet<CellId>,
) -> Border {
    let updated_pointers: Vec<CellId> = updated
        .iter()
        .copied()
        .filter(|id| st.cells.get(id).map_or(false, |s| s.is_pointer))
        .collect();
    // a pointer whose target chain still reaches grey has not settled its
    // indirection yet
    let grey_pointers = strictly_reachable(
        &updated_pointers,
        |n| grey.contains(&n),
        |n| st.pointers.predecessors(n),
    );
    let green: Vec<CellId> =
        updated_pointers.into_iter().filter(|id| !grey_pointers.contains(id)).collect();

    let mut border: Vec<CellId> = Vec::new();
    let mut seen: HashSet<CellId> = HashSet::new();
    for &p in &green {
        for m in union_next(st, p) {
            if seen.insert(m) {
                border.push(m);
            }
        }
    }

    let unsafe_border = strictly_reachable(
        &border,
        |n| grey.contains(&n),
        |n| {
            let mut back = st.deps.predecessors(n);
            back.extend(st.pointers.predecessors(n));
            back.sort();
            back.dedup();
            back
        },
    );
    let safe: Vec<CellId> =
        border.into_iter().filter(|id| !unsafe_border.contains(id)).collect();

    let updated_set: HashSet<CellId> = updated.iter().copied().collect();
    let frontier_set: HashSet<CellId> = frontier.iter().copied().collect();
    let to_be_recomputed: Vec<CellId> = safe
        .iter()
        .copied()
        .filter(|&id| {
            st.deps
                .predecessors(id)
                .iter()
                .any(|p| updated_set.contains(p) || frontier_set.contains(p))
        })
        .collect();

    Border { safe, to_be_recomputed }
}

/// Group a recompute wave into layers by dependency depth within the wave.
fn wave_layers<V>(st: &State<V>, ids: &[CellId]) -> Vec<Vec<CellId>> {
    let set: HashSet<CellId> = ids.iter().copied().collect();

    fn depth<V>(
        st: &State<V>,
        set: &HashSet<CellId>,
        id: CellId,
        memo: &mut HashMap<CellId, usize>,
    ) -> usize {
        if let Some(&d) = memo.get(&id) {
            return d;
        }
        // in-progress marker; cycles collapse into one layer
        memo.insert(id, 0);
        let d = st
            .cells
            .get(&id)
            .map(|slot| {
                slot.dependencies
                    .iter()
                    .filter(|dep| set.contains(dep))
                    .map(|&dep| depth(st, set, dep, memo) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(id, d);
        d
    }

    let mut memo = HashMap::new();
    let mut layers: Vec<Vec<CellId>> = Vec::new();
    for &id in ids {
        let d = depth(st, &set, id, &mut memo);
        while layers.len() <= d {
            layers.push(Vec::new());
        }
        layers[d].push(id);
    }
    layers.retain(|l| !l.is_empty());
    layers
}

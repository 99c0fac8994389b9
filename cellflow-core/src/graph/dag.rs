//! Graph Storage and Traversal
//!
//! The engine keeps two directed acyclic graphs over the same cell IDs: the
//! dependency graph (producer to consumer) and the pointer graph (pointed-to
//! cell to pointer holder). Both are instances of [`Dag`].
//!
//! The update engine traverses unions of the two graphs, so the traversal
//! helpers take a caller-supplied successor function instead of reading a
//! single `Dag`:
//!
//! - [`partial_topological_sort`] returns the cells reachable from a root
//!   set, in topological order (producers before consumers).
//! - [`strictly_reachable`] returns the subset of a frontier from which a
//!   cell satisfying a predicate is strictly reachable (at least one step
//!   away).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::cell::CellId;

/// A directed graph indexed by cell ID, with both forward and reverse edges
/// for O(1) traversal in either direction.
///
/// Adjacency sets are ordered so iteration, and with it every wave of the
/// update engine, is deterministic.
#[derive(Debug, Default)]
pub struct Dag {
    succ: HashMap<CellId, BTreeSet<CellId>>,
    pred: HashMap<CellId, BTreeSet<CellId>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with no edges. Idempotent.
    pub fn add_node(&mut self, id: CellId) {
        self.succ.entry(id).or_default();
        self.pred.entry(id).or_default();
    }

    /// Remove a node and detach every edge touching it.
    pub fn remove_node(&mut self, id: CellId) {
        if let Some(out) = self.succ.remove(&id) {
            for to in out {
                if let Some(back) = self.pred.get_mut(&to) {
                    back.remove(&id);
                }
            }
        }
        if let Some(inc) = self.pred.remove(&id) {
            for from in inc {
                if let Some(fwd) = self.succ.get_mut(&from) {
                    fwd.remove(&id);
                }
            }
        }
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.succ.contains_key(&id)
    }

    /// Add an edge `from -> to`. Both endpoints must already be nodes.
    pub fn add_edge(&mut self, from: CellId, to: CellId) {
        self.succ.entry(from).or_default().insert(to);
        self.pred.entry(to).or_default().insert(from);
    }

    /// Remove an edge. A no-op when the edge is absent.
    pub fn remove_edge(&mut self, from: CellId, to: CellId) {
        if let Some(out) = self.succ.get_mut(&from) {
            out.remove(&to);
        }
        if let Some(inc) = self.pred.get_mut(&to) {
            inc.remove(&from);
        }
    }

    /// Forward neighbors of `id`, in ID order.
    pub fn successors(&self, id: CellId) -> Vec<CellId> {
        self.succ.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Reverse neighbors of `id`, in ID order.
    pub fn predecessors(&self, id: CellId) -> Vec<CellId> {
        self.pred.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.succ.len()
    }

    /// Every edge in the graph, for diagnostics.
    pub fn edges(&self) -> Vec<(CellId, CellId)> {
        let mut out = Vec::new();
        let mut froms: Vec<_> = self.succ.keys().copied().collect();
        froms.sort();
        for from in froms {
            for to in &self.succ[&from] {
                out.push((from, *to));
            }
        }
        out
    }
}

/// Cells reachable from `roots` through `next`, in topological order.
///
/// Runs a restricted Kahn's algorithm over the reachable subgraph: only
/// edges between reachable cells count toward in-degrees. Ties are broken
/// by ID so the order is deterministic. When `include_roots` is false the
/// roots are dropped from the result (they still anchor the ordering).
///
/// The reachable subgraph is expected to be acyclic; cells trapped in a
/// cycle are logged and left out of the result.
pub fn partial_topological_sort<F>(roots: &[CellId], next: F, include_roots: bool) -> Vec<CellId>
where
    F: Fn(CellId) -> Vec<CellId>,
{
    let mut reachable: HashSet<CellId> = HashSet::new();
    let mut queue: VecDeque<CellId> = VecDeque::new();
    for &r in roots {
        if reachable.insert(r) {
            queue.push_back(r);
        }
    }
    while let Some(id) = queue.pop_front() {
        for m in next(id) {
            if reachable.insert(m) {
                queue.push_back(m);
            }
        }
    }

    let mut indegree: HashMap<CellId, usize> = reachable.iter().map(|&id| (id, 0)).collect();
    for &id in &reachable {
        for m in next(id) {
            if let Some(d) = indegree.get_mut(&m) {
                *d += 1;
            }
        }
    }

    let mut ready: BTreeSet<CellId> =
        indegree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
    let mut sorted = Vec::with_capacity(reachable.len());
    while let Some(&id) = ready.iter().next() {
        ready.remove(&id);
        sorted.push(id);
        for m in next(id) {
            if let Some(d) = indegree.get_mut(&m) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(m);
                }
            }
        }
    }

    if sorted.len() < reachable.len() {
        warn!(
            stuck = reachable.len() - sorted.len(),
            "cycle detected in reachable subgraph, some cells left unsorted"
        );
    }

    if include_roots {
        sorted
    } else {
        let roots: HashSet<CellId> = roots.iter().copied().collect();
        sorted.into_iter().filter(|id| !roots.contains(id)).collect()
    }
}

/// The subset of `frontier` from which some cell satisfying `pred` is
/// strictly reachable through `next` (one or more steps; the frontier cell
/// itself does not count).
pub fn strictly_reachable<P, F>(frontier: &[CellId], pred: P, next: F) -> HashSet<CellId>
where
    P: Fn(CellId) -> bool,
    F: Fn(CellId) -> Vec<CellId>,
{
    // can_reach includes the cell itself; cycles resolve to false through
    // the in-progress marker.
    fn go<P, F>(id: CellId, pred: &P, next: &F, memo: &mut HashMap<CellId, bool>) -> bool
    where
        P: Fn(CellId) -> bool,
        F: Fn(CellId) -> Vec<CellId>,
    {
        if let Some(&b) = memo.get(&id) {
            return b;
        }
        memo.insert(id, false);
        let hit = pred(id) || next(id).into_iter().any(|m| go(m, pred, next, memo));
        memo.insert(id, hit);
        hit
    }

    let mut memo = HashMap::new();
    frontier
        .iter()
        .copied()
        .filter(|&f| next(f).into_iter().any(|m| go(m, &pred, &next, &mut memo)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<CellId> {
        (0..n).map(|_| CellId::fresh()).collect()
    }

    fn chain(dag: &mut Dag, ids: &[CellId]) {
        for id in ids {
            dag.add_node(*id);
        }
        for w in ids.windows(2) {
            dag.add_edge(w[0], w[1]);
        }
    }

    #[test]
    fn edges_are_bidirectionally_indexed() {
        let v = ids(3);
        let mut dag = Dag::new();
        chain(&mut dag, &v);

        assert_eq!(dag.successors(v[0]), vec![v[1]]);
        assert_eq!(dag.predecessors(v[2]), vec![v[1]]);
        assert!(dag.successors(v[2]).is_empty());
    }

    #[test]
    fn remove_node_detaches_edges() {
        let v = ids(3);
        let mut dag = Dag::new();
        chain(&mut dag, &v);

        dag.remove_node(v[1]);
        assert!(dag.successors(v[0]).is_empty());
        assert!(dag.predecessors(v[2]).is_empty());
        assert!(!dag.contains(v[1]));
        assert_eq!(dag.node_count(), 2);
    }

    #[test]
    fn topological_order_respects_edges() {
        // diamond: a -> b, a -> c, b -> d, c -> d
        let v = ids(4);
        let mut dag = Dag::new();
        for id in &v {
            dag.add_node(*id);
        }
        dag.add_edge(v[0], v[1]);
        dag.add_edge(v[0], v[2]);
        dag.add_edge(v[1], v[3]);
        dag.add_edge(v[2], v[3]);

        let order = partial_topological_sort(&[v[0]], |id| dag.successors(id), true);
        assert_eq!(order.len(), 4);
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(v[0]) < pos(v[1]));
        assert!(pos(v[0]) < pos(v[2]));
        assert!(pos(v[1]) < pos(v[3]));
        assert!(pos(v[2]) < pos(v[3]));

        let without_roots = partial_topological_sort(&[v[0]], |id| dag.successors(id), false);
        assert!(!without_roots.contains(&v[0]));
        assert_eq!(without_roots.len(), 3);
    }

    #[test]
    fn sort_ignores_unreachable_cells() {
        let v = ids(3);
        let mut dag = Dag::new();
        chain(&mut dag, &v[..2]);
        dag.add_node(v[2]);

        let order = partial_topological_sort(&[v[0]], |id| dag.successors(id), true);
        assert_eq!(order, vec![v[0], v[1]]);
    }

    #[test]
    fn strict_reachability_excludes_the_frontier_cell_itself() {
        let v = ids(3);
        let mut dag = Dag::new();
        chain(&mut dag, &v);

        // v[2] satisfies the predicate; reachable from v[0] and v[1], and
        // from itself only non-strictly.
        let hits = strictly_reachable(&v, |id| id == v[2], |id| dag.successors(id));
        assert!(hits.contains(&v[0]));
        assert!(hits.contains(&v[1]));
        assert!(!hits.contains(&v[2]));
    }

    #[test]
    fn strict_reachability_handles_shared_suffixes() {
        // two frontier cells feeding one marked sink
        let v = ids(3);
        let mut dag = Dag::new();
        for id in &v {
            dag.add_node(*id);
        }
        dag.add_edge(v[0], v[2]);
        dag.add_edge(v[1], v[2]);

        let hits = strictly_reachable(&[v[0], v[1]], |id| id == v[2], |id| dag.successors(id));
        assert_eq!(hits.len(), 2);
    }
}

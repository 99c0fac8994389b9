//! Introspection
//!
//! Read-only snapshots of the engine for diagnostics: the cell table, both
//! edge sets, and a Graphviz DOT rendering. Nothing here can mutate the
//! graph.

use std::fmt::Write as _;

use crate::cell::id::{CellId, Rank};
use crate::engine::Engine;

/// Diagnostic view of one cell.
#[derive(Debug, Clone)]
pub struct CellInfo {
    pub id: CellId,
    pub name: String,
    pub derived: bool,
    pub has_value: bool,
    pub is_error: bool,
    pub pointed: Option<CellId>,
    pub value_rank: Rank,
    pub current_rank: Rank,
    pub subscribers: usize,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub cells: Vec<CellInfo>,
    pub dependency_edges: Vec<(CellId, CellId)>,
    pub pointer_edges: Vec<(CellId, CellId)>,
}

impl<V: Clone + Send + Sync + 'static> Engine<V> {
    /// Snapshot the cell table and both graphs.
    pub fn snapshot(&self) -> GraphSnapshot {
        let st = self.inner.state.lock();
        let cells = st
            .cells
            .values()
            .map(|slot| CellInfo {
                id: slot.id,
                name: st
                    .names
                    .get(&slot.id)
                    .cloned()
                    .unwrap_or_else(|| format!("cell{}", slot.id.raw())),
                derived: slot.is_derived(),
                has_value: slot.value.is_some(),
                is_error: matches!(slot.value, Some(crate::cell::Value::Err(_))),
                pointed: slot.pointed,
                value_rank: slot.value_rank,
                current_rank: slot.current_rank,
                subscribers: slot.subscribers.len(),
            })
            .collect();
        GraphSnapshot {
            cells,
            dependency_edges: st.deps.edges(),
            pointer_edges: st.pointers.edges(),
        }
    }
}

impl GraphSnapshot {
    /// Render the snapshot as a Graphviz digraph. Dependency edges are
    /// solid, pointer edges dashed; errors red, pointers orange, unset
    /// cells gray.
    pub fn to_dot(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", title.replace('"', "'"));
        let _ = writeln!(out, "  rankdir=LR;");
        for cell in &self.cells {
            let color = if cell.is_error {
                "red"
            } else if cell.pointed.is_some() {
                "orange"
            } else if !cell.has_value {
                "gray"
            } else if cell.derived {
                "palegreen"
            } else {
                "lightblue"
            };
            let _ = writeln!(
                out,
                "  n{} [label=\"{}\" style=filled fillcolor={}];",
                cell.id.raw(),
                cell.name.replace('"', "'"),
                color
            );
        }
        for (from, to) in &self.dependency_edges {
            let _ = writeln!(out, "  n{} -> n{};", from.raw(), to.raw());
        }
        for (from, to) in &self.pointer_edges {
            let _ = writeln!(out, "  n{} -> n{} [style=dashed];", from.raw(), to.raw());
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Compute;

    #[test]
    fn snapshot_reflects_cells_and_edges() {
        let engine: Engine<i32> = Engine::new();
        let a = engine.new_source_named(1, "a");
        let b = engine.derive(&[a.id()], |v| Compute::Value(v[0] + 1)).unwrap();

        let snap = engine.snapshot();
        assert_eq!(snap.cells.len(), 2);
        assert_eq!(snap.dependency_edges, vec![(a.id(), b.id())]);
        assert!(snap.pointer_edges.is_empty());

        let a_info = snap.cells.iter().find(|c| c.id == a.id()).unwrap();
        assert_eq!(a_info.name, "a");
        assert!(!a_info.derived);
        assert!(a_info.has_value);
    }

    #[test]
    fn dot_output_contains_every_cell() {
        let engine: Engine<i32> = Engine::new();
        let a = engine.new_source_named(1, "a");
        let b = engine.derive(&[a.id()], |v| Compute::Value(v[0] + 1)).unwrap();

        let dot = engine.snapshot().to_dot("graph");
        assert!(dot.starts_with("digraph \"graph\" {"));
        assert!(dot.contains(&format!("n{} [label=\"a\"", a.id().raw())));
        assert!(dot.contains(&format!("n{} -> n{};", a.id().raw(), b.id().raw())));
        assert!(dot.ends_with("}\n"));
    }
}

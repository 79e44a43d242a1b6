//! The dependency graph over cells.
//!
//! Edges are never stored on their own. Every mutation rebuilds the edge set
//! from the registered name sets, so an edge exists exactly when some name in
//! one cell's `defs` appears in another cell's `refs`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

use super::types::{
    CellId, CellSnapshot, EdgeSnapshot, GraphSnapshot, Name, NameSets, StructuralStatus,
    Violation, ViolationKind,
};
use crate::error::{Error, Result};

/// The reactive dependency graph engine.
pub struct GraphEngine {
    /// Name sets by cell, in registration order.
    cells: IndexMap<CellId, NameSets, FxBuildHasher>,
    /// The directed graph: edges go from definer to reader, weighted by the
    /// names that connect them.
    graph: DiGraph<CellId, Vec<Name>>,
    /// Cell ID to node index mapping
    node_indices: FxHashMap<CellId, NodeIndex>,
    /// Name to defining cells, in registration order.
    definers: BTreeMap<Name, Vec<CellId>>,
    /// Result of the last invariant check.
    status: StructuralStatus,
    private_prefix: String,
}

impl GraphEngine {
    /// Create a new empty graph engine using `_` as the private marker.
    pub fn new() -> Self {
        Self::with_private_prefix("_")
    }

    pub fn with_private_prefix(prefix: impl Into<String>) -> Self {
        Self {
            cells: IndexMap::default(),
            graph: DiGraph::new(),
            node_indices: FxHashMap::default(),
            definers: BTreeMap::new(),
            status: StructuralStatus::Ok,
            private_prefix: prefix.into(),
        }
    }

    /// Register a cell or replace its name sets.
    ///
    /// A cell keeps its registration position across updates. Returns the
    /// structural status of the whole graph afterwards.
    pub fn upsert_cell(&mut self, id: CellId, mut names: NameSets) -> StructuralStatus {
        names.normalize(&self.private_prefix);
        self.cells.insert(id, names);
        self.rebuild();
        self.status.clone()
    }

    /// Remove a cell and every edge touching it.
    ///
    /// Returns the cell's former direct children and the status of what
    /// remains.
    pub fn remove_cell(&mut self, id: CellId) -> Result<(Vec<CellId>, StructuralStatus)> {
        if !self.cells.contains_key(&id) {
            return Err(Error::CellNotFound(id));
        }
        let children = self.children_of(id);
        self.cells.shift_remove(&id);
        self.rebuild();
        Ok((children, self.status.clone()))
    }

    /// Recompute definers, edges and invariants from the name sets.
    fn rebuild(&mut self) {
        self.definers.clear();
        for (&id, names) in &self.cells {
            for name in &names.defs {
                self.definers.entry(name.clone()).or_default().push(id);
            }
        }

        self.graph = DiGraph::with_capacity(self.cells.len(), self.cells.len());
        self.node_indices.clear();
        for &id in self.cells.keys() {
            let idx = self.graph.add_node(id);
            self.node_indices.insert(id, idx);
        }

        // Group names per (definer, reader) pair, keeping first-seen order
        let mut edges: IndexMap<(CellId, CellId), Vec<Name>, FxBuildHasher> = IndexMap::default();
        for (&reader, names) in &self.cells {
            for name in &names.refs {
                let Some(producers) = self.definers.get(name) else {
                    continue;
                };
                for &producer in producers {
                    if producer != reader {
                        edges
                            .entry((producer, reader))
                            .or_default()
                            .push(name.clone());
                    }
                }
            }
        }
        for ((from, to), names) in edges {
            self.graph
                .add_edge(self.node_indices[&from], self.node_indices[&to], names);
        }

        self.status = self.check_invariants();
    }

    /// Evaluate namespace uniqueness and acyclicity over the whole graph.
    fn check_invariants(&self) -> StructuralStatus {
        let mut violations = Vec::new();

        for (name, cells) in &self.definers {
            if cells.len() > 1 {
                violations.push(Violation {
                    kind: ViolationKind::MultipleDefinition { name: name.clone() },
                    members: cells.iter().copied().collect(),
                });
            }
        }

        violations.extend(self.detect_cycles());

        if violations.is_empty() {
            StructuralStatus::Ok
        } else {
            StructuralStatus::Violations(violations)
        }
    }

    /// Find every cycle, reporting exactly the cells on it.
    ///
    /// Cells belonging to one strongly connected component form one
    /// violation. A cell that merely depends on a cycle is not a member.
    fn detect_cycles(&self) -> Vec<Violation> {
        use petgraph::algo::kosaraju_scc;

        let mut cycles: Vec<Violation> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| Violation {
                kind: ViolationKind::Cycle,
                members: scc.into_iter().map(|idx| self.graph[idx]).collect(),
            })
            .collect();

        cycles.sort_by_key(|v| v.members.first().copied());
        if !cycles.is_empty() {
            tracing::debug!("found {} dependency cycle(s)", cycles.len());
        }
        cycles
    }

    /// Current structural status.
    pub fn status(&self) -> &StructuralStatus {
        &self.status
    }

    /// Registration position, used to break ties deterministically.
    fn position(&self, id: CellId) -> usize {
        self.cells.get_index_of(&id).unwrap_or(usize::MAX)
    }

    fn sort_by_position(&self, cells: &mut [CellId]) {
        cells.sort_by_key(|&id| self.position(id));
    }

    fn neighbors(&self, id: CellId, direction: Direction) -> Vec<CellId> {
        let Some(&idx) = self.node_indices.get(&id) else {
            return Vec::new();
        };
        let mut cells: Vec<CellId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n])
            .collect();
        self.sort_by_position(&mut cells);
        cells
    }

    /// Direct dependents of a cell, in registration order.
    pub fn children_of(&self, id: CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependencies of a cell, in registration order.
    pub fn parents_of(&self, id: CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Every transitive dependency of a cell, closest first.
    ///
    /// An ancestor always comes before its own ancestors: cells are ordered
    /// by the length of the longest path from them down to `id`, then by
    /// registration order.
    pub fn ancestors_of(&self, id: CellId) -> Vec<CellId> {
        let ancestors = self.closure([id], Direction::Incoming);

        let mut depth: FxHashMap<CellId, usize> = FxHashMap::default();
        depth.insert(id, 0);
        let mut visiting = FxHashSet::default();
        for &cell in &ancestors {
            self.longest_path_to(cell, id, &ancestors, &mut depth, &mut visiting);
        }

        let mut ordered: Vec<CellId> = ancestors.into_iter().filter(|&c| c != id).collect();
        ordered.sort_by_key(|&c| (depth.get(&c).copied().unwrap_or(0), self.position(c)));
        ordered
    }

    /// Longest path (in edges) from `cell` to `target` inside `within`.
    fn longest_path_to(
        &self,
        cell: CellId,
        target: CellId,
        within: &FxHashSet<CellId>,
        depth: &mut FxHashMap<CellId, usize>,
        visiting: &mut FxHashSet<CellId>,
    ) -> usize {
        if let Some(&d) = depth.get(&cell) {
            return d;
        }
        // Back edge on a cycle; treat as already at the target
        if !visiting.insert(cell) {
            return 0;
        }
        let mut best = 0;
        for child in self.children_of(cell) {
            if child == target || within.contains(&child) {
                best = best.max(1 + self.longest_path_to(child, target, within, depth, visiting));
            }
        }
        visiting.remove(&cell);
        depth.insert(cell, best);
        best
    }

    /// Registered `roots` plus everything reachable from them in `direction`.
    fn closure(
        &self,
        roots: impl IntoIterator<Item = CellId>,
        direction: Direction,
    ) -> FxHashSet<CellId> {
        let mut seen = FxHashSet::default();
        let mut queue: VecDeque<CellId> = roots
            .into_iter()
            .filter(|id| self.cells.contains_key(id))
            .collect();

        while let Some(cell) = queue.pop_front() {
            if !seen.insert(cell) {
                continue;
            }
            for next in self.neighbors(cell, direction) {
                if !seen.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Transitive dependents of `roots`, roots included.
    pub fn descendants_of(&self, roots: impl IntoIterator<Item = CellId>) -> FxHashSet<CellId> {
        self.closure(roots, Direction::Outgoing)
    }

    /// The descendant closure of `roots` split into dependency levels.
    ///
    /// Every cell in level *k* depends only on cells in earlier levels or
    /// outside the closure, so cells within a level are independent. Levels
    /// are sorted by registration order. Cells on a cycle, and everything
    /// downstream of one, never become ready and are left out.
    pub fn topological_batches(&self, roots: impl IntoIterator<Item = CellId>) -> Vec<Vec<CellId>> {
        let closure = self.descendants_of(roots);
        self.levels_within(&closure)
    }

    /// Kahn layering of `cells`, counting only edges inside the set.
    pub fn levels_within(&self, cells: &FxHashSet<CellId>) -> Vec<Vec<CellId>> {
        let mut in_degree: FxHashMap<CellId, usize> = FxHashMap::default();
        for &cell in cells {
            let degree = self
                .parents_of(cell)
                .into_iter()
                .filter(|p| cells.contains(p))
                .count();
            in_degree.insert(cell, degree);
        }

        let mut ready: Vec<CellId> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&c, _)| c)
            .collect();
        let mut levels = Vec::new();

        while !ready.is_empty() {
            self.sort_by_position(&mut ready);
            let mut next = Vec::new();
            for &cell in &ready {
                for child in self.children_of(cell) {
                    if let Some(degree) = in_degree.get_mut(&child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(child);
                        }
                    }
                }
            }
            levels.push(std::mem::replace(&mut ready, next));
        }

        levels
    }

    /// Names read by `id` that no registered cell defines.
    pub fn unresolved_refs(&self, id: CellId) -> BTreeSet<Name> {
        self.cells
            .get(&id)
            .map(|names| {
                names
                    .refs
                    .iter()
                    .filter(|name| !self.definers.contains_key(*name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every name read by `id` or by any of its ancestors.
    pub fn transitive_refs(&self, id: CellId) -> BTreeSet<Name> {
        self.closure([id], Direction::Incoming)
            .into_iter()
            .filter_map(|cell| self.cells.get(&cell))
            .flat_map(|names| names.refs.iter().cloned())
            .collect()
    }

    /// The single cell defining `name`, if exactly one does.
    pub fn definer_of(&self, name: &str) -> Option<CellId> {
        match self.definers.get(name).map(Vec::as_slice) {
            Some([only]) => Some(*only),
            _ => None,
        }
    }

    /// Name sets of a registered cell, after normalization.
    pub fn names(&self, id: CellId) -> Option<&NameSets> {
        self.cells.get(&id)
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// All cells in registration order.
    pub fn cell_ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.keys().copied()
    }

    /// Get the number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All edges, ordered by reader then definer registration order.
    pub fn edges(&self) -> Vec<EdgeSnapshot> {
        let mut edges: Vec<EdgeSnapshot> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (from, to) = self.graph.edge_endpoints(e)?;
                Some(EdgeSnapshot {
                    from: self.graph[from],
                    to: self.graph[to],
                    names: self.graph[e].clone(),
                })
            })
            .collect();
        edges.sort_by_key(|e| (self.position(e.to), self.position(e.from)));
        edges
    }

    /// A consistent copy of cells, edges and status.
    pub fn snapshot(&self) -> GraphSnapshot {
        let cells = self
            .cells
            .iter()
            .map(|(&id, names)| CellSnapshot {
                id,
                refs: names.refs.clone(),
                defs: names.defs.clone(),
                private_defs: names.private_defs.clone(),
                unresolved_refs: self.unresolved_refs(id),
                transitive_refs: self.transitive_refs(id),
                state: None,
            })
            .collect();

        GraphSnapshot {
            cells,
            edges: self.edges(),
            status: self.status.clone(),
        }
    }
}

impl Default for GraphEngine {
    fn default() -> Self {
        Self::new()
    }
}

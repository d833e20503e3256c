//! Types for the graph engine.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};

/// Unique identifier for a cell within a notebook.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct CellId(pub(crate) usize);

impl CellId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell_{}", self.0)
    }
}

/// Whether a name is private to the cell that binds it.
///
/// Exactly one leading underscore makes a name private. Dunder names and the
/// bare wildcard `_` are not private.
pub fn is_private_name(name: &str) -> bool {
    name.len() > 1 && name.starts_with('_') && !name.starts_with("__")
}

/// The reference/definition contract of a cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CellSignature {
    /// Names the cell reads but does not define.
    pub refs: BTreeSet<String>,
    /// Names the cell binds at top level.
    pub defs: BTreeSet<String>,
}

impl CellSignature {
    /// Build a signature from an explicitly declared contract.
    ///
    /// Every name must be a valid identifier. Private names are dropped and
    /// names the cell defines are removed from its references.
    pub fn declared<R, D>(refs: R, defs: D) -> Result<Self>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let refs: Vec<String> = refs.into_iter().map(Into::into).collect();
        let defs: Vec<String> = defs.into_iter().map(Into::into).collect();

        for name in refs.iter().chain(defs.iter()) {
            if syn::parse_str::<syn::Ident>(name).is_err() {
                return Err(Error::Parse(format!("'{}' is not a valid name", name)));
            }
        }

        Ok(Self::normalized(refs, defs))
    }

    /// Apply the private-name and self-reference rules without validation.
    pub(crate) fn normalized(
        refs: impl IntoIterator<Item = String>,
        defs: impl IntoIterator<Item = String>,
    ) -> Self {
        let defs: BTreeSet<String> = defs.into_iter().filter(|n| !is_private_name(n)).collect();
        let refs = refs
            .into_iter()
            .filter(|n| !is_private_name(n) && !defs.contains(n))
            .collect();
        Self { refs, defs }
    }
}

/// Graph-level information about a cell.
#[derive(Debug, Clone)]
pub struct CellInfo {
    /// Unique identifier
    pub id: CellId,
    /// User-given name, if any
    pub name: Option<String>,
    /// Reference/definition contract
    pub signature: CellSignature,
    /// Whether this is the notebook's setup cell
    pub is_setup: bool,
}

impl CellInfo {
    pub fn new(id: CellId, name: Option<String>, signature: CellSignature) -> Self {
        Self {
            id,
            name,
            signature,
            is_setup: false,
        }
    }

    /// Create the setup cell.
    pub fn setup(id: CellId, signature: CellSignature) -> Self {
        Self {
            id,
            name: Some("setup".to_string()),
            signature,
            is_setup: true,
        }
    }

    /// Name used in outputs and logs (anonymous cells get a placeholder).
    pub fn display_name(&self) -> String {
        display_name(self.id, self.name.as_deref())
    }
}

/// Placeholder-aware display name for a cell.
pub(crate) fn display_name(id: CellId, name: Option<&str>) -> String {
    match name {
        Some(name) => name.to_string(),
        None => format!("__anon_{}", id.as_usize()),
    }
}

/// The reactive dependency graph engine.
///
/// Edges go from producer to consumer. The setup cell is a node without
/// edges: its definitions form the ambient context.
#[derive(Debug, Clone, Default)]
pub struct GraphEngine {
    /// The directed graph: edges go from producer to consumer
    graph: DiGraph<CellId, ()>,
    /// Cell ID to node index mapping
    node_indices: FxHashMap<CellId, NodeIndex>,
    /// Cell information by ID
    cells: FxHashMap<CellId, CellInfo>,
    /// Presentation order
    order: Vec<CellId>,
    positions: FxHashMap<CellId, usize>,
    /// Definition name to owning cell (non-setup cells)
    def_owner: FxHashMap<String, CellId>,
    /// Setup-cell definitions
    ambient: FxHashMap<String, CellId>,
    setup: Option<CellId>,
    /// Name to the cells that reference it
    readers: FxHashMap<String, Vec<CellId>>,
    /// References with no owning cell, per cell
    external: FxHashMap<CellId, BTreeSet<String>>,
}

impl GraphEngine {
    /// Create a new empty graph engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from cells in presentation order.
    pub fn build(cells: impl IntoIterator<Item = CellInfo>) -> Result<Self> {
        let mut engine = Self::new();

        for cell in cells {
            engine.add_cell(cell)?;
        }

        engine.resolve_dependencies()?;
        Ok(engine)
    }

    /// Add a cell and claim its definitions (first pass).
    fn add_cell(&mut self, mut cell: CellInfo) -> Result<()> {
        let id = cell.id;
        if self.cells.contains_key(&id) {
            return Err(Error::InvalidOperation(format!("duplicate cell id {}", id)));
        }

        // Re-apply the normalization rules in case the info was built by hand
        cell.signature = CellSignature::normalized(
            std::mem::take(&mut cell.signature.refs),
            std::mem::take(&mut cell.signature.defs),
        );

        if cell.is_setup {
            if let Some(existing) = self.setup {
                return Err(Error::InvalidSetupCell(format!(
                    "both {} and {} are marked as setup cells",
                    existing, id
                )));
            }
            if !cell.signature.refs.is_empty() {
                let refs: Vec<_> = cell.signature.refs.iter().cloned().collect();
                return Err(Error::InvalidSetupCell(format!(
                    "setup cell must not reference other cells, found: {}",
                    refs.join(", ")
                )));
            }
            self.setup = Some(id);
        }

        for name in &cell.signature.defs {
            if let Some(&first) = self.def_owner.get(name).or_else(|| self.ambient.get(name)) {
                return Err(Error::DefinitionConflict {
                    name: name.clone(),
                    first,
                    second: id,
                });
            }
            if cell.is_setup {
                self.ambient.insert(name.clone(), id);
            } else {
                self.def_owner.insert(name.clone(), id);
            }
        }

        let node_idx = self.graph.add_node(id);
        self.node_indices.insert(id, node_idx);
        self.positions.insert(id, self.order.len());
        self.order.push(id);
        self.cells.insert(id, cell);
        Ok(())
    }

    /// Resolve references and build edges (second pass).
    fn resolve_dependencies(&mut self) -> Result<()> {
        let mut edges_to_add = Vec::new();

        for &cell_id in &self.order {
            let cell = &self.cells[&cell_id];
            if cell.is_setup {
                continue;
            }
            for name in &cell.signature.refs {
                self.readers.entry(name.clone()).or_default().push(cell_id);
                match self.def_owner.get(name) {
                    Some(&producer) => edges_to_add.push((producer, cell_id)),
                    None => {
                        // Ambient (setup) names and outer symbols: no edge
                        self.external
                            .entry(cell_id)
                            .or_default()
                            .insert(name.clone());
                    }
                }
            }
        }

        for (producer, consumer) in edges_to_add {
            let producer_idx = self.node_indices[&producer];
            let consumer_idx = self.node_indices[&consumer];
            self.graph.update_edge(producer_idx, consumer_idx, ());
        }

        self.detect_cycles()
    }

    /// Detect cycles in the graph and return a helpful error message.
    fn detect_cycles(&self) -> Result<()> {
        use petgraph::algo::kosaraju_scc;

        let mut sccs: Vec<Vec<CellId>> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| {
                let mut ids: Vec<CellId> = scc.into_iter().map(|idx| self.graph[idx]).collect();
                ids.sort_by_key(|id| self.positions[id]);
                ids
            })
            .collect();
        sccs.sort_by_key(|scc| self.positions[&scc[0]]);

        if let Some(scc) = sccs.first() {
            let cycle_names: Vec<String> =
                scc.iter().map(|id| self.cells[id].display_name()).collect();
            return Err(Error::CyclicDependency(format!(
                "{} → {}",
                cycle_names.join(" → "),
                cycle_names[0]
            )));
        }

        Ok(())
    }

    /// Ordering key: the setup cell first, then presentation order.
    fn sort_key(&self, id: CellId) -> (usize, usize) {
        let setup_rank = if Some(id) == self.setup { 0 } else { 1 };
        (setup_rank, self.positions[&id])
    }

    /// Get all cells in topological order.
    ///
    /// Ties are broken by presentation order, so the result is stable for an
    /// unchanged graph.
    pub fn topological_order(&self) -> Vec<CellId> {
        let all: FxHashSet<CellId> = self.order.iter().copied().collect();
        self.order_subset(&all)
    }

    /// Order a subset of cells topologically, considering only edges inside
    /// the subset.
    pub fn order_subset(&self, subset: &FxHashSet<CellId>) -> Vec<CellId> {
        let mut in_degree: FxHashMap<CellId, usize> = FxHashMap::default();
        for &id in subset {
            let Some(&idx) = self.node_indices.get(&id) else {
                continue;
            };
            let degree = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter(|n| subset.contains(&self.graph[*n]))
                .count();
            in_degree.insert(id, degree);
        }

        let mut ready: BinaryHeap<Reverse<((usize, usize), CellId)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&id, _)| Reverse((self.sort_key(id), id)))
            .collect();

        let mut sorted = Vec::with_capacity(in_degree.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            sorted.push(id);
            for consumer in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(&consumer) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.sort_key(consumer), consumer)));
                    }
                }
            }
        }

        sorted
    }

    /// Compute the cells that must re-run.
    ///
    /// Starts from `seeds` (cells that run themselves) and the readers of
    /// `names` (values that changed without their owner re-running), then
    /// follows edges to all transitive consumers. Excluded cells are neither
    /// included nor traversed through.
    pub fn consumer_closure<S: AsRef<str>>(
        &self,
        seeds: &[CellId],
        names: &[S],
        excluded: &FxHashSet<CellId>,
    ) -> FxHashSet<CellId> {
        let mut closure = FxHashSet::default();
        let mut queue = VecDeque::new();

        let mut start: Vec<CellId> = Vec::new();
        for &seed in seeds {
            if !self.cells.contains_key(&seed) {
                continue;
            }
            start.push(seed);
            if Some(seed) == self.setup {
                // Ambient definitions reach their readers without edges
                for name in &self.cells[&seed].signature.defs {
                    start.extend(self.readers_of(name));
                }
            }
        }
        for name in names {
            start.extend(self.readers_of(name.as_ref()));
        }

        for id in start {
            if !excluded.contains(&id) && closure.insert(id) {
                queue.push_back(id);
            }
        }

        while let Some(cell_id) = queue.pop_front() {
            for consumer in self.dependents(cell_id) {
                if !excluded.contains(&consumer) && closure.insert(consumer) {
                    queue.push_back(consumer);
                }
            }
        }

        closure
    }

    /// Cells needed to evaluate `target`, in execution order, ending with
    /// `target` itself.
    ///
    /// References for which `satisfied` returns true are not followed to
    /// their producers.
    pub fn upstream_closure(
        &self,
        target: CellId,
        satisfied: impl Fn(&str) -> bool,
    ) -> Vec<CellId> {
        let mut needed = FxHashSet::default();
        let mut stack = vec![target];

        while let Some(cell_id) = stack.pop() {
            if !needed.insert(cell_id) {
                continue;
            }
            let Some(cell) = self.cells.get(&cell_id) else {
                continue;
            };
            for name in &cell.signature.refs {
                if satisfied(name) {
                    continue;
                }
                if let Some(&producer) = self.def_owner.get(name) {
                    stack.push(producer);
                }
            }
        }

        self.order_subset(&needed)
    }

    /// Group cells by dependency level for parallel execution.
    ///
    /// Cells in the same level have no dependencies on each other
    /// and can be executed in parallel.
    pub fn topological_levels(&self, cells: &[CellId]) -> Vec<Vec<CellId>> {
        let subset: FxHashSet<CellId> = cells.iter().copied().collect();
        let mut level_of: FxHashMap<CellId, usize> = FxHashMap::default();
        let mut levels: Vec<Vec<CellId>> = Vec::new();

        for id in self.order_subset(&subset) {
            let level = self
                .dependencies(id)
                .iter()
                .filter_map(|dep| level_of.get(dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(id, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id);
        }

        levels
    }

    /// Get a cell by ID.
    pub fn get_cell(&self, id: CellId) -> Option<&CellInfo> {
        self.cells.get(&id)
    }

    /// Get a cell by its display name.
    pub fn get_cell_by_name(&self, name: &str) -> Option<&CellInfo> {
        self.order
            .iter()
            .map(|id| &self.cells[id])
            .find(|cell| cell.display_name() == name)
    }

    /// Get all cells in presentation order.
    pub fn cells(&self) -> impl Iterator<Item = &CellInfo> {
        self.order.iter().map(|id| &self.cells[id])
    }

    /// Presentation index of a cell.
    pub fn position(&self, id: CellId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// The setup cell, if the notebook has one.
    pub fn setup_cell(&self) -> Option<CellId> {
        self.setup
    }

    /// Get the number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The cell that defines `name`, including the setup cell.
    pub fn owner_of(&self, name: &str) -> Option<CellId> {
        self.def_owner
            .get(name)
            .or_else(|| self.ambient.get(name))
            .copied()
    }

    /// Whether `name` is provided by the setup cell.
    pub fn is_ambient(&self, name: &str) -> bool {
        self.ambient.contains_key(name)
    }

    /// Cells whose references include `name`.
    pub fn readers_of(&self, name: &str) -> Vec<CellId> {
        self.readers.get(name).cloned().unwrap_or_default()
    }

    /// References of a cell that resolve to no cell edge.
    pub fn external_refs(&self, id: CellId) -> BTreeSet<String> {
        self.external.get(&id).cloned().unwrap_or_default()
    }

    /// Get direct dependencies of a cell, in presentation order.
    pub fn dependencies(&self, id: CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get direct dependents of a cell, in presentation order.
    pub fn dependents(&self, id: CellId) -> Vec<CellId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: CellId, direction: Direction) -> Vec<CellId> {
        let mut ids: Vec<CellId> = self
            .node_indices
            .get(&id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .map(|n| self.graph[n])
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_by_key(|id| self.positions[id]);
        ids.dedup();
        ids
    }

    /// All producer → consumer edges, sorted by presentation order.
    pub fn edges(&self) -> Vec<(CellId, CellId)> {
        let mut edges: Vec<(CellId, CellId)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a], self.graph[b]))
            .collect();
        edges.sort_by_key(|(a, b)| (self.positions[a], self.positions[b]));
        edges
    }
}

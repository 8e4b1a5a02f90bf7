use arc_swap::ArcSwapOption;
use changegraph_core::{
    ChangeGraphError, Criticality, DependencyEdge, DependencyKind, Direction, Resource,
    ResourceKey, ResourceType, Result,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What the graph needs to know about a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub resource_type: ResourceType,
    pub criticality: Criticality,
    pub removed: bool,
    /// Node was created implicitly by an edge endpoint.
    pub placeholder: bool,
}

impl NodeInfo {
    fn placeholder() -> Self {
        Self {
            resource_type: ResourceType::Other,
            criticality: Criticality::Medium,
            removed: false,
            placeholder: true,
        }
    }
}

impl From<&Resource> for NodeInfo {
    fn from(r: &Resource) -> Self {
        Self {
            resource_type: r.resource_type.clone(),
            criticality: r.criticality,
            removed: r.removed,
            placeholder: false,
        }
    }
}

/// Adjacency in both directions; neighbor sets are ordered for determinism.
#[derive(Debug, Clone, Default)]
pub(crate) struct GraphState {
    pub(crate) nodes: HashMap<ResourceKey, NodeInfo>,
    /// from -> resources it depends on
    pub(crate) forward: HashMap<ResourceKey, BTreeSet<ResourceKey>>,
    /// to -> resources depending on it
    pub(crate) reverse: HashMap<ResourceKey, BTreeSet<ResourceKey>>,
    pub(crate) kinds: HashMap<(ResourceKey, ResourceKey), Vec<DependencyKind>>,
    pub(crate) edge_count: usize,
}

/// Immutable point-in-time view of the dependency graph.
///
/// Analyses hold an `Arc<GraphSnapshot>` for their whole run and never see
/// writes that happen meanwhile.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub(crate) state: GraphState,
    version: u64,
}

impl GraphSnapshot {
    pub(crate) fn new(state: GraphState, version: u64) -> Self {
        Self { state, version }
    }

    /// Build a standalone snapshot, bypassing `DependencyGraph`.
    pub fn from_parts(resources: &[Resource], edges: &[DependencyEdge]) -> Result<Self> {
        let graph = DependencyGraph::new();
        graph.load(resources, edges)?;
        Ok(graph.snapshot().as_ref().clone())
    }

    /// Monotonic write counter at the time the snapshot was taken.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.nodes.contains_key(key)
    }

    pub fn node(&self, key: &ResourceKey) -> Option<&NodeInfo> {
        self.state.nodes.get(key)
    }

    /// Criticality of a node; unknown nodes count as `Medium`.
    pub fn criticality(&self, key: &ResourceKey) -> Criticality {
        self.state
            .nodes
            .get(key)
            .map(|n| n.criticality)
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.edge_count
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.state.nodes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Direct neighbors in ascending key order.
    ///
    /// `Direction::Dependencies` yields what `key` depends on;
    /// `Direction::Dependents` yields what depends on `key`.
    pub fn neighbors(&self, key: &ResourceKey, direction: Direction) -> Vec<ResourceKey> {
        self.adjacent(key, direction)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn adjacent(
        &self,
        key: &ResourceKey,
        direction: Direction,
    ) -> Option<&BTreeSet<ResourceKey>> {
        match direction {
            Direction::Dependencies => self.state.forward.get(key),
            Direction::Dependents => self.state.reverse.get(key),
        }
    }

    /// Kinds recorded for the edge `from -> to`.
    pub fn edge_kinds(&self, from: &ResourceKey, to: &ResourceKey) -> &[DependencyKind] {
        self.state
            .kinds
            .get(&(from.clone(), to.clone()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every edge, sorted by (from, to).
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let sorted: BTreeMap<&(ResourceKey, ResourceKey), &Vec<DependencyKind>> =
            self.state.kinds.iter().collect();
        sorted
            .into_iter()
            .flat_map(|((from, to), kinds)| {
                kinds
                    .iter()
                    .map(move |k| DependencyEdge::new(from.clone(), to.clone(), k.clone()))
            })
            .collect()
    }
}

/// Mutable dependency graph with snapshot publication.
///
/// Writers take the state lock briefly and invalidate the published
/// snapshot; readers rebuild it lazily at most once per write burst.
pub struct DependencyGraph {
    state: RwLock<GraphState>,
    published: ArcSwapOption<GraphSnapshot>,
    version: AtomicU64,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            published: ArcSwapOption::empty(),
            version: AtomicU64::new(0),
        }
    }

    /// Insert or refresh the node for a resource.
    pub fn upsert_resource(&self, resource: &Resource) {
        let mut state = self.state.write();
        let info = NodeInfo::from(resource);
        if state.nodes.get(&resource.key) == Some(&info) {
            return;
        }
        state.nodes.insert(resource.key.clone(), info);
        self.invalidate();
    }

    /// Add `from depends on to`. Returns `false` when the identical edge
    /// already exists.
    pub fn add_edge(&self, edge: DependencyEdge) -> Result<bool> {
        if edge.from == edge.to {
            return Err(ChangeGraphError::Validation(format!(
                "self-dependency on {} rejected",
                edge.from
            )));
        }

        let mut state = self.state.write();
        let pair = (edge.from.clone(), edge.to.clone());
        if let Some(kinds) = state.kinds.get(&pair) {
            if kinds.contains(&edge.kind) {
                return Ok(false);
            }
        }

        state
            .nodes
            .entry(edge.from.clone())
            .or_insert_with(NodeInfo::placeholder);
        state
            .nodes
            .entry(edge.to.clone())
            .or_insert_with(NodeInfo::placeholder);
        state
            .forward
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone());
        state
            .reverse
            .entry(edge.to.clone())
            .or_default()
            .insert(edge.from.clone());
        state.kinds.entry(pair).or_default().push(edge.kind);
        state.edge_count += 1;
        self.invalidate();
        Ok(true)
    }

    /// Bulk load, e.g. when hydrating from a store snapshot.
    pub fn load(&self, resources: &[Resource], edges: &[DependencyEdge]) -> Result<()> {
        for resource in resources {
            self.upsert_resource(resource);
        }
        for edge in edges {
            self.add_edge(edge.clone())?;
        }
        debug!(
            resources = resources.len(),
            edges = edges.len(),
            "dependency graph loaded"
        );
        Ok(())
    }

    /// Current point-in-time snapshot.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        if let Some(snapshot) = self.published.load_full() {
            return snapshot;
        }
        let state = self.state.read();
        // Another reader may have published while we waited for the lock.
        if let Some(snapshot) = self.published.load_full() {
            return snapshot;
        }
        let snapshot = Arc::new(GraphSnapshot::new(
            state.clone(),
            self.version.load(Ordering::Acquire),
        ));
        self.published.store(Some(snapshot.clone()));
        snapshot
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.read().nodes.contains_key(key)
    }

    pub fn neighbors(&self, key: &ResourceKey, direction: Direction) -> Vec<ResourceKey> {
        self.snapshot().neighbors(key, direction)
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edge_count
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    // Called with the write lock held.
    fn invalidate(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.published.store(None);
    }
}

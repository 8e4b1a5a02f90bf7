use crate::DependencyGraph;
use async_trait::async_trait;
use changegraph_core::{
    Change, ChangeGraphError, ChangeId, Deadline, DependencyEdge, Direction, GraphStore,
    ReachableSet, Resource, ResourceKey, Result, StoreSnapshot,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// DashMap-backed store for tests and single-process deployments.
///
/// Writers share `gate` while `load_snapshot` holds it exclusively, so a
/// snapshot never sees half of a write. `set_available(false)` simulates a
/// backend outage: every call then fails with `StoreUnavailable`.
pub struct MemoryGraphStore {
    resources: DashMap<ResourceKey, Resource>,
    changes: DashMap<ChangeId, Change>,
    history: DashMap<ResourceKey, Vec<ChangeId>>,
    graph: DependencyGraph,
    gate: RwLock<()>,
    available: AtomicBool,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            changes: DashMap::new(),
            history: DashMap::new(),
            graph: DependencyGraph::new(),
            gate: RwLock::new(()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ChangeGraphError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }

    fn store_resource(&self, resource: &Resource) {
        self.graph.upsert_resource(resource);
        self.resources.insert(resource.key.clone(), resource.clone());
    }

    /// Returns `false` when the identical change is already stored.
    fn check_new_change(&self, change: &Change) -> Result<bool> {
        match self.changes.get(&change.id) {
            Some(existing) if *existing == *change => Ok(false),
            Some(_) => Err(ChangeGraphError::Validation(format!(
                "change {} already recorded with different content",
                change.id
            ))),
            None => Ok(true),
        }
    }

    fn store_change(&self, change: &Change) {
        self.changes.insert(change.id, change.clone());
        self.history
            .entry(change.resource_key.clone())
            .or_default()
            .push(change.id);
        debug!(change = %change.id, resource = %change.resource_key, "change persisted");
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn put_resource(&self, resource: &Resource) -> Result<()> {
        self.ensure_available()?;
        let _writing = self.gate.read();
        self.store_resource(resource);
        Ok(())
    }

    async fn put_change(&self, change: &Change) -> Result<()> {
        self.ensure_available()?;
        let _writing = self.gate.read();
        if self.check_new_change(change)? {
            self.store_change(change);
        }
        Ok(())
    }

    async fn put_observation(&self, resource: &Resource, change: &Change) -> Result<()> {
        self.ensure_available()?;
        let _writing = self.gate.read();
        let fresh = self.check_new_change(change)?;
        self.store_resource(resource);
        if fresh {
            self.store_change(change);
        }
        Ok(())
    }

    async fn put_edge(&self, edge: &DependencyEdge) -> Result<()> {
        self.ensure_available()?;
        let _writing = self.gate.read();
        self.graph.add_edge(edge.clone())?;
        Ok(())
    }

    async fn get_reachable(
        &self,
        key: &ResourceKey,
        max_depth: usize,
        direction: Direction,
    ) -> Result<ReachableSet> {
        self.ensure_available()?;
        self.graph
            .snapshot()
            .reachable_from(key, max_depth, direction, &Deadline::none())
    }

    async fn get_history(&self, key: &ResourceKey) -> Result<Vec<Change>> {
        self.ensure_available()?;
        let ids = self
            .history
            .get(key)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut changes: Vec<Change> = ids
            .iter()
            .filter_map(|id| self.changes.get(id).map(|c| c.clone()))
            .collect();
        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(changes)
    }

    async fn load_snapshot(&self) -> Result<StoreSnapshot> {
        self.ensure_available()?;
        let _frozen = self.gate.write();
        let mut resources: Vec<Resource> =
            self.resources.iter().map(|r| r.value().clone()).collect();
        resources.sort_by(|a, b| a.key.cmp(&b.key));

        let mut changes: Vec<Change> = self.changes.iter().map(|c| c.value().clone()).collect();
        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        Ok(StoreSnapshot {
            resources,
            edges: self.graph.snapshot().edges(),
            changes,
            taken_at: Some(Utc::now()),
        })
    }
}

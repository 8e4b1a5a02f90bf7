use crate::catalog::Catalog;
use crate::classifier::PathPatternClassifier;
use crate::commands::ChangeSelector;
use crate::conflict::ConflictPredictor;
use crate::impact::ImpactAnalyzer;
use crate::release::ReleasePlanner;
use crate::tracker::ChangeTracker;
use changegraph_core::{
    normalize_path, Change, ChangeEvent, ChangeGraphError, ChangeId, ChangeType,
    Classification, ConfigManager, ConflictId, ConflictPrediction, ConflictReport, Deadline,
    DependencyEdge, DependencyKind, EngineConfig, GraphStore, IdentityResolver, ImpactReport,
    ReleaseId, ReleasePlan, ReleaseStatus, ReleaseStrategy, Resource, ResourceClassifier,
    ResourceKey, ResourceType, Result, SemanticConflictClassifier, StoreSnapshot,
};
use changegraph_graph::{open_store, DependencyGraph, GraphSnapshot};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

/// A prediction kept for the approval gate, with the branches its changes
/// came from.
#[derive(Debug, Clone)]
struct RecordedPrediction {
    branches: BTreeSet<String>,
    prediction: ConflictPrediction,
}

type KeyLocks = DashMap<ResourceKey, Arc<Mutex<()>>>;

/// Holds one resource key's mutation lock. Dropping the last holder evicts
/// the key's entry from the lock table.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: ResourceKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Assembles an [`Engine`] from configuration and optional host ports.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn GraphStore>>,
    classifier: Option<Arc<dyn ResourceClassifier>>,
    identity: Option<Arc<dyn IdentityResolver>>,
    semantic: Option<Arc<dyn SemanticConflictClassifier>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            classifier: None,
            identity: None,
            semantic: None,
        }
    }

    /// Use this store instead of the one named in `config.store`.
    pub fn store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ResourceClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(resolver);
        self
    }

    pub fn semantic_classifier(mut self, classifier: Arc<dyn SemanticConflictClassifier>) -> Self {
        self.semantic = Some(classifier);
        self
    }

    /// Wire the components and hydrate them from the store.
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        ConfigManager::validate_config(&config)?;
        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.store)?,
        };
        let classifier: Arc<dyn ResourceClassifier> = match self.classifier {
            Some(c) => c,
            None => Arc::new(PathPatternClassifier::new(PathPatternClassifier::default_rules())?),
        };

        let catalog = Arc::new(Catalog::new(config.catalog.clone(), classifier)?);
        let graph = Arc::new(DependencyGraph::new());
        let tracker = ChangeTracker::new(
            catalog.clone(),
            graph.clone(),
            store.clone(),
            config.risk.clone(),
        );
        let impact = ImpactAnalyzer::new(config.impact.clone());
        let mut conflicts = ConflictPredictor::new(config.conflict.clone())?;
        if let Some(resolver) = self.identity {
            conflicts = conflicts.with_identity_resolver(resolver);
        }
        if let Some(classifier) = self.semantic {
            conflicts = conflicts.with_semantic_classifier(classifier);
        }
        let planner = ReleasePlanner::new(
            config.release.clone(),
            config.risk.thresholds.clone(),
            impact.clone(),
        );

        let engine = Engine {
            config,
            store,
            graph,
            catalog,
            tracker,
            impact,
            conflicts,
            planner,
            changes: DashMap::new(),
            key_locks: DashMap::new(),
            plans: DashMap::new(),
            predictions: DashMap::new(),
        };
        engine.hydrate().await?;
        Ok(engine)
    }
}

/// Entry point tying the catalog, tracker, graph and analyses to one store.
///
/// Mutations (`register_resource`, `add_edge`, `observe`) are serialized per
/// resource key and reach the store before any in-memory state changes.
/// Analyses read an immutable graph snapshot taken when they start, so they
/// keep working from memory while the store is down.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn GraphStore>,
    graph: Arc<DependencyGraph>,
    catalog: Arc<Catalog>,
    tracker: ChangeTracker,
    impact: ImpactAnalyzer,
    conflicts: ConflictPredictor,
    planner: ReleasePlanner,
    changes: DashMap<ChangeId, Arc<Change>>,
    key_locks: KeyLocks,
    plans: DashMap<ReleaseId, ReleasePlan>,
    predictions: DashMap<ConflictId, RecordedPrediction>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine over `store` with the default classifier.
    pub async fn open(store: Arc<dyn GraphStore>, config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).store(store).build().await
    }

    async fn hydrate(&self) -> Result<()> {
        let mut snapshot = self.store.load_snapshot().await?;
        reconcile_fingerprints(&mut snapshot);
        self.catalog.load(snapshot.resources.iter().cloned());
        self.graph.load(&snapshot.resources, &snapshot.edges)?;
        for change in snapshot.changes {
            self.changes.insert(change.id, Arc::new(change));
        }
        info!(
            resources = snapshot.resources.len(),
            edges = snapshot.edges.len(),
            changes = self.changes.len(),
            "engine hydrated from store"
        );
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.graph.snapshot()
    }

    pub fn change(&self, id: &ChangeId) -> Option<Arc<Change>> {
        self.changes.get(id).map(|c| c.clone())
    }

    pub fn release(&self, id: &ReleaseId) -> Option<ReleasePlan> {
        self.plans.get(id).map(|p| p.clone())
    }

    fn deadline(&self) -> Deadline {
        Deadline::from_millis(self.config.impact.deadline_ms)
    }

    async fn lock_key(&self, key: &ResourceKey) -> KeyGuard<'_> {
        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            locks: &self.key_locks,
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Register `path`, classifying it unless `resource_type` is given.
    /// Registering a known path returns the existing resource.
    pub async fn register_resource(
        &self,
        path: &str,
        resource_type: Option<ResourceType>,
    ) -> Result<Resource> {
        let classification = match resource_type {
            Some(t) => Classification::of_type(t),
            None => self.catalog.resolve(path)?,
        };
        let key = ResourceKey::derive(&normalize_path(path), &classification.resource_type);
        let _guard = self.lock_key(&key).await;

        if let Ok(existing) = self.catalog.lookup(path) {
            return Ok(existing);
        }
        let resource = self.catalog.prepare_register(path, classification)?;
        self.store.put_resource(&resource).await?;
        self.catalog.commit(resource.clone());
        self.graph.upsert_resource(&resource);
        Ok(resource)
    }

    /// Record that `from` depends on `to`. Returns `false` for an edge that
    /// already exists.
    pub async fn add_edge(
        &self,
        from: &ResourceKey,
        to: &ResourceKey,
        kind: DependencyKind,
    ) -> Result<bool> {
        if from == to {
            return Err(ChangeGraphError::Validation(format!(
                "self-dependency on {}",
                from
            )));
        }
        // Lock both endpoints in key order.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let _first = self.lock_key(first).await;
        let _second = self.lock_key(second).await;

        if self.graph.snapshot().edge_kinds(from, to).contains(&kind) {
            return Ok(false);
        }
        let edge = DependencyEdge::new(from.clone(), to.clone(), kind);
        self.store.put_edge(&edge).await?;
        self.graph.add_edge(edge)
    }

    /// Record a file event as a risk-scored change.
    pub async fn observe(&self, event: &ChangeEvent) -> Result<Change> {
        let key = self.tracker.key_for(event)?;
        let _guard = self.lock_key(&key).await;

        let change = self.tracker.observe(event).await?;
        self.changes.insert(change.id, Arc::new(change.clone()));
        Ok(change)
    }

    /// Changes recorded for `key`, oldest first. Falls back to the changes
    /// held in memory when the store is unavailable.
    pub async fn history(&self, key: &ResourceKey) -> Result<Vec<Change>> {
        match self.store.get_history(key).await {
            Ok(history) => Ok(history),
            Err(ChangeGraphError::StoreUnavailable(reason)) => {
                warn!(resource = %key, reason = %reason, "store unavailable, serving cached history");
                let mut cached: Vec<Change> = self
                    .changes
                    .iter()
                    .filter(|c| &c.resource_key == key)
                    .map(|c| Change::clone(c.value()))
                    .collect();
                cached.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    /// Changes picked by `selector`, oldest first.
    pub fn select(&self, selector: &ChangeSelector) -> Result<Vec<Change>> {
        let mut selected = match selector {
            ChangeSelector::Ids(ids) => {
                if ids.is_empty() {
                    return Err(ChangeGraphError::Validation("empty change set".to_string()));
                }
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    let change = self
                        .changes
                        .get(id)
                        .ok_or_else(|| ChangeGraphError::NotFound(format!("change {}", id)))?;
                    out.push(Change::clone(change.value()));
                }
                out
            }
            ChangeSelector::Branch(branch) => self
                .changes
                .iter()
                .filter(|c| &c.branch == branch)
                .map(|c| Change::clone(c.value()))
                .collect(),
        };
        selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        selected.dedup_by_key(|c| c.id);
        Ok(selected)
    }

    #[instrument(skip_all)]
    pub fn analyze_impact(
        &self,
        selector: &ChangeSelector,
        max_depth: Option<usize>,
    ) -> Result<ImpactReport> {
        let changes = self.select(selector)?;
        let snapshot = self.graph.snapshot();
        self.impact.analyze(
            &snapshot,
            &changes,
            max_depth.unwrap_or_else(|| self.impact.default_max_depth()),
            &self.deadline(),
        )
    }

    /// Predict conflicts between two change sets and remember the results
    /// for the release approval gate.
    #[instrument(skip_all)]
    pub fn predict_conflicts(
        &self,
        left: &ChangeSelector,
        right: &ChangeSelector,
    ) -> Result<ConflictReport> {
        let a = self.select(left)?;
        let b = self.select(right)?;
        let snapshot = self.graph.snapshot();
        let report = self
            .conflicts
            .predict(&snapshot, &self.catalog, &a, &b, &self.deadline())?;

        for prediction in &report.predictions {
            let branches = prediction
                .change_ids
                .iter()
                .filter_map(|id| self.changes.get(id).map(|c| c.branch.clone()))
                .collect();
            self.predictions.insert(
                prediction.id,
                RecordedPrediction {
                    branches,
                    prediction: prediction.clone(),
                },
            );
        }
        Ok(report)
    }

    #[instrument(skip_all)]
    pub fn plan_release(
        &self,
        selector: &ChangeSelector,
        strategy: Option<ReleaseStrategy>,
        risk_threshold: Option<f64>,
        target_branch: Option<String>,
    ) -> Result<ReleasePlan> {
        let changes = self.select(selector)?;
        let snapshot = self.graph.snapshot();
        let mut plan = self.planner.plan(
            &snapshot,
            &changes,
            strategy.unwrap_or_else(|| self.planner.default_strategy()),
            risk_threshold,
            &self.deadline(),
        )?;
        plan.target_branch = target_branch;
        self.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    /// Predictions the approval gate of `plan` has to consider.
    fn predictions_for(&self, plan: &ReleasePlan) -> Vec<ConflictPrediction> {
        self.predictions
            .iter()
            .filter(|r| match &plan.target_branch {
                Some(target) => r.branches.contains(target),
                None => true,
            })
            .map(|r| r.prediction.clone())
            .collect()
    }

    pub fn transition_release(&self, id: &ReleaseId, next: ReleaseStatus) -> Result<ReleasePlan> {
        let mut plan = self
            .plans
            .get_mut(id)
            .ok_or_else(|| ChangeGraphError::NotFound(format!("release {}", id)))?;
        let predictions = self.predictions_for(&plan);
        self.planner.transition(&mut plan, next, &predictions)?;
        Ok(plan.clone())
    }

    /// Mark a conflict prediction as dealt with for one release.
    pub fn resolve_conflict(&self, release: &ReleaseId, conflict: ConflictId) -> Result<()> {
        if !self.predictions.contains_key(&conflict) {
            return Err(ChangeGraphError::NotFound(format!("conflict {}", conflict)));
        }
        let mut plan = self
            .plans
            .get_mut(release)
            .ok_or_else(|| ChangeGraphError::NotFound(format!("release {}", release)))?;
        plan.resolve_conflict(conflict);
        Ok(())
    }
}

/// Point each resource at the state its latest recorded change produced.
/// History is authoritative when a store persisted a change but not the
/// matching resource update.
fn reconcile_fingerprints(snapshot: &mut StoreSnapshot) {
    let mut latest: HashMap<&ResourceKey, &Change> = HashMap::new();
    for change in &snapshot.changes {
        latest.insert(&change.resource_key, change);
    }
    for resource in &mut snapshot.resources {
        let Some(change) = latest.get(&resource.key) else {
            continue;
        };
        if resource.current_fingerprint != change.after_fingerprint {
            warn!(resource = %resource.key, change = %change.id, "stored fingerprint behind history, repairing");
            resource.current_fingerprint = change.after_fingerprint.clone();
            resource.removed = change.change_type == ChangeType::Deleted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changegraph_core::{Criticality, Fingerprint, RiskLevel};
    use changegraph_graph::MemoryGraphStore;

    async fn engine_with(store: Arc<MemoryGraphStore>) -> Engine {
        Engine::open(store, EngineConfig::default()).await.unwrap()
    }

    fn modified(path: &str, hash: &str, branch: &str) -> ChangeEvent {
        ChangeEvent::new(path, ChangeType::Modified, "dev", branch).with_hash(hash)
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.conflict.semantic_confidence_cap = -0.1;
        let err = Engine::open(Arc::new(MemoryGraphStore::new()), config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChangeGraphError::Config(_)));

        let mut config = EngineConfig::default();
        config.risk.thresholds.high = 0.1;
        assert!(Engine::builder(config).build().await.is_err());
    }

    #[tokio::test]
    async fn hydration_repairs_fingerprint_behind_history() {
        let store = Arc::new(MemoryGraphStore::new());
        let change = {
            let engine = engine_with(store.clone()).await;
            engine.observe(&modified("views/A.json", "1", "main")).await.unwrap()
        };
        // A backend that kept the change but lost the resource update.
        let mut stale = Resource::new("views/A.json", ResourceType::ViewDefinition, Criticality::Medium);
        stale.key = change.resource_key.clone();
        store.put_resource(&stale).await.unwrap();

        let reopened = engine_with(store).await;
        let resource = reopened.catalog().lookup("views/A.json").unwrap();
        assert_eq!(resource.current_fingerprint, Some(Fingerprint::from_hash("1")));

        let next = reopened.observe(&modified("views/A.json", "2", "main")).await.unwrap();
        assert_eq!(next.before_fingerprint, change.after_fingerprint);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn key_locks_are_released_after_use() {
        let engine = Arc::new(engine_with(Arc::new(MemoryGraphStore::new())).await);
        let tag = engine.register_resource("tags/A.json", None).await.unwrap();
        let view = engine.register_resource("views/B.json", None).await.unwrap();
        engine.add_edge(&view.key, &tag.key, DependencyKind::Binds).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let hash = format!("h{}", i);
                engine.observe(&modified("views/B.json", &hash, "main")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(engine.history(&view.key).await.unwrap().len(), 8);
        assert!(engine.key_locks.is_empty());
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let engine = engine_with(Arc::new(MemoryGraphStore::new())).await;
        let first = engine.register_resource("views/Main.json", None).await.unwrap();
        let again = engine
            .register_resource("views/Main.json", Some(ResourceType::ViewDefinition))
            .await
            .unwrap();
        assert_eq!(first.key, again.key);
        assert_eq!(first.resource_type, ResourceType::ViewDefinition);
        assert!(first.current_fingerprint.is_none());
        assert_eq!(engine.catalog().len(), 1);
    }

    #[tokio::test]
    async fn add_edge_rejects_self_edges_and_ignores_duplicates() {
        let engine = engine_with(Arc::new(MemoryGraphStore::new())).await;
        let tag = engine.register_resource("tags/A.json", None).await.unwrap();
        let view = engine.register_resource("views/B.json", None).await.unwrap();

        assert!(engine.add_edge(&view.key, &tag.key, DependencyKind::Binds).await.unwrap());
        assert!(!engine.add_edge(&view.key, &tag.key, DependencyKind::Binds).await.unwrap());
        assert_eq!(engine.snapshot().edge_count(), 1);

        let err = engine
            .add_edge(&tag.key, &tag.key, DependencyKind::References)
            .await
            .unwrap_err();
        assert!(matches!(err, ChangeGraphError::Validation(_)));
    }

    #[tokio::test]
    async fn selectors_resolve_ids_and_branches() {
        let engine = engine_with(Arc::new(MemoryGraphStore::new())).await;
        let a = engine.observe(&modified("views/A.json", "1", "feature")).await.unwrap();
        let b = engine.observe(&modified("views/B.json", "1", "main")).await.unwrap();

        let by_branch = engine.select(&ChangeSelector::Branch("feature".into())).unwrap();
        assert_eq!(by_branch.len(), 1);
        assert_eq!(by_branch[0].id, a.id);

        let by_ids = engine.select(&ChangeSelector::Ids(vec![b.id, a.id])).unwrap();
        assert_eq!(by_ids.len(), 2);

        assert!(matches!(
            engine.select(&ChangeSelector::Ids(vec![])),
            Err(ChangeGraphError::Validation(_))
        ));
        assert!(matches!(
            engine.select(&ChangeSelector::Ids(vec![changegraph_core::new_id()])),
            Err(ChangeGraphError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn history_survives_store_outage() {
        let store = Arc::new(MemoryGraphStore::new());
        let engine = engine_with(store.clone()).await;
        engine.observe(&modified("views/A.json", "1", "main")).await.unwrap();
        let second = engine.observe(&modified("views/A.json", "2", "main")).await.unwrap();

        store.set_available(false);
        let history = engine.history(&second.resource_key).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].id, second.id);

        let err = engine
            .observe(&modified("views/A.json", "3", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChangeGraphError::StoreUnavailable(_)));

        // Analyses still run from memory.
        let report = engine
            .analyze_impact(&ChangeSelector::Ids(vec![second.id]), None)
            .unwrap();
        assert_eq!(report.affected_resources.len(), 1);
        assert_eq!(second.risk_level, RiskLevel::Medium);
    }
}

use crate::{
    ChangeId, ConflictId, ConflictType, Criticality, ReleaseId, ReleaseStatus, ReleaseStrategy,
    ResourceKey, RiskLevel, RollbackComplexity, Severity,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachedResource {
    pub key: ResourceKey,
    pub depth: usize,
}

/// Output of a bounded BFS: every reached resource with its shortest hop
/// distance, ordered by depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachableSet {
    pub origin: ResourceKey,
    pub nodes: Vec<ReachedResource>,
    pub max_depth: usize,
    /// Unvisited neighbors remained beyond `max_depth`.
    pub depth_limit_hit: bool,
    /// An edge pointed back to an already reached resource.
    pub revisits_seen: bool,
    pub partial: bool,
}

impl ReachableSet {
    pub fn empty(origin: ResourceKey, max_depth: usize) -> Self {
        Self {
            origin,
            nodes: Vec::new(),
            max_depth,
            depth_limit_hit: false,
            revisits_seen: false,
            partial: false,
        }
    }

    pub fn depth_of(&self, key: &ResourceKey) -> Option<usize> {
        self.nodes.iter().find(|n| &n.key == key).map(|n| n.depth)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.nodes.iter().any(|n| &n.key == key)
    }

    pub fn depth_map(&self) -> HashMap<ResourceKey, usize> {
        self.nodes.iter().map(|n| (n.key.clone(), n.depth)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Each cycle lists its members in edge order, starting at the first
    /// member discovered.
    pub cycles: Vec<Vec<ResourceKey>>,
    pub partial: bool,
}

impl CycleReport {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn involves(&self, key: &ResourceKey) -> bool {
        self.cycles.iter().any(|c| c.contains(key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedResource {
    pub key: ResourceKey,
    pub depth: usize,
    pub criticality: Criticality,
    /// Seed change that reached this resource at `depth`.
    pub reached_from: ChangeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub seed_changes: Vec<ChangeId>,
    /// Ordered by hop distance, then key.
    pub affected_resources: Vec<AffectedResource>,
    pub max_depth: usize,
    pub impact_score: f64,
    pub rollback_complexity: RollbackComplexity,
    pub depth_limit_hit: bool,
    pub cycles_detected: bool,
    pub partial: bool,
}

impl ImpactReport {
    pub fn affected_keys(&self) -> BTreeSet<ResourceKey> {
        self.affected_resources.iter().map(|a| a.key.clone()).collect()
    }

    pub fn depth_of(&self, key: &ResourceKey) -> Option<usize> {
        self.affected_resources
            .iter()
            .find(|a| &a.key == key)
            .map(|a| a.depth)
    }

    /// Deepest hop reached among affected resources.
    pub fn deepest_hop(&self) -> usize {
        self.affected_resources
            .iter()
            .map(|a| a.depth)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPrediction {
    pub id: ConflictId,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub resource_keys: Vec<ResourceKey>,
    pub change_ids: Vec<ChangeId>,
    pub confidence: f64,
    pub suggested_resolution: String,
    pub requires_manual_review: bool,
    pub explanation: String,
    /// Hop distance for dependency conflicts.
    pub hop_distance: Option<usize>,
}

impl ConflictPrediction {
    pub fn involves_change(&self, id: &ChangeId) -> bool {
        self.change_ids.contains(id)
    }
}

/// Whether an optional conflict category could be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Evaluated,
    NotEvaluated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub predictions: Vec<ConflictPrediction>,
    pub naming: CategoryStatus,
    pub semantic: CategoryStatus,
}

impl ConflictReport {
    pub fn of_type(&self, conflict_type: ConflictType) -> impl Iterator<Item = &ConflictPrediction> {
        self.predictions
            .iter()
            .filter(move |p| p.conflict_type == conflict_type)
    }

    pub fn critical(&self) -> impl Iterator<Item = &ConflictPrediction> {
        self.predictions
            .iter()
            .filter(|p| p.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseStep {
    pub index: usize,
    pub changes: Vec<ChangeId>,
    pub risk_level: RiskLevel,
    /// Step holds a single change kept apart because of its risk.
    pub isolated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub change_id: ChangeId,
    pub resource_key: ResourceKey,
    pub rollback_complexity: RollbackComplexity,
}

/// A group of changes that could not be ordered because of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedGroup {
    pub changes: Vec<ChangeId>,
    pub cycle: Vec<ResourceKey>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePlan {
    pub id: ReleaseId,
    pub strategy: ReleaseStrategy,
    pub recommended_strategy: ReleaseStrategy,
    pub status: ReleaseStatus,
    pub target_branch: Option<String>,
    /// Dependency-respecting order, depended-upon resources first.
    pub changes_included: Vec<ChangeId>,
    pub steps: Vec<ReleaseStep>,
    pub aggregate_risk: f64,
    pub risk_threshold: f64,
    pub rollback_plan: Vec<RollbackStep>,
    pub blocked_groups: Vec<BlockedGroup>,
    #[serde(default)]
    pub resolved_conflicts: BTreeSet<ConflictId>,
    pub created_at: DateTime<Utc>,
}

impl ReleasePlan {
    /// Record that a conflict prediction has been dealt with out of band.
    pub fn resolve_conflict(&mut self, id: ConflictId) {
        self.resolved_conflicts.insert(id);
    }

    pub fn position_of(&self, change: &ChangeId) -> Option<usize> {
        self.changes_included.iter().position(|c| c == change)
    }
}

/// Whatever a traversal or analysis finished before its deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartialResult {
    Reachable(ReachableSet),
    Cycles(CycleReport),
    Impact(ImpactReport),
}

impl PartialResult {
    pub fn is_partial(&self) -> bool {
        match self {
            PartialResult::Reachable(r) => r.partial,
            PartialResult::Cycles(c) => c.partial,
            PartialResult::Impact(i) => i.partial,
        }
    }
}

use crate::impact::ImpactAnalyzer;
use changegraph_core::{
    new_id, BlockedGroup, Change, ChangeGraphError, ChangeId, ConflictId, ConflictPrediction,
    Deadline, Direction, ImpactReport, ReleaseConfig, ReleasePlan, ReleaseStatus, ReleaseStep,
    ReleaseStrategy, ResourceKey, Result, RiskLevel, RiskThresholds, RollbackComplexity,
    RollbackStep, Severity,
};
use changegraph_graph::{topological_levels, GraphSnapshot};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, instrument, warn};

/// Groups pending changes into ordered release steps.
///
/// Change `x` must ship after change `y` when `y`'s resource is among the
/// transitive dependencies of `x`'s resource, or when both touch the same
/// resource and `y` is older.
#[derive(Debug, Clone)]
pub struct ReleasePlanner {
    config: ReleaseConfig,
    thresholds: RiskThresholds,
    impact: ImpactAnalyzer,
}

impl ReleasePlanner {
    pub fn new(config: ReleaseConfig, thresholds: RiskThresholds, impact: ImpactAnalyzer) -> Self {
        Self {
            config,
            thresholds,
            impact,
        }
    }

    pub fn default_strategy(&self) -> ReleaseStrategy {
        self.config.default_strategy
    }

    pub fn default_risk_threshold(&self) -> f64 {
        self.config.default_risk_threshold
    }

    #[instrument(skip_all, fields(changes = changes.len(), strategy = %strategy))]
    pub fn plan(
        &self,
        snapshot: &GraphSnapshot,
        changes: &[Change],
        strategy: ReleaseStrategy,
        risk_threshold: Option<f64>,
        deadline: &Deadline,
    ) -> Result<ReleasePlan> {
        if changes.is_empty() {
            return Err(ChangeGraphError::Validation(
                "release planning needs at least one change".to_string(),
            ));
        }
        let risk_threshold = risk_threshold.unwrap_or(self.config.default_risk_threshold);
        if !(0.0..=1.0).contains(&risk_threshold) {
            return Err(ChangeGraphError::Validation(format!(
                "risk threshold {} is outside [0, 1]",
                risk_threshold
            )));
        }

        let by_id: HashMap<ChangeId, &Change> = changes.iter().map(|c| (c.id, c)).collect();
        if by_id.len() != changes.len() {
            return Err(ChangeGraphError::Validation(
                "release contains the same change twice".to_string(),
            ));
        }

        let deps = self.change_dependencies(snapshot, changes, deadline)?;
        let groups = independent_groups(changes, &deps);

        let mut levels: Vec<Vec<ChangeId>> = Vec::new();
        let mut blocked_groups = Vec::new();
        for group in &groups {
            match topological_levels(group, &deps) {
                Ok(group_levels) => {
                    // Independent groups advance side by side.
                    for (i, level) in group_levels.into_iter().enumerate() {
                        if levels.len() <= i {
                            levels.push(Vec::new());
                        }
                        levels[i].extend(level);
                    }
                }
                Err(stuck) => {
                    let blocked = blocked_group(snapshot, group, &stuck, &by_id);
                    warn!(
                        changes = blocked.changes.len(),
                        cycle = ?blocked.cycle,
                        "release group blocked by a dependency cycle"
                    );
                    blocked_groups.push(blocked);
                }
            }
        }

        if levels.is_empty() {
            let first = blocked_groups.first().map(|g| g.cycle.clone()).unwrap_or_default();
            return Err(ChangeGraphError::CyclicRelease {
                changes: blocked_groups.into_iter().flat_map(|g| g.changes).collect(),
                cycle: first,
            });
        }

        let steps = self.build_steps(&levels, &by_id, strategy, risk_threshold);
        let changes_included: Vec<ChangeId> =
            steps.iter().flat_map(|s| s.changes.iter().copied()).collect();
        let ordered: Vec<Change> = changes_included
            .iter()
            .filter_map(|id| by_id.get(id).map(|c| (*c).clone()))
            .collect();

        let reports = self
            .impact
            .analyze_each(snapshot, &ordered, self.impact.default_max_depth(), deadline)
            .into_iter()
            .collect::<Result<Vec<ImpactReport>>>()?;

        let unmitigated = weighted_mean(&ordered, &reports);
        let aggregate_risk = match strategy {
            ReleaseStrategy::BigBang => ordered.iter().map(|c| c.risk_score).fold(0.0, f64::max),
            other => (unmitigated * self.mitigation_factor(other)).clamp(0.0, 1.0),
        };

        let rollback_plan = ordered
            .iter()
            .zip(reports.iter())
            .rev()
            .map(|(change, report)| RollbackStep {
                change_id: change.id,
                resource_key: change.resource_key.clone(),
                rollback_complexity: report.rollback_complexity,
            })
            .collect();

        let plan = ReleasePlan {
            id: new_id(),
            strategy,
            recommended_strategy: self.recommend_strategy(unmitigated),
            status: ReleaseStatus::Draft,
            target_branch: None,
            changes_included,
            steps,
            aggregate_risk,
            risk_threshold,
            rollback_plan,
            blocked_groups,
            resolved_conflicts: BTreeSet::new(),
            created_at: Utc::now(),
        };
        debug!(
            steps = plan.steps.len(),
            blocked = plan.blocked_groups.len(),
            aggregate_risk = plan.aggregate_risk,
            "release plan built"
        );
        Ok(plan)
    }

    /// Strategy suited to a given (unmitigated) aggregate risk.
    pub fn recommend_strategy(&self, aggregate_risk: f64) -> ReleaseStrategy {
        match self.thresholds.bucket(aggregate_risk) {
            RiskLevel::Low => ReleaseStrategy::BigBang,
            RiskLevel::Medium => ReleaseStrategy::Incremental,
            RiskLevel::High => ReleaseStrategy::Canary,
            RiskLevel::Critical => ReleaseStrategy::FeatureFlag,
        }
    }

    fn mitigation_factor(&self, strategy: ReleaseStrategy) -> f64 {
        match strategy {
            ReleaseStrategy::BigBang | ReleaseStrategy::Incremental => 1.0,
            ReleaseStrategy::FeatureFlag => self.config.feature_flag_factor,
            ReleaseStrategy::BlueGreen => self.config.blue_green_factor,
            ReleaseStrategy::Canary => self.config.canary_factor,
        }
    }

    /// `deps[x]` holds the changes that must ship before `x`.
    fn change_dependencies(
        &self,
        snapshot: &GraphSnapshot,
        changes: &[Change],
        deadline: &Deadline,
    ) -> Result<BTreeMap<ChangeId, BTreeSet<ChangeId>>> {
        let full_depth = snapshot.node_count().max(1);
        let mut reach: HashMap<&ResourceKey, BTreeSet<ResourceKey>> = HashMap::new();
        for change in changes {
            if reach.contains_key(&change.resource_key) {
                continue;
            }
            let set = snapshot.reachable_from(
                &change.resource_key,
                full_depth,
                Direction::Dependencies,
                deadline,
            )?;
            let keys = set
                .nodes
                .into_iter()
                .filter(|n| n.depth > 0)
                .map(|n| n.key)
                .collect();
            reach.insert(&change.resource_key, keys);
        }

        let mut deps: BTreeMap<ChangeId, BTreeSet<ChangeId>> = BTreeMap::new();
        for x in changes {
            let upstream = &reach[&x.resource_key];
            let entry = deps.entry(x.id).or_default();
            for y in changes {
                if x.id == y.id {
                    continue;
                }
                let same_resource_earlier = x.resource_key == y.resource_key
                    && (y.timestamp, y.id) < (x.timestamp, x.id);
                if same_resource_earlier || upstream.contains(&y.resource_key) {
                    entry.insert(y.id);
                }
            }
        }
        Ok(deps)
    }

    fn build_steps(
        &self,
        levels: &[Vec<ChangeId>],
        by_id: &HashMap<ChangeId, &Change>,
        strategy: ReleaseStrategy,
        risk_threshold: f64,
    ) -> Vec<ReleaseStep> {
        let level_of = |ids: &[ChangeId]| {
            ids.iter()
                .filter_map(|id| by_id.get(id))
                .map(|c| c.risk_level)
                .max()
                .unwrap_or(RiskLevel::Low)
        };

        if strategy == ReleaseStrategy::BigBang {
            let all: Vec<ChangeId> = levels.iter().flatten().copied().collect();
            return vec![ReleaseStep {
                index: 0,
                risk_level: level_of(all.as_slice()),
                changes: all,
                isolated: false,
            }];
        }

        let mut steps = Vec::new();
        for level in levels {
            let (risky, regular): (Vec<ChangeId>, Vec<ChangeId>) =
                level.iter().copied().partition(|id| {
                    by_id
                        .get(id)
                        .map(|c| c.risk_level == RiskLevel::Critical || c.risk_score > risk_threshold)
                        .unwrap_or(false)
                });
            // One step per risk level, calmest first.
            let mut by_risk: BTreeMap<RiskLevel, Vec<ChangeId>> = BTreeMap::new();
            for id in regular {
                if let Some(change) = by_id.get(&id) {
                    by_risk.entry(change.risk_level).or_default().push(id);
                }
            }
            for (risk_level, changes) in by_risk {
                steps.push(ReleaseStep {
                    index: steps.len(),
                    risk_level,
                    changes,
                    isolated: false,
                });
            }
            for id in risky {
                steps.push(ReleaseStep {
                    index: steps.len(),
                    risk_level: level_of(std::slice::from_ref(&id)),
                    changes: vec![id],
                    isolated: true,
                });
            }
        }
        steps
    }

    /// Move `plan` to `next`, refusing `Approved` while a Critical
    /// prediction touching the plan is unresolved.
    pub fn transition(
        &self,
        plan: &mut ReleasePlan,
        next: ReleaseStatus,
        predictions: &[ConflictPrediction],
    ) -> Result<()> {
        if !plan.status.can_transition_to(next) {
            return Err(ChangeGraphError::InvalidTransition {
                from: plan.status,
                to: next,
            });
        }
        if next == ReleaseStatus::Approved {
            let blocking = blocking_conflicts(plan, predictions);
            if !blocking.is_empty() {
                return Err(ChangeGraphError::ApprovalBlocked {
                    conflicts: blocking,
                });
            }
        }
        info!(release = %plan.id, from = %plan.status, to = %next, "release transition");
        plan.status = next;
        Ok(())
    }
}

/// Unresolved Critical predictions involving any change in the plan.
pub fn blocking_conflicts(plan: &ReleasePlan, predictions: &[ConflictPrediction]) -> Vec<ConflictId> {
    let included: BTreeSet<&ChangeId> = plan.changes_included.iter().collect();
    predictions
        .iter()
        .filter(|p| p.severity == Severity::Critical)
        .filter(|p| !plan.resolved_conflicts.contains(&p.id))
        .filter(|p| p.change_ids.iter().any(|id| included.contains(id)))
        .map(|p| p.id)
        .collect()
}

fn weighted_mean(changes: &[Change], reports: &[ImpactReport]) -> f64 {
    let (num, den) = changes
        .iter()
        .zip(reports)
        .fold((0.0, 0.0), |(num, den), (change, report)| {
            let w = 1.0 + report.impact_score;
            (num + change.risk_score * w, den + w)
        });
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Weakly connected components of the change dependency relation.
fn independent_groups(
    changes: &[Change],
    deps: &BTreeMap<ChangeId, BTreeSet<ChangeId>>,
) -> Vec<BTreeSet<ChangeId>> {
    let index: HashMap<ChangeId, usize> =
        changes.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
    let mut parent: Vec<usize> = (0..changes.len()).collect();

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for (x, ys) in deps {
        for y in ys {
            let (a, b) = (find(&mut parent, index[x]), find(&mut parent, index[y]));
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
        }
    }

    let mut groups: BTreeMap<usize, BTreeSet<ChangeId>> = BTreeMap::new();
    for (i, change) in changes.iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().insert(change.id);
    }
    groups.into_values().collect()
}

fn blocked_group(
    snapshot: &GraphSnapshot,
    group: &BTreeSet<ChangeId>,
    stuck: &BTreeSet<ChangeId>,
    by_id: &HashMap<ChangeId, &Change>,
) -> BlockedGroup {
    let stuck_keys: BTreeSet<&ResourceKey> = stuck
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|c| &c.resource_key)
        .collect();
    let cycle = snapshot
        .cyclic_components()
        .into_iter()
        .find(|component| component.iter().any(|k| stuck_keys.contains(k)))
        .unwrap_or_else(|| stuck_keys.iter().map(|k| (*k).clone()).collect());
    BlockedGroup {
        changes: group.iter().copied().collect(),
        reason: format!(
            "{} change(s) depend on each other through a cycle of {} resource(s)",
            stuck.len(),
            cycle.len()
        ),
        cycle,
    }
}

/// Most complex rollback among a set of steps.
pub fn worst_rollback(steps: &[RollbackStep]) -> RollbackComplexity {
    steps
        .iter()
        .map(|s| s.rollback_complexity)
        .max()
        .unwrap_or(RollbackComplexity::Low)
}

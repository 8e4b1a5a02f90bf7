use changegraph_core::{
    AffectedResource, Change, ChangeGraphError, ChangeId, Criticality, Deadline, Direction,
    ImpactConfig, ImpactReport, PartialResult, ResourceKey, Result, RollbackComplexity,
};
use changegraph_graph::GraphSnapshot;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// Blast-radius analysis over a graph snapshot. Pure: the same snapshot and
/// change set always give the same report.
#[derive(Debug, Clone)]
pub struct ImpactAnalyzer {
    config: ImpactConfig,
}

struct Reach {
    depth: usize,
    seed: ChangeId,
    risk: f64,
}

impl ImpactAnalyzer {
    pub fn new(config: ImpactConfig) -> Self {
        Self { config }
    }

    pub fn default_max_depth(&self) -> usize {
        self.config.max_depth
    }

    /// Union of the dependents reachable from every seed within `max_depth`
    /// hops, each at its shortest distance from any seed.
    ///
    /// `impact_score` sums `risk(seed) / (1 + hop)` over affected resources,
    /// crediting each resource to the seed that reaches it first.
    #[instrument(skip_all, fields(seeds = changes.len(), max_depth = max_depth))]
    pub fn analyze(
        &self,
        snapshot: &GraphSnapshot,
        changes: &[Change],
        max_depth: usize,
        deadline: &Deadline,
    ) -> Result<ImpactReport> {
        if changes.is_empty() {
            return Err(ChangeGraphError::Validation(
                "impact analysis needs at least one change".to_string(),
            ));
        }

        let mut reached: BTreeMap<ResourceKey, Reach> = BTreeMap::new();
        let mut depth_limit_hit = false;
        let mut revisits_seen = false;

        for change in changes {
            let set = match snapshot.reachable_from(
                &change.resource_key,
                max_depth,
                Direction::Dependents,
                deadline,
            ) {
                Ok(set) => set,
                Err(ChangeGraphError::DeadlineExceeded { elapsed_ms, partial }) => {
                    if let PartialResult::Reachable(set) = partial.as_ref() {
                        for node in &set.nodes {
                            merge(&mut reached, &node.key, node.depth, change);
                        }
                    }
                    let mut report = self.build_report(
                        snapshot,
                        changes,
                        reached,
                        max_depth,
                        depth_limit_hit,
                        false,
                    );
                    report.partial = true;
                    warn!(elapsed_ms, affected = report.affected_resources.len(), "impact analysis deadline hit");
                    return Err(ChangeGraphError::DeadlineExceeded {
                        elapsed_ms,
                        partial: Box::new(PartialResult::Impact(report)),
                    });
                }
                Err(e) => return Err(e),
            };

            depth_limit_hit |= set.depth_limit_hit;
            revisits_seen |= set.revisits_seen;
            for node in &set.nodes {
                merge(&mut reached, &node.key, node.depth, change);
            }
        }

        // Revisits are necessary for a cycle; only then pay for detection.
        let cycles_detected = if revisits_seen {
            match snapshot.detect_cycles(deadline) {
                Ok(report) => reached.keys().any(|k| report.involves(k)),
                Err(ChangeGraphError::DeadlineExceeded { elapsed_ms, .. }) => {
                    let mut report = self.build_report(
                        snapshot,
                        changes,
                        reached,
                        max_depth,
                        depth_limit_hit,
                        false,
                    );
                    report.partial = true;
                    return Err(ChangeGraphError::DeadlineExceeded {
                        elapsed_ms,
                        partial: Box::new(PartialResult::Impact(report)),
                    });
                }
                Err(e) => return Err(e),
            }
        } else {
            false
        };

        let report = self.build_report(
            snapshot,
            changes,
            reached,
            max_depth,
            depth_limit_hit,
            cycles_detected,
        );
        debug!(
            affected = report.affected_resources.len(),
            score = report.impact_score,
            rollback = ?report.rollback_complexity,
            "impact computed"
        );
        Ok(report)
    }

    /// One report per change, computed in parallel over the shared snapshot.
    pub fn analyze_each(
        &self,
        snapshot: &GraphSnapshot,
        changes: &[Change],
        max_depth: usize,
        deadline: &Deadline,
    ) -> Vec<Result<ImpactReport>> {
        changes
            .par_iter()
            .map(|change| self.analyze(snapshot, std::slice::from_ref(change), max_depth, deadline))
            .collect()
    }

    fn build_report(
        &self,
        snapshot: &GraphSnapshot,
        changes: &[Change],
        reached: BTreeMap<ResourceKey, Reach>,
        max_depth: usize,
        depth_limit_hit: bool,
        cycles_detected: bool,
    ) -> ImpactReport {
        let mut impact_score = 0.0;
        let mut affected: Vec<AffectedResource> = reached
            .into_iter()
            .map(|(key, reach)| {
                impact_score += reach.risk / (1.0 + reach.depth as f64);
                AffectedResource {
                    criticality: snapshot.criticality(&key),
                    key,
                    depth: reach.depth,
                    reached_from: reach.seed,
                }
            })
            .collect();
        affected.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));

        let deepest = affected.iter().map(|a| a.depth).max().unwrap_or(0);
        let any_critical = affected.iter().any(|a| a.criticality == Criticality::Critical);
        let rollback_complexity = if any_critical || (depth_limit_hit && cycles_detected) {
            RollbackComplexity::High
        } else if deepest > self.config.medium_rollback_depth {
            RollbackComplexity::Medium
        } else {
            RollbackComplexity::Low
        };

        ImpactReport {
            seed_changes: changes.iter().map(|c| c.id).collect(),
            affected_resources: affected,
            max_depth,
            impact_score,
            rollback_complexity,
            depth_limit_hit,
            cycles_detected,
            partial: false,
        }
    }
}

fn merge(reached: &mut BTreeMap<ResourceKey, Reach>, key: &ResourceKey, depth: usize, change: &Change) {
    match reached.get_mut(key) {
        Some(existing) if existing.depth <= depth => {}
        Some(existing) => {
            existing.depth = depth;
            existing.seed = change.id;
            existing.risk = change.risk_score;
        }
        None => {
            reached.insert(
                key.clone(),
                Reach {
                    depth,
                    seed: change.id,
                    risk: change.risk_score,
                },
            );
        }
    }
}

use crate::catalog::Catalog;
use changegraph_core::{
    new_id, CategoryStatus, Change, ChangeId, ChangeType, ConflictConfig,
    ConflictPrediction, ConflictReport, ConflictType, Criticality, Deadline, Direction,
    Fingerprint, IdentityResolver, ReachableSet, ResourceKey, Result, SemanticConflictClassifier,
    Severity,
};
use changegraph_graph::GraphSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

const NAMING_CONFIDENCE: f64 = 0.8;

/// Changes of one side to one resource, oldest first.
struct Chain<'a> {
    key: &'a ResourceKey,
    changes: Vec<&'a Change>,
}

impl<'a> Chain<'a> {
    fn first(&self) -> &'a Change {
        self.changes[0]
    }

    fn last(&self) -> &'a Change {
        self.changes[self.changes.len() - 1]
    }

    fn ancestor(&self) -> Option<&'a Fingerprint> {
        self.first().before_fingerprint.as_ref()
    }

    fn tip(&self) -> Option<&'a Fingerprint> {
        self.last().after_fingerprint.as_ref()
    }

    fn ids(&self) -> Vec<ChangeId> {
        self.changes.iter().map(|c| c.id).collect()
    }

    /// Every change of this chain also appears in `other`.
    fn absorbed_by(&self, other: &Chain<'_>) -> bool {
        self.changes
            .iter()
            .all(|c| other.changes.iter().any(|o| o.id == c.id))
    }
}

fn chains(changes: &[Change]) -> BTreeMap<&ResourceKey, Chain<'_>> {
    let mut out: BTreeMap<&ResourceKey, Chain<'_>> = BTreeMap::new();
    for change in changes {
        out.entry(&change.resource_key)
            .or_insert_with(|| Chain {
                key: &change.resource_key,
                changes: Vec::new(),
            })
            .changes
            .push(change);
    }
    for chain in out.values_mut() {
        chain
            .changes
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    }
    out
}

/// Predicts merge conflicts between two divergent change sets.
///
/// Categories are tried per resource pair in order FileLevel, Naming,
/// Dependency, Semantic; the first that fires is reported.
pub struct ConflictPredictor {
    config: ConflictConfig,
    identity: Option<Arc<dyn IdentityResolver>>,
    semantic: Option<Arc<dyn SemanticConflictClassifier>>,
}

impl ConflictPredictor {
    /// Fails when `config` is out of range, e.g. a semantic cap outside
    /// `[0, 0.9]`.
    pub fn new(config: ConflictConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            identity: None,
            semantic: None,
        })
    }

    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(resolver);
        self
    }

    pub fn with_semantic_classifier(mut self, classifier: Arc<dyn SemanticConflictClassifier>) -> Self {
        self.semantic = Some(classifier);
        self
    }

    #[instrument(skip_all, fields(left = changes_a.len(), right = changes_b.len()))]
    pub fn predict(
        &self,
        snapshot: &GraphSnapshot,
        catalog: &Catalog,
        changes_a: &[Change],
        changes_b: &[Change],
        deadline: &Deadline,
    ) -> Result<ConflictReport> {
        let side_a = chains(changes_a);
        let side_b = chains(changes_b);

        let reach_a = self.reach_all(snapshot, side_a.keys().copied(), deadline)?;
        let reach_b = self.reach_all(snapshot, side_b.keys().copied(), deadline)?;

        let mut predictions = Vec::new();
        for (key_a, chain_a) in &side_a {
            for (key_b, chain_b) in &side_b {
                let prediction = if key_a == key_b {
                    self.file_level(snapshot, chain_a, chain_b)
                } else {
                    self.naming(snapshot, catalog, chain_a, chain_b)
                        .or_else(|| self.dependency(snapshot, chain_a, chain_b, &reach_a, &reach_b))
                        .or_else(|| self.semantic(snapshot, chain_a, chain_b))
                };
                if let Some(p) = prediction {
                    predictions.push(p);
                }
            }
        }

        predictions.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.resource_keys.cmp(&b.resource_keys))
        });
        debug!(predictions = predictions.len(), "conflict prediction finished");

        Ok(ConflictReport {
            predictions,
            naming: if self.identity.is_some() {
                CategoryStatus::Evaluated
            } else {
                CategoryStatus::NotEvaluated
            },
            semantic: if self.semantic.is_some() {
                CategoryStatus::Evaluated
            } else {
                CategoryStatus::NotEvaluated
            },
        })
    }

    fn reach_all<'k>(
        &self,
        snapshot: &GraphSnapshot,
        keys: impl Iterator<Item = &'k ResourceKey>,
        deadline: &Deadline,
    ) -> Result<HashMap<ResourceKey, ReachableSet>> {
        let mut out = HashMap::new();
        for key in keys {
            let set = snapshot.reachable_from(
                key,
                self.config.dependency_search_depth,
                Direction::Dependents,
                deadline,
            )?;
            out.insert(key.clone(), set);
        }
        Ok(out)
    }

    fn file_level(
        &self,
        snapshot: &GraphSnapshot,
        a: &Chain<'_>,
        b: &Chain<'_>,
    ) -> Option<ConflictPrediction> {
        let (tip_a, tip_b) = (a.tip(), b.tip());
        if tip_a == tip_b {
            // Both sides converged on the same content (or both deleted).
            return None;
        }
        // One side already carries the other's work.
        if a.absorbed_by(b) || b.absorbed_by(a) {
            return None;
        }

        let deleted_a = a.last().change_type == ChangeType::Deleted;
        let deleted_b = b.last().change_type == ChangeType::Deleted;
        let explanation = match (deleted_a, deleted_b) {
            (true, false) => format!("{} deleted on one side and modified on the other", a.key),
            (false, true) => format!("{} modified on one side and deleted on the other", a.key),
            _ if a.ancestor() == b.ancestor() => format!(
                "{} diverged from common ancestor {}",
                a.key,
                a.ancestor().map(|f| f.as_str()).unwrap_or("<none>")
            ),
            _ => format!("{} changed on both sides from different bases", a.key),
        };

        let mut change_ids = a.ids();
        change_ids.extend(b.ids());
        Some(self.prediction(
            ConflictType::FileLevel,
            snapshot.criticality(a.key).max(snapshot.criticality(b.key)),
            vec![a.key.clone()],
            change_ids,
            1.0,
            "three-way-merge".to_string(),
            explanation,
            None,
            false,
        ))
    }

    fn naming(
        &self,
        snapshot: &GraphSnapshot,
        catalog: &Catalog,
        a: &Chain<'_>,
        b: &Chain<'_>,
    ) -> Option<ConflictPrediction> {
        let resolver = self.identity.as_ref()?;
        let ra = catalog.get(a.key)?;
        let rb = catalog.get(b.key)?;
        let ia = resolver.logical_identity(&ra)?;
        let ib = resolver.logical_identity(&rb)?;
        if ia != ib {
            return None;
        }
        Some(self.prediction(
            ConflictType::Naming,
            snapshot.criticality(a.key).max(snapshot.criticality(b.key)),
            sorted_pair(a.key, b.key),
            merged_ids(a, b),
            NAMING_CONFIDENCE,
            "rename-one-side".to_string(),
            format!("{} and {} both resolve to identity '{}'", a.key, b.key, ia),
            None,
            false,
        ))
    }

    fn dependency(
        &self,
        snapshot: &GraphSnapshot,
        a: &Chain<'_>,
        b: &Chain<'_>,
        reach_a: &HashMap<ResourceKey, ReachableSet>,
        reach_b: &HashMap<ResourceKey, ReachableSet>,
    ) -> Option<ConflictPrediction> {
        let forward = reach_a.get(a.key).and_then(|r| r.depth_of(b.key));
        let backward = reach_b.get(b.key).and_then(|r| r.depth_of(a.key));
        let hop = match (forward, backward) {
            (Some(x), Some(y)) => x.min(y),
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => return None,
        };

        let confidence = self.dependency_confidence(hop);
        let (upstream, downstream) = if forward == Some(hop) {
            (a.key, b.key)
        } else {
            (b.key, a.key)
        };
        Some(self.prediction(
            ConflictType::Dependency,
            snapshot.criticality(a.key).max(snapshot.criticality(b.key)),
            sorted_pair(a.key, b.key),
            merged_ids(a, b),
            confidence,
            "sequence-dependency-first".to_string(),
            format!("{} depends on {} at {} hop(s)", downstream, upstream, hop),
            Some(hop),
            false,
        ))
    }

    /// Base confidence at one hop, decaying as `2 / (1 + hop)`.
    pub fn dependency_confidence(&self, hop: usize) -> f64 {
        let hop = hop.max(1) as f64;
        (self.config.dependency_base_confidence * 2.0 / (1.0 + hop)).clamp(0.0, 1.0)
    }

    fn semantic(
        &self,
        snapshot: &GraphSnapshot,
        a: &Chain<'_>,
        b: &Chain<'_>,
    ) -> Option<ConflictPrediction> {
        let classifier = self.semantic.as_ref()?;
        let raw = classifier.assess(a.last(), b.last())?;
        let confidence = if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, self.config.semantic_confidence_cap)
        };
        Some(self.prediction(
            ConflictType::Semantic,
            snapshot.criticality(a.key).max(snapshot.criticality(b.key)),
            sorted_pair(a.key, b.key),
            merged_ids(a, b),
            confidence,
            classifier.resolution_hint().to_string(),
            format!("classifier flagged {} against {}", a.key, b.key),
            None,
            true,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn prediction(
        &self,
        conflict_type: ConflictType,
        criticality: Criticality,
        resource_keys: Vec<ResourceKey>,
        change_ids: Vec<ChangeId>,
        confidence: f64,
        suggested_resolution: String,
        explanation: String,
        hop_distance: Option<usize>,
        force_review: bool,
    ) -> ConflictPrediction {
        let severity = severity_for(criticality, confidence);
        let requires_manual_review = force_review
            || confidence < self.config.manual_review_threshold
            || severity >= Severity::High;
        ConflictPrediction {
            id: new_id(),
            conflict_type,
            severity,
            resource_keys,
            change_ids,
            confidence,
            suggested_resolution,
            requires_manual_review,
            explanation,
            hop_distance,
        }
    }
}

/// Critical when a Critical resource is involved, else bucketed by confidence.
pub fn severity_for(criticality: Criticality, confidence: f64) -> Severity {
    if criticality == Criticality::Critical {
        Severity::Critical
    } else if confidence >= 0.9 {
        Severity::High
    } else if confidence >= 0.6 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn sorted_pair(a: &ResourceKey, b: &ResourceKey) -> Vec<ResourceKey> {
    let mut keys = vec![a.clone(), b.clone()];
    keys.sort();
    keys
}

fn merged_ids(a: &Chain<'_>, b: &Chain<'_>) -> Vec<ChangeId> {
    let mut ids = a.ids();
    ids.extend(b.ids());
    ids
}

impl std::fmt::Debug for ConflictPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictPredictor")
            .field("config", &self.config)
            .field("identity", &self.identity.as_ref().map(|_| "Some(resolver)"))
            .field("semantic", &self.semantic.as_ref().map(|_| "Some(classifier)"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changegraph_core::{
        CatalogConfig, ChangeGraphError, DependencyEdge, DependencyKind, Resource, ResourceType,
        RiskFactors, RiskLevel,
    };
    use chrono::{Duration, Utc};

    fn change(key: &ResourceKey, before: Option<&str>, after: Option<&str>, branch: &str) -> Change {
        Change {
            id: new_id(),
            resource_key: key.clone(),
            path: key.as_str().to_string(),
            previous_path: None,
            change_type: if after.is_some() {
                ChangeType::Modified
            } else {
                ChangeType::Deleted
            },
            before_fingerprint: before.map(Fingerprint::from_hash),
            after_fingerprint: after.map(Fingerprint::from_hash),
            timestamp: Utc::now(),
            author: "dev".into(),
            branch: branch.into(),
            risk_score: 0.3,
            risk_level: RiskLevel::Medium,
            risk_factors: RiskFactors::default(),
        }
    }

    struct Setup {
        catalog: Catalog,
        snapshot: GraphSnapshot,
        tag: Resource,
        view: Resource,
        script: Resource,
    }

    fn setup() -> Setup {
        let catalog = Catalog::with_default_classifier(CatalogConfig::default()).unwrap();
        let tag = catalog.register("tags/Pump.json", ResourceType::TagConfig).unwrap();
        let view = catalog.register("views/Pump.json", ResourceType::ViewDefinition).unwrap();
        let script = catalog.register("scripts/other.py", ResourceType::ServerScript).unwrap();
        let snapshot = GraphSnapshot::from_parts(
            &catalog.resources(),
            &[DependencyEdge::new(view.key.clone(), tag.key.clone(), DependencyKind::Binds)],
        )
        .unwrap();
        Setup {
            catalog,
            snapshot,
            tag,
            view,
            script,
        }
    }

    fn predictor() -> ConflictPredictor {
        ConflictPredictor::new(ConflictConfig::default()).unwrap()
    }

    #[test]
    fn diverged_same_resource_is_file_level() {
        let s = setup();
        let a = vec![change(&s.view.key, Some("base"), Some("ours"), "feature-a")];
        let b = vec![change(&s.view.key, Some("base"), Some("theirs"), "feature-b")];
        let report = predictor()
            .predict(&s.snapshot, &s.catalog, &a, &b, &Deadline::none())
            .unwrap();

        assert_eq!(report.predictions.len(), 1);
        let p = &report.predictions[0];
        assert_eq!(p.conflict_type, ConflictType::FileLevel);
        assert_eq!(p.confidence, 1.0);
        assert!(p.requires_manual_review);
        assert_eq!(p.suggested_resolution, "three-way-merge");
        assert_eq!(report.naming, CategoryStatus::NotEvaluated);
    }

    #[test]
    fn convergent_or_absorbed_edits_do_not_conflict() {
        let s = setup();
        let same_a = vec![change(&s.script.key, Some("base"), Some("same"), "a")];
        let same_b = vec![change(&s.script.key, Some("base"), Some("same"), "b")];
        let p = predictor();
        assert!(p
            .predict(&s.snapshot, &s.catalog, &same_a, &same_b, &Deadline::none())
            .unwrap()
            .predictions
            .is_empty());

        // b was branched off after a's change and builds on it.
        let first = change(&s.script.key, Some("base"), Some("mid"), "a");
        let mut later = change(&s.script.key, Some("mid"), Some("tip"), "b");
        later.timestamp = first.timestamp + Duration::seconds(5);
        assert!(p
            .predict(
                &s.snapshot,
                &s.catalog,
                &[first.clone()],
                &[first, later],
                &Deadline::none()
            )
            .unwrap()
            .predictions
            .is_empty());
    }

    #[test]
    fn file_level_and_dependency_are_symmetric() {
        let s = setup();
        let a = vec![
            change(&s.view.key, Some("v0"), Some("v1"), "a"),
            change(&s.script.key, Some("s0"), Some("s1"), "a"),
        ];
        let b = vec![
            change(&s.view.key, Some("v0"), Some("v2"), "b"),
            change(&s.tag.key, Some("t0"), Some("t1"), "b"),
        ];
        let p = predictor();
        let ab = p.predict(&s.snapshot, &s.catalog, &a, &b, &Deadline::none()).unwrap();
        let ba = p.predict(&s.snapshot, &s.catalog, &b, &a, &Deadline::none()).unwrap();

        let shape = |r: &ConflictReport| {
            let mut v: Vec<(String, Vec<ResourceKey>, u64)> = r
                .predictions
                .iter()
                .map(|p| {
                    (
                        p.conflict_type.to_string(),
                        p.resource_keys.clone(),
                        (p.confidence * 1000.0).round() as u64,
                    )
                })
                .collect();
            v.sort();
            v
        };
        assert_eq!(shape(&ab), shape(&ba));
        assert_eq!(ab.of_type(ConflictType::FileLevel).count(), 1);

        let dep: Vec<_> = ab.of_type(ConflictType::Dependency).collect();
        assert_eq!(dep.len(), 1);
        assert_eq!(dep[0].hop_distance, Some(1));
        assert!((dep[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn dependency_confidence_decays_with_hops() {
        let p = predictor();
        assert!((p.dependency_confidence(1) - 0.9).abs() < 1e-9);
        assert!((p.dependency_confidence(2) - 0.6).abs() < 1e-9);
        assert!(p.dependency_confidence(3) < p.dependency_confidence(2));
    }

    struct SameLogicalName;

    impl IdentityResolver for SameLogicalName {
        fn logical_identity(&self, resource: &Resource) -> Option<String> {
            Some(resource.logical_name().to_lowercase())
        }
    }

    #[test]
    fn naming_collisions_need_a_resolver() {
        let s = setup();
        // Both files are named "Pump" but of different types; the view also
        // depends on the tag, yet naming is tried first.
        let a = vec![change(&s.tag.key, Some("t0"), Some("t1"), "a")];
        let b = vec![change(&s.view.key, Some("v0"), Some("v1"), "b")];

        let without = predictor()
            .predict(&s.snapshot, &s.catalog, &a, &b, &Deadline::none())
            .unwrap();
        assert_eq!(without.naming, CategoryStatus::NotEvaluated);
        assert_eq!(without.predictions[0].conflict_type, ConflictType::Dependency);

        let with = predictor()
            .with_identity_resolver(Arc::new(SameLogicalName))
            .predict(&s.snapshot, &s.catalog, &a, &b, &Deadline::none())
            .unwrap();
        assert_eq!(with.naming, CategoryStatus::Evaluated);
        assert_eq!(with.predictions.len(), 1);
        assert_eq!(with.predictions[0].conflict_type, ConflictType::Naming);
    }

    struct AlwaysSure;

    impl SemanticConflictClassifier for AlwaysSure {
        fn assess(&self, _a: &Change, _b: &Change) -> Option<f64> {
            Some(1.7)
        }
    }

    #[test]
    fn semantic_confidence_is_capped_and_reviewed() {
        let s = setup();
        let a = vec![change(&s.script.key, Some("s0"), Some("s1"), "a")];
        let b = vec![change(&s.tag.key, Some("t0"), Some("t1"), "b")];
        let report = predictor()
            .with_semantic_classifier(Arc::new(AlwaysSure))
            .predict(&s.snapshot, &s.catalog, &a, &b, &Deadline::none())
            .unwrap();

        assert_eq!(report.semantic, CategoryStatus::Evaluated);
        let p = &report.predictions[0];
        assert_eq!(p.conflict_type, ConflictType::Semantic);
        assert!((p.confidence - 0.9).abs() < 1e-9);
        assert!(p.requires_manual_review);
        assert_eq!(p.suggested_resolution, "manual-semantic-review");
    }

    #[test]
    fn out_of_range_semantic_cap_is_rejected() {
        for cap in [-0.1, 0.95, 1.0, f64::NAN] {
            let config = ConflictConfig {
                semantic_confidence_cap: cap,
                ..ConflictConfig::default()
            };
            assert!(
                matches!(ConflictPredictor::new(config), Err(ChangeGraphError::Config(_))),
                "cap {} accepted",
                cap
            );
        }
    }

    #[test]
    fn lowered_cap_bounds_semantic_confidence() {
        let s = setup();
        let config = ConflictConfig {
            semantic_confidence_cap: 0.5,
            ..ConflictConfig::default()
        };
        let report = ConflictPredictor::new(config)
            .unwrap()
            .with_semantic_classifier(Arc::new(AlwaysSure))
            .predict(
                &s.snapshot,
                &s.catalog,
                &[change(&s.script.key, Some("s0"), Some("s1"), "a")],
                &[change(&s.tag.key, Some("t0"), Some("t1"), "b")],
                &Deadline::none(),
            )
            .unwrap();
        assert!((report.predictions[0].confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn critical_resources_make_critical_conflicts() {
        assert_eq!(severity_for(Criticality::Critical, 0.1), Severity::Critical);
        assert_eq!(severity_for(Criticality::High, 0.95), Severity::High);
        assert_eq!(severity_for(Criticality::Low, 0.65), Severity::Medium);
        assert_eq!(severity_for(Criticality::Low, 0.2), Severity::Low);
    }
}

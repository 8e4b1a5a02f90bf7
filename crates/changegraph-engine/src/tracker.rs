use crate::catalog::Catalog;
use changegraph_core::{
    new_id, Change, ChangeEvent, ChangeGraphError, ChangeType, Fingerprint, GraphStore, Resource,
    ResourceKey, Result, RiskConfig, RiskFactors,
};
use changegraph_graph::DependencyGraph;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A change and the resource state it produces, not yet persisted.
#[derive(Debug, Clone)]
pub struct Observation {
    pub change: Change,
    pub resource: Resource,
}

/// Turns file-level events into immutable, risk-scored `Change` records.
pub struct ChangeTracker {
    catalog: Arc<Catalog>,
    graph: Arc<DependencyGraph>,
    store: Arc<dyn GraphStore>,
    risk: RiskConfig,
}

impl ChangeTracker {
    pub fn new(
        catalog: Arc<Catalog>,
        graph: Arc<DependencyGraph>,
        store: Arc<dyn GraphStore>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            catalog,
            graph,
            store,
            risk,
        }
    }

    /// Record one event: resolve the resource, fingerprint, score, persist
    /// append-only, then update the in-memory catalog and graph.
    ///
    /// Nothing in memory changes when the store rejects the write.
    #[instrument(skip_all, fields(path = %event.path, change_type = %event.change_type))]
    pub async fn observe(&self, event: &ChangeEvent) -> Result<Change> {
        let observation = self.prepare(event)?;
        self.store
            .put_observation(&observation.resource, &observation.change)
            .await?;
        self.commit(&observation);
        debug!(
            change = %observation.change.id,
            risk = observation.change.risk_score,
            level = %observation.change.risk_level,
            "change recorded"
        );
        Ok(observation.change)
    }

    /// Key the event will be recorded under.
    pub fn key_for(&self, event: &ChangeEvent) -> Result<ResourceKey> {
        if is_relocation(event.change_type) {
            if let Some(previous) = &event.previous_path {
                if let Ok(existing) = self.catalog.lookup(previous) {
                    return Ok(existing.key);
                }
            }
        }
        self.catalog.key_for(&event.path)
    }

    /// Compute the change and the updated resource without side effects.
    pub fn prepare(&self, event: &ChangeEvent) -> Result<Observation> {
        if event.path.trim().is_empty() {
            return Err(ChangeGraphError::Validation("change event without path".to_string()));
        }
        if is_relocation(event.change_type) && event.previous_path.is_none() {
            return Err(ChangeGraphError::Validation(format!(
                "{} event for {} lacks previous_path",
                event.change_type, event.path
            )));
        }

        let (mut resource, previous_path) = self.resolve_resource(event)?;
        let before = resource.current_fingerprint.clone();
        let after = self.after_fingerprint(event, &resource, before.as_ref())?;

        if event.change_type == ChangeType::Modified && after == before {
            return Err(ChangeGraphError::Validation(format!(
                "modification of {} leaves content unchanged",
                resource.key
            )));
        }

        let factors = self.risk_factors(event, &resource);
        let risk_score = factors.total();
        let change = Change {
            id: new_id(),
            resource_key: resource.key.clone(),
            path: resource.path.clone(),
            previous_path,
            change_type: event.change_type,
            before_fingerprint: before,
            after_fingerprint: after.clone(),
            timestamp: event.timestamp,
            author: event.author.clone(),
            branch: event.branch.clone(),
            risk_score,
            risk_level: self.risk.thresholds.bucket(risk_score),
            risk_factors: factors,
        };
        if !change.fingerprints_consistent() {
            return Err(ChangeGraphError::Validation(format!(
                "inconsistent fingerprints for change on {}",
                change.resource_key
            )));
        }

        resource.current_fingerprint = after;
        resource.removed = event.change_type == ChangeType::Deleted;
        resource.updated_at = event.timestamp;
        Ok(Observation { change, resource })
    }

    /// Publish a persisted observation.
    pub fn commit(&self, observation: &Observation) {
        self.catalog.commit(observation.resource.clone());
        self.graph.upsert_resource(&observation.resource);
    }

    /// Weighted risk contributions for an event on `resource`.
    pub fn risk_factors(&self, event: &ChangeEvent, resource: &Resource) -> RiskFactors {
        let criticality = self.risk.criticality_weights.weight(resource.criticality);
        let change_type = self.risk.change_type_weights.weight(event.change_type);

        let size = match event.size_delta {
            Some(bytes) if self.risk.size_scale_bytes > 0 => {
                let ratio = (bytes as f64 / self.risk.size_scale_bytes as f64).min(1.0);
                self.risk.size_weight_cap * ratio
            }
            _ => 0.0,
        };

        let location = if !self.catalog.is_in_project(&event.path) {
            self.risk.out_of_project_weight
        } else {
            match (&event.origin_module, &resource.module) {
                (Some(origin), Some(owner)) if origin != owner => self.risk.cross_module_weight,
                _ => 0.0,
            }
        };

        RiskFactors {
            criticality,
            change_type,
            size,
            location,
        }
    }

    fn resolve_resource(&self, event: &ChangeEvent) -> Result<(Resource, Option<String>)> {
        if is_relocation(event.change_type) {
            if let Some(previous) = &event.previous_path {
                if self.catalog.lookup(previous).is_ok() {
                    let moved = self.catalog.prepare_rename(previous, &event.path)?;
                    return Ok((moved, Some(previous.clone())));
                }
            }
        }

        let resource = match self.catalog.lookup(&event.path) {
            Ok(existing) => existing,
            Err(ChangeGraphError::NotFound(_)) => {
                let classification = self.catalog.resolve(&event.path)?;
                self.catalog.prepare_register(&event.path, classification)?
            }
            Err(e) => return Err(e),
        };
        Ok((resource, event.previous_path.clone()))
    }

    fn after_fingerprint(
        &self,
        event: &ChangeEvent,
        resource: &Resource,
        before: Option<&Fingerprint>,
    ) -> Result<Option<Fingerprint>> {
        match event.change_type {
            ChangeType::Deleted => Ok(None),
            ChangeType::Created | ChangeType::Modified => match event.fingerprint() {
                Some(fp) => Ok(Some(fp)),
                None => Err(ChangeGraphError::Validation(format!(
                    "{} event for {} carries neither content hash nor content",
                    event.change_type, event.path
                ))),
            },
            ChangeType::Renamed | ChangeType::Moved => {
                let supplied = event.fingerprint();
                if supplied.is_some() && supplied.as_ref() != before {
                    return Ok(supplied);
                }
                // Same bytes at a new location: the location is part of the state.
                let seed = format!(
                    "{}\n{}",
                    before.map(|f| f.as_str()).unwrap_or_default(),
                    resource.path
                );
                Ok(Some(Fingerprint::of(seed.as_bytes())))
            }
        }
    }
}

fn is_relocation(change_type: ChangeType) -> bool {
    matches!(change_type, ChangeType::Renamed | ChangeType::Moved)
}

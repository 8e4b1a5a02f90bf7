use crate::{
    Change, Classification, DependencyEdge, Direction, ReachableSet, Resource, ResourceKey, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time copy of everything a store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub resources: Vec<Resource>,
    pub edges: Vec<DependencyEdge>,
    pub changes: Vec<Change>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// Durable persistence port. The only component allowed to block on I/O.
///
/// Implementations fail with `ChangeGraphError::StoreUnavailable` when the
/// backend cannot be reached.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn put_resource(&self, resource: &Resource) -> Result<()>;
    /// Append-only: a change id is never overwritten.
    async fn put_change(&self, change: &Change) -> Result<()>;
    async fn put_edge(&self, edge: &DependencyEdge) -> Result<()>;
    /// Persist a change together with the resource state it produces.
    ///
    /// Backends that can write both at once should override this. The
    /// default writes the change first, so a failure never leaves a stored
    /// fingerprint that no history entry explains.
    async fn put_observation(&self, resource: &Resource, change: &Change) -> Result<()> {
        self.put_change(change).await?;
        self.put_resource(resource).await
    }
    async fn get_reachable(
        &self,
        key: &ResourceKey,
        max_depth: usize,
        direction: Direction,
    ) -> Result<ReachableSet>;
    /// Changes to one resource ordered by timestamp.
    async fn get_history(&self, key: &ResourceKey) -> Result<Vec<Change>>;
    /// Resources, edges and changes as of a single point in time.
    async fn load_snapshot(&self) -> Result<StoreSnapshot>;
}

/// Host-supplied knowledge of domain file types.
///
/// Returning `ChangeGraphError::UnresolvableResource` is recoverable: the
/// catalog falls back to `ResourceType::Other`.
pub trait ResourceClassifier: Send + Sync {
    fn classify(&self, path: &str) -> Result<Classification>;
}

/// Optional judge of whether two changes to different resources are
/// logically incompatible. Returns a confidence, or `None` for no conflict.
pub trait SemanticConflictClassifier: Send + Sync {
    fn assess(&self, a: &Change, b: &Change) -> Option<f64>;

    fn resolution_hint(&self) -> &str {
        "manual-semantic-review"
    }
}

/// Optional identity-collision check used for naming conflicts.
pub trait IdentityResolver: Send + Sync {
    /// Logical identifier two distinct resources could collide on.
    fn logical_identity(&self, resource: &Resource) -> Option<String>;
}

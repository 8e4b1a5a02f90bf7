use crate::{ChangeId, ChangeType, Fingerprint, ResourceKey, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File-level event delivered by an external watcher or VCS hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: String,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub branch: String,
    /// Precomputed content hash of the new state.
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Raw new content; hashed when no `content_hash` is supplied.
    #[serde(default, skip_serializing)]
    pub content: Option<Vec<u8>>,
    /// Old path for `Renamed` / `Moved` events.
    #[serde(default)]
    pub previous_path: Option<String>,
    /// Approximate number of bytes touched.
    #[serde(default)]
    pub size_delta: Option<u64>,
    /// Module the author was working in, if the source knows it.
    #[serde(default)]
    pub origin_module: Option<String>,
}

impl ChangeEvent {
    pub fn new(
        path: impl Into<String>,
        change_type: ChangeType,
        author: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            change_type,
            timestamp: Utc::now(),
            author: author.into(),
            branch: branch.into(),
            content_hash: None,
            content: None,
            previous_path: None,
            size_delta: None,
            origin_module: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_previous_path(mut self, path: impl Into<String>) -> Self {
        self.previous_path = Some(path.into());
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_delta = Some(bytes);
        self
    }

    pub fn with_origin_module(mut self, module: impl Into<String>) -> Self {
        self.origin_module = Some(module.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Fingerprint of the new state, preferring the supplied hash.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        if let Some(hash) = &self.content_hash {
            return Some(Fingerprint::from_hash(hash.clone()));
        }
        self.content.as_deref().map(Fingerprint::of)
    }
}

/// Per-factor contributions that sum to `Change::risk_score`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskFactors {
    pub criticality: f64,
    pub change_type: f64,
    pub size: f64,
    pub location: f64,
}

impl RiskFactors {
    pub fn total(&self) -> f64 {
        (self.criticality + self.change_type + self.size + self.location).clamp(0.0, 1.0)
    }
}

/// Immutable record of one mutation to one resource.
///
/// Shared as `Arc<Change>` once recorded; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub resource_key: ResourceKey,
    pub path: String,
    pub previous_path: Option<String>,
    pub change_type: ChangeType,
    pub before_fingerprint: Option<Fingerprint>,
    pub after_fingerprint: Option<Fingerprint>,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub branch: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub risk_factors: RiskFactors,
}

impl Change {
    /// `after != before` unless the change is a deletion.
    pub fn fingerprints_consistent(&self) -> bool {
        match self.change_type {
            ChangeType::Deleted => true,
            _ => self.after_fingerprint.is_some() && self.after_fingerprint != self.before_fingerprint,
        }
    }
}

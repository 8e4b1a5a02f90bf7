use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ChangeId = Uuid;
pub type ConflictId = Uuid;
pub type ReleaseId = Uuid;

/// Time-ordered identifier for newly created records.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Stable identity of a resource, derived from its type and normalized path.
///
/// Renames keep the original key: the catalog maps the new path onto it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn derive(path: &str, resource_type: &ResourceType) -> Self {
        Self(format!("{}:{}", resource_type.slug(), normalize_path(path)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Normalize separators so `./views\Main.json` and `views/Main.json` agree.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut out: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            s => out.push(s),
        }
    }
    let joined = out.join("/");
    if unified.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ViewDefinition,
    ServerScript,
    TagConfig,
    DataConnection,
    SecurityConfig,
    /// Host-registered type, see `ResourceTypeRegistry`.
    Custom(String),
    Other,
}

impl ResourceType {
    pub fn slug(&self) -> &str {
        match self {
            ResourceType::ViewDefinition => "view",
            ResourceType::ServerScript => "script",
            ResourceType::TagConfig => "tag",
            ResourceType::DataConnection => "connection",
            ResourceType::SecurityConfig => "security",
            ResourceType::Custom(name) => name.as_str(),
            ResourceType::Other => "other",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "view" | "view_definition" => Ok(ResourceType::ViewDefinition),
            "script" | "server_script" => Ok(ResourceType::ServerScript),
            "tag" | "tag_config" => Ok(ResourceType::TagConfig),
            "connection" | "data_connection" => Ok(ResourceType::DataConnection),
            "security" | "security_config" => Ok(ResourceType::SecurityConfig),
            "other" | "" => Ok(ResourceType::Other),
            custom => Ok(ResourceType::Custom(custom.to_string())),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Criticality {
    /// One level up, saturating at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Criticality::Low => Criticality::Medium,
            Criticality::Medium => Criticality::High,
            Criticality::High | Criticality::Critical => Criticality::Critical,
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Criticality::Low => "low",
            Criticality::Medium => "medium",
            Criticality::High => "high",
            Criticality::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Criticality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Criticality::Low),
            "medium" => Ok(Criticality::Medium),
            "high" => Ok(Criticality::High),
            "critical" => Ok(Criticality::Critical),
            other => Err(format!("unknown criticality: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
    Renamed,
    Moved,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Created => "created",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
            ChangeType::Renamed => "renamed",
            ChangeType::Moved => "moved",
        };
        write!(f, "{}", s)
    }
}

/// Discretized risk bucket derived from a continuous risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Content hash identifying a resource's state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 of raw content, lowercase hex.
    pub fn of(content: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(content)))
    }

    /// Wrap a hash computed by the event source.
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    References,
    Calls,
    Binds,
    Includes,
    Inherits,
    Other(String),
}

impl Default for DependencyKind {
    fn default() -> Self {
        DependencyKind::References
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyKind::References => "references",
            DependencyKind::Calls => "calls",
            DependencyKind::Binds => "binds",
            DependencyKind::Includes => "includes",
            DependencyKind::Inherits => "inherits",
            DependencyKind::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "references" => Ok(DependencyKind::References),
            "calls" => Ok(DependencyKind::Calls),
            "binds" => Ok(DependencyKind::Binds),
            "includes" => Ok(DependencyKind::Includes),
            "inherits" => Ok(DependencyKind::Inherits),
            other => Ok(DependencyKind::Other(other.to_string())),
        }
    }
}

/// Directed relation: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: ResourceKey,
    pub to: ResourceKey,
    pub kind: DependencyKind,
}

impl DependencyEdge {
    pub fn new(from: ResourceKey, to: ResourceKey, kind: DependencyKind) -> Self {
        Self { from, to, kind }
    }
}

/// Traversal direction over dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Resources that depend on the given one (follow edges backwards).
    /// This is the blast-radius direction.
    Dependents,
    /// Resources the given one depends on (follow edges forwards).
    Dependencies,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Dependents => Direction::Dependencies,
            Direction::Dependencies => Direction::Dependents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackComplexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    FileLevel,
    Naming,
    Dependency,
    Semantic,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictType::FileLevel => "file_level",
            ConflictType::Naming => "naming",
            ConflictType::Dependency => "dependency",
            ConflictType::Semantic => "semantic",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStrategy {
    BigBang,
    Incremental,
    FeatureFlag,
    BlueGreen,
    Canary,
}

impl fmt::Display for ReleaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStrategy::BigBang => "big_bang",
            ReleaseStrategy::Incremental => "incremental",
            ReleaseStrategy::FeatureFlag => "feature_flag",
            ReleaseStrategy::BlueGreen => "blue_green",
            ReleaseStrategy::Canary => "canary",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ReleaseStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "big_bang" | "bigbang" => Ok(ReleaseStrategy::BigBang),
            "incremental" => Ok(ReleaseStrategy::Incremental),
            "feature_flag" | "featureflag" => Ok(ReleaseStrategy::FeatureFlag),
            "blue_green" | "bluegreen" => Ok(ReleaseStrategy::BlueGreen),
            "canary" => Ok(ReleaseStrategy::Canary),
            other => Err(format!("unknown release strategy: {}", other)),
        }
    }
}

/// Release lifecycle; transitions are driven by an external approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Draft,
    UnderReview,
    Approved,
    RolledOut,
    Completed,
    RolledBack,
}

impl ReleaseStatus {
    pub fn can_transition_to(self, next: ReleaseStatus) -> bool {
        use ReleaseStatus::*;
        matches!(
            (self, next),
            (Draft, UnderReview)
                | (UnderReview, Approved)
                | (Approved, RolledOut)
                | (RolledOut, Completed)
                | (RolledOut, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReleaseStatus::Completed | ReleaseStatus::RolledBack)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::Draft => "draft",
            ReleaseStatus::UnderReview => "under_review",
            ReleaseStatus::Approved => "approved",
            ReleaseStatus::RolledOut => "rolled_out",
            ReleaseStatus::Completed => "completed",
            ReleaseStatus::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

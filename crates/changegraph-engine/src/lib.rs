//! Change tracking and analysis on top of the dependency graph: resource
//! catalog, risk-scored change tracking, impact analysis, conflict
//! prediction, release planning, and the `Engine` that wires them to a
//! Graph Store.

pub mod catalog;
pub mod classifier;
pub mod commands;
pub mod conflict;
pub mod engine;
pub mod impact;
pub mod release;
pub mod tracker;

pub use catalog::{Catalog, ResourceTypeRegistry};
pub use classifier::{ClassificationRule, PathPatternClassifier};
pub use commands::{
    AnalyzeImpactRequest, ChangeSelector, Command, CommandResponse, PlanReleaseRequest,
    PredictConflictsRequest,
};
pub use conflict::{severity_for, ConflictPredictor};
pub use engine::{Engine, EngineBuilder};
pub use impact::ImpactAnalyzer;
pub use release::{blocking_conflicts, worst_rollback, ReleasePlanner};
pub use tracker::{ChangeTracker, Observation};

//! Serializable command surface for external front ends.
//!
//! A command arrives as JSON such as
//! `{"command": "analyze-impact", "changes": {"branch": "feature"}}` and the
//! matching report comes back tagged with its `kind`.

use crate::engine::Engine;
use changegraph_core::{
    ChangeId, ConflictReport, ImpactReport, ReleasePlan, ReleaseStrategy, Result,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which changes a command operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSelector {
    /// Explicit change ids; empty is a validation error.
    Ids(Vec<ChangeId>),
    /// Every recorded change made on a branch.
    Branch(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeImpactRequest {
    pub changes: ChangeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictConflictsRequest {
    pub left: ChangeSelector,
    pub right: ChangeSelector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReleaseRequest {
    pub changes: ChangeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ReleaseStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    AnalyzeImpact(AnalyzeImpactRequest),
    PredictConflicts(PredictConflictsRequest),
    PlanRelease(PlanReleaseRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AnalyzeImpact(_) => "analyze-impact",
            Command::PredictConflicts(_) => "predict-conflicts",
            Command::PlanRelease(_) => "plan-release",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "report", rename_all = "snake_case")]
pub enum CommandResponse {
    Impact(ImpactReport),
    Conflicts(ConflictReport),
    Release(ReleasePlan),
}

impl Engine {
    pub fn execute(&self, command: &Command) -> Result<CommandResponse> {
        debug!(command = command.name(), "executing command");
        match command {
            Command::AnalyzeImpact(req) => self
                .analyze_impact(&req.changes, req.max_depth)
                .map(CommandResponse::Impact),
            Command::PredictConflicts(req) => self
                .predict_conflicts(&req.left, &req.right)
                .map(CommandResponse::Conflicts),
            Command::PlanRelease(req) => self
                .plan_release(
                    &req.changes,
                    req.strategy,
                    req.risk_threshold,
                    req.target_branch.clone(),
                )
                .map(CommandResponse::Release),
        }
    }

    /// Parse a JSON command, run it, and render the response as JSON.
    pub fn execute_json(&self, input: &str) -> Result<String> {
        let command: Command = serde_json::from_str(input)?;
        let response = self.execute(&command)?;
        Ok(serde_json::to_string(&response)?)
    }
}

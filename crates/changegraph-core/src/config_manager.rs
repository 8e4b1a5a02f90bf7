use crate::{ChangeType, Criticality, ReleaseStrategy, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for the ChangeGraph engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub impact: ImpactConfig,

    #[serde(default)]
    pub conflict: ConflictConfig,

    #[serde(default)]
    pub release: ReleaseConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Named weights for the change risk formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_criticality_weights")]
    pub criticality_weights: CriticalityWeights,

    #[serde(default = "default_change_type_weights")]
    pub change_type_weights: ChangeTypeWeights,

    /// Upper bound of the size contribution
    #[serde(default = "default_size_cap")]
    pub size_weight_cap: f64,

    /// Bytes at which the size contribution saturates
    #[serde(default = "default_size_scale")]
    pub size_scale_bytes: u64,

    #[serde(default = "default_cross_module_weight")]
    pub cross_module_weight: f64,

    #[serde(default = "default_out_of_project_weight")]
    pub out_of_project_weight: f64,

    #[serde(default)]
    pub thresholds: RiskThresholds,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            criticality_weights: default_criticality_weights(),
            change_type_weights: default_change_type_weights(),
            size_weight_cap: default_size_cap(),
            size_scale_bytes: default_size_scale(),
            cross_module_weight: default_cross_module_weight(),
            out_of_project_weight: default_out_of_project_weight(),
            thresholds: RiskThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CriticalityWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl CriticalityWeights {
    pub fn weight(&self, criticality: Criticality) -> f64 {
        match criticality {
            Criticality::Low => self.low,
            Criticality::Medium => self.medium,
            Criticality::High => self.high,
            Criticality::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChangeTypeWeights {
    pub created: f64,
    pub modified: f64,
    pub moved: f64,
    pub renamed: f64,
    pub deleted: f64,
}

impl ChangeTypeWeights {
    pub fn weight(&self, change_type: ChangeType) -> f64 {
        match change_type {
            ChangeType::Created => self.created,
            ChangeType::Modified => self.modified,
            ChangeType::Moved => self.moved,
            ChangeType::Renamed => self.renamed,
            ChangeType::Deleted => self.deleted,
        }
    }
}

/// Upper bounds (exclusive) of the Low/Medium/High buckets
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 0.25,
            medium: 0.5,
            high: 0.75,
        }
    }
}

impl RiskThresholds {
    pub fn bucket(&self, score: f64) -> RiskLevel {
        if score < self.low {
            RiskLevel::Low
        } else if score < self.medium {
            RiskLevel::Medium
        } else if score < self.high {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

/// Resource catalog rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Glob pattern -> criticality; highest precedence
    #[serde(default)]
    pub criticality_overrides: BTreeMap<String, Criticality>,

    /// Type slug -> default criticality
    #[serde(default = "default_type_criticality")]
    pub type_defaults: BTreeMap<String, Criticality>,

    /// Path substrings that escalate criticality one level
    #[serde(default = "default_escalation_keywords")]
    pub escalation_keywords: Vec<String>,

    /// Paths outside this prefix count as out-of-project
    #[serde(default)]
    pub project_root: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            criticality_overrides: BTreeMap::new(),
            type_defaults: default_type_criticality(),
            escalation_keywords: default_escalation_keywords(),
            project_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Traversal budget in milliseconds (0 = unlimited)
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Depth beyond which rollback complexity is at least Medium
    #[serde(default = "default_medium_depth")]
    pub medium_rollback_depth: usize,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            deadline_ms: default_deadline_ms(),
            medium_rollback_depth: default_medium_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Predictions below this confidence require manual review
    #[serde(default = "default_review_threshold")]
    pub manual_review_threshold: f64,

    /// Confidence of a one-hop dependency conflict
    #[serde(default = "default_dependency_confidence")]
    pub dependency_base_confidence: f64,

    #[serde(default = "default_dependency_depth")]
    pub dependency_search_depth: usize,

    /// Cap applied to semantic classifier output
    #[serde(default = "default_semantic_cap")]
    pub semantic_confidence_cap: f64,
}

/// Highest confidence a semantic prediction may carry.
pub const SEMANTIC_CONFIDENCE_CEILING: f64 = 0.9;

impl ConflictConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("manual_review_threshold", self.manual_review_threshold),
            ("dependency_base_confidence", self.dependency_base_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(0.0..=SEMANTIC_CONFIDENCE_CEILING).contains(&self.semantic_confidence_cap) {
            return Err(ConfigError::ValidationError(format!(
                "semantic_confidence_cap must be within [0, {}], got {}",
                SEMANTIC_CONFIDENCE_CEILING, self.semantic_confidence_cap
            )));
        }
        Ok(())
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            manual_review_threshold: default_review_threshold(),
            dependency_base_confidence: default_dependency_confidence(),
            dependency_search_depth: default_dependency_depth(),
            semantic_confidence_cap: default_semantic_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_risk_threshold")]
    pub default_risk_threshold: f64,

    #[serde(default = "default_strategy")]
    pub default_strategy: ReleaseStrategy,

    /// Multiplier applied to aggregate risk for guarded strategies
    #[serde(default = "default_feature_flag_factor")]
    pub feature_flag_factor: f64,

    #[serde(default = "default_blue_green_factor")]
    pub blue_green_factor: f64,

    #[serde(default = "default_canary_factor")]
    pub canary_factor: f64,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            default_risk_threshold: default_risk_threshold(),
            default_strategy: default_strategy(),
            feature_flag_factor: default_feature_flag_factor(),
            blue_green_factor: default_blue_green_factor(),
            canary_factor: default_canary_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: "memory" or "rocksdb"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_criticality_weights() -> CriticalityWeights {
    CriticalityWeights {
        low: 0.1,
        medium: 0.15,
        high: 0.25,
        critical: 0.4,
    }
}
fn default_change_type_weights() -> ChangeTypeWeights {
    ChangeTypeWeights {
        created: 0.05,
        modified: 0.15,
        moved: 0.2,
        renamed: 0.25,
        deleted: 0.3,
    }
}
fn default_size_cap() -> f64 {
    0.15
}
fn default_size_scale() -> u64 {
    16 * 1024
}
fn default_cross_module_weight() -> f64 {
    0.1
}
fn default_out_of_project_weight() -> f64 {
    0.15
}
fn default_type_criticality() -> BTreeMap<String, Criticality> {
    BTreeMap::from([
        ("view".to_string(), Criticality::Medium),
        ("script".to_string(), Criticality::High),
        ("tag".to_string(), Criticality::High),
        ("connection".to_string(), Criticality::High),
        ("security".to_string(), Criticality::Critical),
    ])
}
fn default_escalation_keywords() -> Vec<String> {
    vec!["security".to_string(), "gateway".to_string()]
}
fn default_max_depth() -> usize {
    8
}
fn default_deadline_ms() -> u64 {
    2_000
}
fn default_medium_depth() -> usize {
    2
}
fn default_review_threshold() -> f64 {
    0.7
}
fn default_dependency_confidence() -> f64 {
    0.9
}
fn default_dependency_depth() -> usize {
    4
}
fn default_semantic_cap() -> f64 {
    0.9
}
fn default_risk_threshold() -> f64 {
    0.75
}
fn default_strategy() -> ReleaseStrategy {
    ReleaseStrategy::Incremental
}
fn default_feature_flag_factor() -> f64 {
    0.8
}
fn default_blue_green_factor() -> f64 {
    0.7
}
fn default_canary_factor() -> f64 {
    0.6
}
fn default_store_backend() -> String {
    "memory".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from(".changegraph/store")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: EngineConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.changegraph.toml)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match &config_path {
            Some(path) => info!("Loaded ChangeGraph config from {}", path.display()),
            None => info!("No ChangeGraph config file found, using defaults"),
        }
        info!(
            store = %config.store.backend,
            max_depth = config.impact.max_depth,
            "Configuration ready"
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load an explicit file, still applying environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::apply_env_overrides(Self::read_toml_file(path)?);
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            }
            return;
        }

        if let Some(home) = dirs::home_dir() {
            let home_env = home.join(".changegraph.env");
            if home_env.exists() {
                if let Err(e) = dotenv::from_path(&home_env) {
                    warn!("Failed to load .changegraph.env: {}", e);
                }
            }
        }
    }

    /// Search order: ./.changegraph.toml, ~/.changegraph/config.toml, defaults
    fn load_config_file() -> Result<(EngineConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".changegraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".changegraph").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((EngineConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<EngineConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: EngineConfig) -> EngineConfig {
        if let Ok(depth) = std::env::var("CHANGEGRAPH_MAX_DEPTH") {
            if let Ok(d) = depth.parse() {
                config.impact.max_depth = d;
            }
        }
        if let Ok(ms) = std::env::var("CHANGEGRAPH_DEADLINE_MS") {
            if let Ok(ms) = ms.parse() {
                config.impact.deadline_ms = ms;
            }
        }
        if let Ok(threshold) = std::env::var("CHANGEGRAPH_REVIEW_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                config.conflict.manual_review_threshold = t;
            }
        }
        if let Ok(threshold) = std::env::var("CHANGEGRAPH_RISK_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                config.release.default_risk_threshold = t;
            }
        }
        if let Ok(root) = std::env::var("CHANGEGRAPH_PROJECT_ROOT") {
            config.catalog.project_root = Some(root);
        }
        if let Ok(backend) = std::env::var("CHANGEGRAPH_STORE_BACKEND") {
            config.store.backend = backend;
        }
        if let Ok(path) = std::env::var("CHANGEGRAPH_STORE_PATH") {
            config.store.path = PathBuf::from(path);
        }
        if let Ok(format) = std::env::var("CHANGEGRAPH_LOG_FORMAT") {
            config.logging.format = format;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }

        config
    }

    pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
        let t = &config.risk.thresholds;
        if !(0.0 < t.low && t.low < t.medium && t.medium < t.high && t.high <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "Risk thresholds must be strictly increasing within (0, 1]: {} / {} / {}",
                t.low, t.medium, t.high
            )));
        }

        let w = &config.risk.criticality_weights;
        if !(w.low <= w.medium && w.medium <= w.high && w.high <= w.critical) {
            return Err(ConfigError::ValidationError(
                "Criticality weights must be non-decreasing from low to critical".to_string(),
            ));
        }

        let c = &config.risk.change_type_weights;
        for (name, value) in [
            ("criticality_weights.low", w.low),
            ("change_type_weights.created", c.created),
            ("change_type_weights.modified", c.modified),
            ("change_type_weights.moved", c.moved),
            ("change_type_weights.renamed", c.renamed),
            ("change_type_weights.deleted", c.deleted),
            ("size_weight_cap", config.risk.size_weight_cap),
            ("cross_module_weight", config.risk.cross_module_weight),
            ("out_of_project_weight", config.risk.out_of_project_weight),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }

        if config.risk.size_scale_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "size_scale_bytes must be greater than zero".to_string(),
            ));
        }

        config.conflict.validate()?;
        if !(0.0..=1.0).contains(&config.release.default_risk_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "default_risk_threshold must be within [0, 1], got {}",
                config.release.default_risk_threshold
            )));
        }

        match config.store.backend.as_str() {
            "memory" | "rocksdb" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid store backend: {}. Must be one of: memory, rocksdb",
                    other
                )))
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn into_config(self) -> EngineConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write the default configuration as TOML.
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = EngineConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

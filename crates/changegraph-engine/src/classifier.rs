use changegraph_core::{
    ChangeGraphError, Classification, ConfigError, Criticality, ResourceClassifier, ResourceType,
    Result,
};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// One glob rule of the path classifier.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub pattern: String,
    pub resource_type: ResourceType,
    pub criticality: Option<Criticality>,
}

impl ClassificationRule {
    pub fn new(pattern: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            pattern: pattern.into(),
            resource_type,
            criticality: None,
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = Some(criticality);
        self
    }
}

/// Default `ResourceClassifier`: maps project-relative paths to resource
/// types with glob rules. The first matching rule wins.
///
/// Paths matching no rule are `UnresolvableResource`, which the catalog
/// turns into `ResourceType::Other`.
pub struct PathPatternClassifier {
    rules: Vec<ClassificationRule>,
    set: GlobSet,
}

impl PathPatternClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for rule in &rules {
            let glob = Glob::new(&rule.pattern).map_err(|e| {
                ChangeGraphError::Config(ConfigError::ValidationError(format!(
                    "invalid classifier pattern '{}': {}",
                    rule.pattern, e
                )))
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| {
            ChangeGraphError::Config(ConfigError::ValidationError(e.to_string()))
        })?;
        Ok(Self { rules, set })
    }

    pub fn default_rules() -> Vec<ClassificationRule> {
        vec![
            ClassificationRule::new("views/**/*.json", ResourceType::ViewDefinition),
            ClassificationRule::new("scripts/**", ResourceType::ServerScript),
            ClassificationRule::new("**/*.py", ResourceType::ServerScript),
            ClassificationRule::new("tags/**", ResourceType::TagConfig),
            ClassificationRule::new("db/**", ResourceType::DataConnection),
            ClassificationRule::new("**/*connection*", ResourceType::DataConnection),
            ClassificationRule::new("security/**", ResourceType::SecurityConfig),
        ]
    }

    /// Default rules followed by `extra` ones.
    pub fn with_extra_rules(extra: Vec<ClassificationRule>) -> Result<Self> {
        let mut rules = Self::default_rules();
        rules.extend(extra);
        Self::new(rules)
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }
}

impl ResourceClassifier for PathPatternClassifier {
    fn classify(&self, path: &str) -> Result<Classification> {
        let first = self.set.matches(path).into_iter().min();
        match first.and_then(|idx| self.rules.get(idx)) {
            Some(rule) => {
                let mut classification = Classification::of_type(rule.resource_type.clone());
                classification.criticality = rule.criticality;
                Ok(classification)
            }
            None => Err(ChangeGraphError::UnresolvableResource(path.to_string())),
        }
    }
}

use crate::classifier::PathPatternClassifier;
use changegraph_core::{
    normalize_path, CatalogConfig, ChangeGraphError, Classification, ConfigError, Criticality,
    Resource, ResourceClassifier, ResourceKey, ResourceType, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host-registered resource types and their default criticality.
#[derive(Debug, Default)]
pub struct ResourceTypeRegistry {
    types: RwLock<BTreeMap<String, Criticality>>,
}

impl ResourceTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or update) a custom type and return it.
    pub fn register(&self, name: &str, default_criticality: Criticality) -> ResourceType {
        let slug = name.trim().to_lowercase();
        self.types.write().insert(slug.clone(), default_criticality);
        ResourceType::Custom(slug)
    }

    pub fn default_criticality(&self, name: &str) -> Option<Criticality> {
        self.types.read().get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.types.read().keys().cloned().collect()
    }
}

/// Maps paths to typed resources and decides their criticality.
///
/// Mutations come in two phases: `prepare_*` computes the new resource
/// without touching the catalog, `commit` makes it visible. Callers persist
/// in between.
pub struct Catalog {
    config: CatalogConfig,
    overrides: GlobSet,
    override_levels: Vec<Criticality>,
    classifier: Arc<dyn ResourceClassifier>,
    registry: ResourceTypeRegistry,
    resources: DashMap<ResourceKey, Resource>,
    paths: DashMap<String, ResourceKey>,
}

impl Catalog {
    pub fn new(config: CatalogConfig, classifier: Arc<dyn ResourceClassifier>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut override_levels = Vec::with_capacity(config.criticality_overrides.len());
        for (pattern, level) in &config.criticality_overrides {
            let glob = Glob::new(pattern).map_err(|e| {
                ChangeGraphError::Config(ConfigError::ValidationError(format!(
                    "invalid criticality override '{}': {}",
                    pattern, e
                )))
            })?;
            builder.add(glob);
            override_levels.push(*level);
        }
        let overrides = builder
            .build()
            .map_err(|e| ChangeGraphError::Config(ConfigError::ValidationError(e.to_string())))?;

        Ok(Self {
            config,
            overrides,
            override_levels,
            classifier,
            registry: ResourceTypeRegistry::new(),
            resources: DashMap::new(),
            paths: DashMap::new(),
        })
    }

    /// Catalog with the glob-based default classifier.
    pub fn with_default_classifier(config: CatalogConfig) -> Result<Self> {
        let classifier = PathPatternClassifier::new(PathPatternClassifier::default_rules())?;
        Self::new(config, Arc::new(classifier))
    }

    pub fn registry(&self) -> &ResourceTypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Register a resource at `path` with an explicit type. Idempotent: a
    /// known path returns the existing resource unchanged.
    pub fn register(&self, path: &str, resource_type: ResourceType) -> Result<Resource> {
        if let Ok(existing) = self.lookup(path) {
            return Ok(existing);
        }
        let resource = self.prepare_register(path, Classification::of_type(resource_type))?;
        self.commit(resource.clone());
        Ok(resource)
    }

    /// Register `path` using the classifier.
    pub fn register_classified(&self, path: &str) -> Result<Resource> {
        if let Ok(existing) = self.lookup(path) {
            return Ok(existing);
        }
        let classification = self.resolve(path)?;
        let resource = self.prepare_register(path, classification)?;
        self.commit(resource.clone());
        Ok(resource)
    }

    pub fn lookup(&self, path: &str) -> Result<Resource> {
        let normalized = normalize_path(path);
        let key = self
            .paths
            .get(&normalized)
            .map(|k| k.clone())
            .ok_or_else(|| ChangeGraphError::NotFound(format!("resource at {}", normalized)))?;
        self.get(&key)
            .ok_or_else(|| ChangeGraphError::NotFound(format!("resource {}", key)))
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Resource> {
        self.resources.get(key).map(|r| r.clone())
    }

    /// Classify `path`, falling back to `Other` when the classifier cannot.
    pub fn resolve(&self, path: &str) -> Result<Classification> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Err(ChangeGraphError::Validation("empty resource path".to_string()));
        }
        let relative = self.relative_path(&normalized);
        match self.classifier.classify(relative) {
            Ok(classification) => Ok(classification),
            Err(ChangeGraphError::UnresolvableResource(reason)) => {
                warn!(path = %normalized, reason = %reason, "unresolvable resource, falling back to other");
                Ok(Classification::other())
            }
            Err(e) => Err(e),
        }
    }

    /// Key the given path has, or would get once registered.
    pub fn key_for(&self, path: &str) -> Result<ResourceKey> {
        if let Ok(existing) = self.lookup(path) {
            return Ok(existing.key);
        }
        let classification = self.resolve(path)?;
        Ok(ResourceKey::derive(path, &classification.resource_type))
    }

    /// Build a new resource for `path` without registering it.
    pub fn prepare_register(&self, path: &str, classification: Classification) -> Result<Resource> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Err(ChangeGraphError::Validation("empty resource path".to_string()));
        }
        if let ResourceType::Custom(name) = &classification.resource_type {
            if !self.registry.contains(name) && !self.config.type_defaults.contains_key(name) {
                debug!(resource_type = %name, "custom type without registered default");
            }
        }

        let criticality =
            self.criticality_for(&normalized, &classification.resource_type, classification.criticality);
        let module = classification
            .module
            .or_else(|| self.module_of(&normalized));
        Ok(Resource::new(&normalized, classification.resource_type, criticality)
            .with_module(module)
            .with_display_name(classification.display_name))
    }

    /// Resource as it would look after moving from `old_path` to `new_path`.
    /// The key is unchanged; the old path becomes an alias.
    pub fn prepare_rename(&self, old_path: &str, new_path: &str) -> Result<Resource> {
        let mut resource = self.lookup(old_path)?;
        let new_normalized = normalize_path(new_path);
        if new_normalized.is_empty() {
            return Err(ChangeGraphError::Validation("empty resource path".to_string()));
        }
        if let Some(owner) = self.paths.get(&new_normalized) {
            if *owner != resource.key {
                return Err(ChangeGraphError::Validation(format!(
                    "cannot rename {} to {}: path belongs to {}",
                    resource.path,
                    new_normalized,
                    owner.value()
                )));
            }
        }
        if resource.path != new_normalized {
            resource.aliases.push(resource.path.clone());
            resource.path = new_normalized;
            resource.module = self.module_of(&resource.path).or(resource.module);
            resource.updated_at = Utc::now();
        }
        Ok(resource)
    }

    /// Rename in one step, for callers without a store in between.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<Resource> {
        let resource = self.prepare_rename(old_path, new_path)?;
        self.commit(resource.clone());
        Ok(resource)
    }

    /// Make `resource` visible under its current path. Paths it was renamed
    /// away from stop resolving to it.
    pub fn commit(&self, resource: Resource) {
        for alias in &resource.aliases {
            self.paths.remove_if(alias, |_, key| *key == resource.key);
        }
        self.paths.insert(resource.path.clone(), resource.key.clone());
        self.resources.insert(resource.key.clone(), resource);
    }

    /// Bulk load of persisted resources.
    pub fn load(&self, resources: impl IntoIterator<Item = Resource>) {
        for resource in resources {
            self.commit(resource);
        }
    }

    /// Criticality under the catalog rules, ignoring any classifier input.
    pub fn classify_criticality(&self, resource: &Resource) -> Criticality {
        self.criticality_for(&resource.path, &resource.resource_type, None)
    }

    /// Precedence: explicit override, then classifier-asserted level, then
    /// the type-default table, then keyword escalation, then `Medium`.
    pub fn criticality_for(
        &self,
        path: &str,
        resource_type: &ResourceType,
        asserted: Option<Criticality>,
    ) -> Criticality {
        let relative = self.relative_path(path);
        if let Some(level) = self
            .overrides
            .matches(relative)
            .into_iter()
            .filter_map(|idx| self.override_levels.get(idx).copied())
            .max()
        {
            return level;
        }
        if let Some(level) = asserted {
            return level;
        }
        if let Some(level) = self.type_default(resource_type) {
            return level;
        }
        let lowered = relative.to_lowercase();
        if self
            .config
            .escalation_keywords
            .iter()
            .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
        {
            return Criticality::Medium.escalate();
        }
        Criticality::Medium
    }

    fn type_default(&self, resource_type: &ResourceType) -> Option<Criticality> {
        let slug = resource_type.slug();
        self.config
            .type_defaults
            .get(slug)
            .copied()
            .or_else(|| self.registry.default_criticality(slug))
    }

    /// Path relative to the project root, when it lies inside it.
    pub fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        let Some(root) = self.root() else {
            return path;
        };
        if path == root {
            return "";
        }
        path.strip_prefix(root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path)
    }

    pub fn is_in_project(&self, path: &str) -> bool {
        match self.root() {
            Some(root) => {
                let normalized = normalize_path(path);
                normalized == root || normalized.starts_with(&format!("{}/", root))
            }
            None => true,
        }
    }

    /// First path segment under the project root.
    pub fn module_of(&self, path: &str) -> Option<String> {
        if !self.is_in_project(path) {
            return None;
        }
        let relative = self.relative_path(path);
        let mut segments = relative.split('/');
        let first = segments.next()?;
        // A bare file name has no module.
        segments.next()?;
        Some(first.to_string())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Every registered resource, sorted by key.
    pub fn resources(&self) -> Vec<Resource> {
        let mut all: Vec<Resource> = self.resources.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    fn root(&self) -> Option<String> {
        self.config
            .project_root
            .as_deref()
            .map(normalize_path)
            .filter(|r| !r.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(config: CatalogConfig) -> Catalog {
        Catalog::with_default_classifier(config).unwrap()
    }

    fn catalog() -> Catalog {
        catalog_with(CatalogConfig::default())
    }

    #[test]
    fn register_is_idempotent() {
        let c = catalog();
        let first = c.register("tags/Pump.json", ResourceType::TagConfig).unwrap();
        let second = c.register("./tags//Pump.json", ResourceType::TagConfig).unwrap();
        assert_eq!(first, second);
        assert_eq!(c.len(), 1);
        assert!(first.current_fingerprint.is_none());
    }

    #[test]
    fn lookup_of_unknown_path_is_not_found() {
        let c = catalog();
        assert!(matches!(
            c.lookup("views/Nope.json"),
            Err(ChangeGraphError::NotFound(_))
        ));
    }

    #[test]
    fn criticality_precedence() {
        let mut config = CatalogConfig::default();
        config
            .criticality_overrides
            .insert("tags/plant/**".to_string(), Criticality::Critical);
        let c = catalog_with(config);

        // Explicit override beats the type default.
        let pump = c.register("tags/plant/Pump.json", ResourceType::TagConfig).unwrap();
        assert_eq!(pump.criticality, Criticality::Critical);

        // Type default.
        let tag = c.register("tags/misc/Spare.json", ResourceType::TagConfig).unwrap();
        assert_eq!(tag.criticality, Criticality::High);

        // Keyword escalation only applies without a type default.
        let gw = c.register("misc/gateway-notes.txt", ResourceType::Other).unwrap();
        assert_eq!(gw.criticality, Criticality::High);

        let plain = c.register("misc/notes.txt", ResourceType::Other).unwrap();
        assert_eq!(plain.criticality, Criticality::Medium);
        assert_eq!(c.classify_criticality(&plain), Criticality::Medium);
    }

    #[test]
    fn classifier_asserted_level_sits_below_overrides() {
        let c = catalog();
        let level = c.criticality_for("views/Main.json", &ResourceType::ViewDefinition, Some(Criticality::Low));
        assert_eq!(level, Criticality::Low);
    }

    #[test]
    fn custom_types_use_registry_defaults() {
        let c = catalog();
        let report = c.registry().register("Report", Criticality::Low);
        let r = c.register("reports/daily.rpt", report.clone()).unwrap();
        assert_eq!(r.resource_type, ResourceType::Custom("report".into()));
        assert_eq!(r.criticality, Criticality::Low);
        assert_eq!(r.key.as_str(), "report:reports/daily.rpt");
    }

    #[test]
    fn unclassifiable_paths_fall_back_to_other() {
        let c = catalog();
        let r = c.register_classified("README.md").unwrap();
        assert_eq!(r.resource_type, ResourceType::Other);
        let v = c.register_classified("views/Main.json").unwrap();
        assert_eq!(v.resource_type, ResourceType::ViewDefinition);
        assert_eq!(v.module.as_deref(), Some("views"));
    }

    #[test]
    fn rename_keeps_key_and_moves_path() {
        let c = catalog();
        let original = c.register("views/Old.json", ResourceType::ViewDefinition).unwrap();
        let renamed = c.rename("views/Old.json", "views/New.json").unwrap();

        assert_eq!(renamed.key, original.key);
        assert_eq!(renamed.path, "views/New.json");
        assert_eq!(renamed.aliases, vec!["views/Old.json".to_string()]);
        assert_eq!(c.lookup("views/New.json").unwrap().key, original.key);
        assert!(c.lookup("views/Old.json").is_err());
    }

    #[test]
    fn rename_onto_another_resource_is_rejected() {
        let c = catalog();
        c.register("views/A.json", ResourceType::ViewDefinition).unwrap();
        c.register("views/B.json", ResourceType::ViewDefinition).unwrap();
        assert!(matches!(
            c.rename("views/A.json", "views/B.json"),
            Err(ChangeGraphError::Validation(_))
        ));
    }

    #[test]
    fn project_root_scopes_modules_and_location() {
        let config = CatalogConfig {
            project_root: Some("/srv/project".to_string()),
            ..CatalogConfig::default()
        };
        let c = catalog_with(config);
        assert!(c.is_in_project("/srv/project/views/Main.json"));
        assert!(!c.is_in_project("/etc/shared/tags.json"));
        assert_eq!(c.module_of("/srv/project/views/Main.json").as_deref(), Some("views"));
        assert_eq!(c.module_of("/srv/project/top.json"), None);

        let v = c.register_classified("/srv/project/views/Main.json").unwrap();
        assert_eq!(v.resource_type, ResourceType::ViewDefinition);
    }

    #[test]
    fn sibling_directory_sharing_the_root_prefix_is_outside() {
        let mut overrides = std::collections::BTreeMap::new();
        overrides.insert("tags/**".to_string(), Criticality::Critical);
        let c = catalog_with(CatalogConfig {
            project_root: Some("/srv/app".to_string()),
            criticality_overrides: overrides,
            ..CatalogConfig::default()
        });

        let path = "/srv/apptags/Pump.json";
        assert!(!c.is_in_project(path));
        assert_eq!(c.relative_path(path), path);
        assert_eq!(c.relative_path("/srv/app/tags/Pump.json"), "tags/Pump.json");
        assert_eq!(c.relative_path("/srv/app"), "");

        let outside = c.register_classified(path).unwrap();
        assert_eq!(outside.resource_type, ResourceType::Other);
        assert_ne!(outside.criticality, Criticality::Critical);

        let inside = c.register_classified("/srv/app/tags/Pump.json").unwrap();
        assert_eq!(inside.resource_type, ResourceType::TagConfig);
        assert_eq!(inside.criticality, Criticality::Critical);
    }

    #[test]
    fn empty_path_is_invalid() {
        let c = catalog();
        assert!(matches!(
            c.register("  ", ResourceType::Other),
            Err(ChangeGraphError::Validation(_))
        ));
    }
}

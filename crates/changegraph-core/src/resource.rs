use crate::{Criticality, Fingerprint, ResourceKey, ResourceType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked project resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    /// Current (latest) path; earlier paths are kept in `aliases`.
    pub path: String,
    pub resource_type: ResourceType,
    pub module: Option<String>,
    pub display_name: Option<String>,
    pub criticality: Criticality,
    pub current_fingerprint: Option<Fingerprint>,
    pub removed: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(path: &str, resource_type: ResourceType, criticality: Criticality) -> Self {
        let now = Utc::now();
        let path = crate::normalize_path(path);
        Self {
            key: ResourceKey::derive(&path, &resource_type),
            path,
            resource_type,
            module: None,
            display_name: None,
            criticality,
            current_fingerprint: None,
            removed: false,
            aliases: Vec::new(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_module(mut self, module: Option<String>) -> Self {
        self.module = module;
        self
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    /// File name without extension, used when no display name was classified.
    pub fn logical_name(&self) -> &str {
        if let Some(name) = &self.display_name {
            return name.as_str();
        }
        let file = self.path.rsplit('/').next().unwrap_or(self.path.as_str());
        match file.rfind('.') {
            Some(idx) if idx > 0 => &file[..idx],
            _ => file,
        }
    }
}

/// Result of the host-supplied classifier for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub resource_type: ResourceType,
    /// Classifier-asserted criticality; `None` defers to the catalog rules.
    pub criticality: Option<Criticality>,
    pub module: Option<String>,
    pub display_name: Option<String>,
}

impl Classification {
    pub fn of_type(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            criticality: None,
            module: None,
            display_name: None,
        }
    }

    /// The mandatory fallback used when classification fails.
    pub fn other() -> Self {
        Self::of_type(ResourceType::Other)
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = Some(criticality);
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }
}

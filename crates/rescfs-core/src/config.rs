//! Resource tree configuration files.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ResourceResult;
use crate::properties::{ResourceProperties, ResourceStatus, ResourceType};
use crate::telemetry::LogConfig;

/// A child edge as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildConfig {
    /// Child resource name.
    pub name: String,
    /// Parent-context tag, e.g. `cache` or `archive`.
    #[serde(default)]
    pub context: String,
}

/// One resource definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unique resource name.
    pub name: String,
    /// Plugin type.
    #[serde(rename = "type")]
    pub kind: ResourceType,
    /// Host serving the resource.
    #[serde(default)]
    pub host: String,
    /// Vault directory for leaves.
    #[serde(default)]
    pub vault_path: String,
    /// Availability.
    #[serde(default)]
    pub status: ResourceStatus,
    /// KVP context string.
    #[serde(default)]
    pub context: String,
    /// Children in visiting order.
    #[serde(default)]
    pub children: Vec<ChildConfig>,
}

impl ResourceConfig {
    /// Properties for this resource, with its context string parsed.
    pub fn properties(&self, parent: Option<&str>) -> ResourceResult<ResourceProperties> {
        let mut properties = ResourceProperties::on_host(self.host.clone())
            .with_vault(self.vault_path.clone())
            .with_status(self.status)
            .with_context(&self.context)?;
        if let Some(parent) = parent {
            properties = properties.with_parent(parent);
        }
        Ok(properties)
    }
}

/// Defaults applied to every request context built by the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveDefaults {
    /// Rule-result KVP string, e.g. `stage_to_cache_policy=prefer_cache;repl_limit=100`.
    pub rule_results: String,
}

/// The whole resource tree plus process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Host name of this server; leaves on it vote higher.
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Request defaults.
    #[serde(default)]
    pub defaults: ResolveDefaults,
    /// Resource definitions in any order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

fn default_local_host() -> String {
    String::from("localhost")
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            local_host: default_local_host(),
            log: LogConfig::default(),
            defaults: ResolveDefaults::default(),
            resources: Vec::new(),
        }
    }
}

impl TreeConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Parses TOML text.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Parses JSON text.
    pub fn from_json_str(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// The definition named `name`.
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cask_metrics::{QuotaService, SoftQuotaConfig};

use crate::directories::{ApplicationDirectories, BLOBS_DIRECTORY};
use crate::error::ConfigError;
use crate::location::LayoutKind;

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_COLLISION_RETRIES: u32 = 8;
/// Node id used when none is configured.
pub const DEFAULT_NODE_ID: &str = "local";

/// Configuration of one file blob store.
///
/// ```toml
/// name = "default"
/// path = "default"          # relative paths live under <work>/blobs
/// layout = "volume-chapter" # or "date-based"
/// flush_interval_secs = 2
///
/// [soft_quota]
/// type = "space-used"
/// limit = 1073741824
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub name: String,
    /// Root directory; relative paths resolve under the blobs work directory.
    pub path: PathBuf,
    pub layout: LayoutKind,
    /// Node id naming the metrics file. Defaults to [`DEFAULT_NODE_ID`].
    pub node_id: Option<String>,
    pub flush_interval_secs: u64,
    /// fsync the metadata journal after every write.
    pub sync_metadata: bool,
    pub soft_quota: Option<SoftQuotaConfig>,
    pub collision_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            path: PathBuf::from("default"),
            layout: LayoutKind::default(),
            node_id: None,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            sync_metadata: false,
            soft_quota: None,
            collision_retries: DEFAULT_COLLISION_RETRIES,
        }
    }
}

impl StoreConfig {
    /// A store named `name` rooted at `path`, everything else defaulted.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn node_id(&self) -> &str {
        self.node_id.as_deref().unwrap_or(DEFAULT_NODE_ID)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Checks that need no other stores.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath(self.name.clone()));
        }
        if self.path.components().any(|c| c == Component::ParentDir) {
            return Err(ConfigError::PathTraversal(self.name.clone()));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::FlushInterval {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Absolute root of the store.
    pub fn resolve_path(&self, dirs: &dyn ApplicationDirectories) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            dirs.work_directory(BLOBS_DIRECTORY).join(&self.path)
        }
    }
}

/// Top-level configuration file: a work directory and any number of stores.
///
/// ```toml
/// work_dir = "/var/lib/cask"
///
/// [[store]]
/// name = "default"
/// path = "default"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaskConfig {
    pub work_dir: Option<PathBuf>,
    #[serde(rename = "store")]
    pub stores: Vec<StoreConfig>,
}

impl CaskConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn store(&self, name: &str) -> Option<&StoreConfig> {
        self.stores.iter().find(|s| s.name == name)
    }
}

/// Validate a set of stores before any of them is activated.
///
/// Rejects per-store errors, duplicate names, two stores sharing a root, a
/// root nested inside another, and soft quotas `quota` refuses.
pub fn validate_configs(
    configs: &[StoreConfig],
    dirs: &dyn ApplicationDirectories,
    quota: &dyn QuotaService,
) -> Result<(), ConfigError> {
    let mut names: HashSet<&str> = HashSet::new();
    let mut roots: Vec<(PathBuf, &str)> = Vec::with_capacity(configs.len());

    for config in configs {
        config.validate()?;
        if !names.insert(config.name.as_str()) {
            return Err(ConfigError::DuplicateName(config.name.clone()));
        }
        if let Some(soft) = &config.soft_quota {
            quota
                .validate_soft_quota_config(soft)
                .map_err(|source| ConfigError::Quota {
                    name: config.name.clone(),
                    source,
                })?;
        }

        let root = config.resolve_path(dirs);
        for (other, other_name) in &roots {
            if *other == root {
                return Err(ConfigError::DuplicatePath {
                    path: root,
                    first: other_name.to_string(),
                    second: config.name.clone(),
                });
            }
            if root.starts_with(other) {
                return Err(ConfigError::NestedPath {
                    outer: other.clone(),
                    inner: root,
                    first: other_name.to_string(),
                    second: config.name.clone(),
                });
            }
            if other.starts_with(&root) {
                return Err(ConfigError::NestedPath {
                    outer: root,
                    inner: other.clone(),
                    first: config.name.clone(),
                    second: other_name.to_string(),
                });
            }
        }
        roots.push((root, config.name.as_str()));
    }
    Ok(())
}

use std::path::{Path, PathBuf};

use sandbox::{SandboxError, VmConfig};
use serde::{Deserialize, Serialize};

/// Where template state lives when no path is configured.
pub const DEFAULT_TEMPLATE_PATH: &str = "/run/vc/vm/template";

/// VM factory settings: which strategy backs the factory and how it is pooled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Restore base VMs from a paused template VM.
    #[serde(default)]
    pub template: bool,
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,
    /// Back the template directory with a tmpfs mount (needs `CAP_SYS_ADMIN`).
    #[serde(default = "default_true")]
    pub template_tmpfs: bool,

    /// Fetch base VMs from a remote cache server (when `cache` is 0) or
    /// run as the pool behind one (when `cache` > 0).
    #[serde(default)]
    pub vm_cache: bool,
    /// Number of ready VMs kept in the local pool. 0 disables pooling.
    #[serde(default)]
    pub cache: u32,
    /// Unix socket of the remote cache server.
    #[serde(default)]
    pub vm_cache_endpoint: PathBuf,

    pub vm_config: VmConfig,
}

fn default_template_path() -> PathBuf {
    PathBuf::from(DEFAULT_TEMPLATE_PATH)
}

fn default_true() -> bool {
    true
}

impl FactoryConfig {
    pub fn new(vm_config: VmConfig) -> Self {
        Self {
            template: false,
            template_path: default_template_path(),
            template_tmpfs: true,
            vm_cache: false,
            cache: 0,
            vm_cache_endpoint: PathBuf::new(),
            vm_config,
        }
    }

    /// Whether this config selects the remote cache client as the backing.
    pub(crate) fn uses_remote_cache(&self) -> bool {
        !self.template && self.vm_cache && self.cache == 0
    }

    /// Check option combinations that cannot work regardless of `fetch_only`.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.uses_remote_cache() && self.vm_cache_endpoint.as_os_str().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "vm cache enabled without an endpoint".into(),
            ));
        }
        if self.template && self.template_path.as_os_str().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "template enabled without a template path".into(),
            ));
        }
        Ok(())
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        if self.template_path.is_relative() {
            self.template_path = base.join(&self.template_path);
        }
        if !self.vm_cache_endpoint.as_os_str().is_empty() && self.vm_cache_endpoint.is_relative() {
            self.vm_cache_endpoint = base.join(&self.vm_cache_endpoint);
        }
    }
}

/// Load and validate a factory config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> Result<FactoryConfig, SandboxError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SandboxError::InvalidConfig(format!("read {}: {e}", path.display())))?;
    let mut config: FactoryConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| SandboxError::InvalidConfig(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

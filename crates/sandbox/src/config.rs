use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_MEMORY_MIB: u32 = 2048;
pub const DEFAULT_MSIZE_9P: u32 = 8192;
pub const DEFAULT_BLOCK_DEVICE_DRIVER: &str = "virtio-scsi";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HypervisorType {
    Firecracker,
    Qemu,
    CloudHypervisor,
    Acrn,
    Mock,
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firecracker => f.write_str("firecracker"),
            Self::Qemu => f.write_str("qemu"),
            Self::CloudHypervisor => f.write_str("cloud-hypervisor"),
            Self::Acrn => f.write_str("acrn"),
            Self::Mock => f.write_str("mock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    Kata,
    Noop,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kata => f.write_str("kata"),
            Self::Noop => f.write_str("noop"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyType {
    Noop,
    Kata,
    KataBuiltin,
    NoProxy,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("noop"),
            Self::Kata => f.write_str("kata"),
            Self::KataBuiltin => f.write_str("kata-builtin"),
            Self::NoProxy => f.write_str("no-proxy"),
        }
    }
}

/// Hypervisor settings for one VM.
///
/// `num_vcpus`, `memory_size`, the two template boot flags and the two
/// template state paths are *elastic*: a pooled base VM may legitimately
/// differ from a request in these, and the factory reconciles them after
/// acquisition. Every other field is fixed at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub hypervisor_path: PathBuf,
    pub kernel_path: PathBuf,
    pub image_path: PathBuf,
    pub initrd_path: PathBuf,
    pub kernel_params: Vec<String>,
    pub machine_type: String,
    pub default_max_vcpus: u32,
    pub block_device_driver: String,
    pub entropy_source: PathBuf,
    pub msize_9p: u32,

    pub num_vcpus: u32,
    /// Guest memory in MiB.
    pub memory_size: u32,
    pub boot_to_be_template: bool,
    pub boot_from_template: bool,
    pub memory_path: PathBuf,
    pub devices_state_path: PathBuf,
}

impl HypervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if is_unset(&self.kernel_path) {
            return Err(SandboxError::InvalidConfig("missing kernel path".into()));
        }

        match (is_unset(&self.image_path), is_unset(&self.initrd_path)) {
            (true, true) => {
                return Err(SandboxError::InvalidConfig(
                    "missing image and initrd path".into(),
                ));
            }
            (false, false) => {
                return Err(SandboxError::InvalidConfig(
                    "image and initrd path cannot be both set".into(),
                ));
            }
            _ => {}
        }

        self.validate_template()
    }

    fn validate_template(&self) -> Result<()> {
        if self.boot_to_be_template && self.boot_from_template {
            return Err(SandboxError::InvalidConfig(
                "cannot set both 'to be' and 'from' vm template".into(),
            ));
        }

        if self.boot_to_be_template || self.boot_from_template {
            if is_unset(&self.memory_path) {
                return Err(SandboxError::InvalidConfig(
                    "missing memory path for vm template".into(),
                ));
            }
            if self.boot_from_template && is_unset(&self.devices_state_path) {
                return Err(SandboxError::InvalidConfig(
                    "missing devices state path to load from vm template".into(),
                ));
            }
        }

        Ok(())
    }

    /// Fill zero-valued sizing fields with runtime defaults.
    pub fn apply_defaults(&mut self) {
        if self.default_max_vcpus == 0 {
            self.default_max_vcpus = std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(DEFAULT_VCPUS);
        }
        if self.num_vcpus == 0 {
            self.num_vcpus = DEFAULT_VCPUS;
        }
        if self.memory_size == 0 {
            self.memory_size = DEFAULT_MEMORY_MIB;
        }
        if self.msize_9p == 0 {
            self.msize_9p = DEFAULT_MSIZE_9P;
        }
        if self.block_device_driver.is_empty() {
            self.block_device_driver = DEFAULT_BLOCK_DEVICE_DRIVER.to_string();
        }
    }
}

fn is_unset(path: &std::path::Path) -> bool {
    path.as_os_str().is_empty()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub long_live_conn: bool,
    pub use_vsock: bool,
    pub debug: bool,
    pub trace: bool,
    pub kernel_modules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub path: PathBuf,
    pub debug: bool,
}

/// Everything a new sandbox VM needs: hypervisor, agent and proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub hypervisor_type: HypervisorType,
    #[serde(default)]
    pub hypervisor_config: HypervisorConfig,
    #[serde(default)]
    pub agent_type: Option<AgentType>,
    #[serde(default)]
    pub agent_config: AgentConfig,
    #[serde(default)]
    pub proxy_type: Option<ProxyType>,
    #[serde(default)]
    pub proxy_config: ProxyConfig,
}

impl VmConfig {
    pub fn new(hypervisor_type: HypervisorType, hypervisor_config: HypervisorConfig) -> Self {
        Self {
            hypervisor_type,
            hypervisor_config,
            agent_type: None,
            agent_config: AgentConfig::default(),
            proxy_type: None,
            proxy_config: ProxyConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.hypervisor_config.validate()
    }
}

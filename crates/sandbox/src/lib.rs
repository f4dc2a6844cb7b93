mod config;
mod error;
mod factory;
mod types;
mod vm;

pub use config::{
    AgentConfig, AgentType, DEFAULT_BLOCK_DEVICE_DRIVER, DEFAULT_MEMORY_MIB, DEFAULT_MSIZE_9P,
    DEFAULT_VCPUS, HypervisorConfig, HypervisorType, ProxyConfig, ProxyType, VmConfig,
};
pub use error::{BringUpStep, Result, SandboxError};
pub use factory::{Factory, FactoryBase};
pub use types::VmInfo;
pub use vm::{Vm, VmLauncher};

use async_trait::async_trait;

use crate::config::VmConfig;
use crate::error::Result;
use crate::types::VmInfo;

/// Handle to one sandbox virtual machine.
///
/// The factory only drives the lifecycle through these primitives; process
/// supervision, the guest agent and device hotplug live behind them.
#[async_trait]
pub trait Vm: Send + Sync {
    // -- identity --
    fn id(&self) -> &str;
    fn info(&self) -> VmInfo;

    // -- lifecycle --
    async fn pause(&mut self) -> Result<()>;
    /// Persist device state (used when booting a template VM).
    async fn save(&mut self) -> Result<()>;
    async fn resume(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    /// Drop host-side connections without stopping the guest.
    async fn disconnect(&mut self) -> Result<()>;

    // -- guest state --
    async fn reseed_rng(&mut self) -> Result<()>;
    async fn sync_time(&mut self) -> Result<()>;

    // -- resources --
    async fn add_cpus(&mut self, num: u32) -> Result<()>;
    async fn add_memory(&mut self, mib: u32) -> Result<()>;
    /// Ask the guest to online hot-added CPUs and memory.
    async fn online_cpu_memory(&mut self) -> Result<()>;
}

/// Creates VM handles. Implemented by a hypervisor backend.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    /// Boot a new VM from `config`.
    async fn launch(&self, config: &VmConfig) -> Result<Box<dyn Vm>>;
    /// Take over a VM that another process booted and described with `info`.
    async fn attach(&self, info: &VmInfo, config: &VmConfig) -> Result<Box<dyn Vm>>;
}

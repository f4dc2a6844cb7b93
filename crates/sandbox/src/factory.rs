use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::VmConfig;
use crate::error::Result;
use crate::types::VmInfo;
use crate::vm::Vm;

/// A source of paused base VMs: direct boot, template restore, a local pool,
/// or a remote cache.
///
/// All methods take `&self` and must be safe to call concurrently.
#[async_trait]
pub trait FactoryBase: Send + Sync {
    /// Configuration the base VMs are provisioned with.
    fn config(&self) -> &VmConfig;
    /// Return a paused base VM. Ownership moves to the caller.
    ///
    /// A backing that observes `cancel` after it obtained a VM stops that VM
    /// before returning [`SandboxError::Cancelled`](crate::SandboxError::Cancelled).
    async fn get_base_vm(
        &self,
        cancel: &CancellationToken,
        config: &VmConfig,
    ) -> Result<Box<dyn Vm>>;
    /// Release everything the backing holds. Calling it twice is a no-op.
    async fn close(&self);
    /// VMs currently held ready by this backing.
    async fn status(&self) -> Vec<VmInfo> {
        Vec::new()
    }
}

/// Hands out running, resized VMs built from a [`FactoryBase`].
#[async_trait]
pub trait Factory: FactoryBase {
    /// Return a running VM matching `config`.
    ///
    /// Every blocking step observes `cancel`; a cancelled call returns
    /// [`SandboxError::Cancelled`](crate::SandboxError::Cancelled) after
    /// stopping any VM it had already obtained.
    async fn get_vm(&self, cancel: &CancellationToken, config: &VmConfig) -> Result<Box<dyn Vm>>;
}

use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{FactoryBase, Result, Vm, VmConfig, VmLauncher};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::factory::cancellable;

/// Boots every base VM from scratch. No pooling, nothing to release.
///
/// VMs are sized from the config given at construction; only the proxy
/// settings come from each request, so growth to the requested size stays
/// with the caller.
pub struct Direct {
    config: VmConfig,
    launcher: Arc<dyn VmLauncher>,
}

impl Direct {
    pub fn new(launcher: Arc<dyn VmLauncher>, config: VmConfig) -> Self {
        Self { config, launcher }
    }
}

#[async_trait]
impl FactoryBase for Direct {
    fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Boot a VM and pause it. A VM that fails or is cancelled while
    /// pausing is stopped.
    async fn get_base_vm(
        &self,
        cancel: &CancellationToken,
        request: &VmConfig,
    ) -> Result<Box<dyn Vm>> {
        let mut config = self.config.clone();
        config.hypervisor_config.boot_to_be_template = false;
        config.proxy_type = request.proxy_type;
        config.proxy_config = request.proxy_config.clone();

        let mut vm = cancellable(cancel, self.launcher.launch(&config)).await?;

        if let Err(e) = cancellable(cancel, vm.pause()).await {
            if let Err(stop_err) = vm.stop().await {
                warn!(id = %vm.id(), error = %stop_err, "failed to stop vm after pause failure");
            }
            return Err(e);
        }

        info!(id = %vm.id(), "direct vm booted");
        Ok(vm)
    }

    async fn close(&self) {}
}

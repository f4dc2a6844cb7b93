use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{
    AgentType, BringUpStep, Factory, FactoryBase, HypervisorType, ProxyConfig, Result,
    SandboxError, Vm, VmConfig, VmInfo, VmLauncher,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, error, info, info_span, warn};

use crate::cache::VmCache;
use crate::config::FactoryConfig;
use crate::direct::Direct;
use crate::remote::RemoteCache;
use crate::template::{AGENT_SETTLE_TIME, Template, TemplateOptions};

// ---------------------------------------------------------------------------
// Compatibility check
// ---------------------------------------------------------------------------

/// Why a request cannot be served from the factory's base VMs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigMismatch {
    #[error("hypervisor type differs: requested {requested}, base {base}")]
    HypervisorType {
        requested: HypervisorType,
        base: HypervisorType,
    },

    #[error("agent type differs: requested {requested:?}, base {base:?}")]
    AgentType {
        requested: Option<AgentType>,
        base: Option<AgentType>,
    },

    #[error("vm config differs beyond sizing and proxy settings")]
    Config,
}

/// Copy of `config` with the per-request fields cleared: vCPU and memory
/// sizing, template boot flags and paths, and the proxy.
pub(crate) fn without_elastic_fields(config: &VmConfig) -> VmConfig {
    let mut config = config.clone();
    let hv = &mut config.hypervisor_config;
    hv.num_vcpus = 0;
    hv.memory_size = 0;
    hv.boot_to_be_template = false;
    hv.boot_from_template = false;
    hv.memory_path = PathBuf::new();
    hv.devices_state_path = PathBuf::new();
    config.proxy_type = None;
    config.proxy_config = ProxyConfig::default();
    config
}

/// Check whether a VM built from `base` can be grown into `request`.
pub fn check_vm_config(
    request: &VmConfig,
    base: &VmConfig,
) -> std::result::Result<(), ConfigMismatch> {
    if request.hypervisor_type != base.hypervisor_type {
        return Err(ConfigMismatch::HypervisorType {
            requested: request.hypervisor_type,
            base: base.hypervisor_type,
        });
    }
    if request.agent_type != base.agent_type {
        return Err(ConfigMismatch::AgentType {
            requested: request.agent_type,
            base: base.agent_type,
        });
    }
    if without_elastic_fields(request) != without_elastic_fields(base) {
        return Err(ConfigMismatch::Config);
    }
    Ok(())
}

/// Defaulted copy of a `get_vm` request, or why it cannot be served.
fn validate_new_vm_config(config: &VmConfig) -> Result<VmConfig> {
    if config.agent_type.is_none() {
        return Err(SandboxError::InvalidConfig("missing agent type".into()));
    }
    if config.proxy_type.is_none() {
        return Err(SandboxError::InvalidConfig("missing proxy type".into()));
    }
    let mut config = config.clone();
    config.hypervisor_config.apply_defaults();
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        result = fut => result,
    }
}

/// Run one bring-up step, tagging its failure with `step`.
async fn run_step(
    cancel: &CancellationToken,
    step: BringUpStep,
    fut: impl Future<Output = Result<()>>,
) -> Result<()> {
    let span = debug_span!("bring_up", %step);
    match cancellable(cancel, fut).instrument(span).await {
        Ok(()) => Ok(()),
        Err(SandboxError::Cancelled) => Err(SandboxError::Cancelled),
        Err(e) => Err(SandboxError::BringUp {
            step,
            source: Box::new(e),
        }),
    }
}

// ---------------------------------------------------------------------------
// VmFactory
// ---------------------------------------------------------------------------

/// Hands out ready sandbox VMs from one configured backing.
///
/// The backing is chosen once at construction (template, remote cache or
/// direct boot, optionally behind a local pool). [`get_vm`](Factory::get_vm)
/// takes a paused base VM from it and turns it into a running VM sized for
/// the request, or boots a fresh VM when the request cannot reuse base VMs.
pub struct VmFactory {
    base: Box<dyn FactoryBase>,
    launcher: Arc<dyn VmLauncher>,
    span: Span,
}

impl VmFactory {
    /// Build a factory for `config`. With `fetch_only` the factory attaches
    /// to an existing template instead of creating one.
    ///
    /// Log output is scoped to a `factory` span under the caller's current
    /// span.
    pub async fn new(
        mut config: FactoryConfig,
        launcher: Arc<dyn VmLauncher>,
        fetch_only: bool,
    ) -> Result<Self> {
        let span = info_span!("factory", subsystem = "factory");
        let base = Self::select_base(&mut config, &launcher, fetch_only)
            .instrument(span.clone())
            .await?;

        Ok(Self {
            base,
            launcher,
            span,
        })
    }

    async fn select_base(
        config: &mut FactoryConfig,
        launcher: &Arc<dyn VmLauncher>,
        fetch_only: bool,
    ) -> Result<Box<dyn FactoryBase>> {
        config.vm_config.hypervisor_config.apply_defaults();
        config.vm_config.validate()?;
        config.validate()?;

        if fetch_only && config.cache > 0 {
            error!(cache = config.cache, "cache factory does not support fetch");
            return Err(SandboxError::InvalidConfig(
                "cache factory does not support fetch".into(),
            ));
        }

        let vm_config = config.vm_config.clone();
        let base: Box<dyn FactoryBase> = if config.template {
            let path = config.template_path.clone();
            let template = if fetch_only {
                Template::fetch(Arc::clone(launcher), vm_config, path).await
            } else {
                let options = TemplateOptions {
                    path,
                    tmpfs: config.template_tmpfs,
                    agent_settle: AGENT_SETTLE_TIME,
                };
                Template::new(Arc::clone(launcher), vm_config, options).await
            };
            let template =
                template.inspect_err(|e| error!(error = %e, "template backing failed"))?;
            info!(
                fetch_only,
                path = %config.template_path.display(),
                "using template backing"
            );
            Box::new(template)
        } else if config.uses_remote_cache() {
            let endpoint = config.vm_cache_endpoint.clone();
            let remote = RemoteCache::connect(Arc::clone(launcher), endpoint)
                .await
                .inspect_err(|e| error!(error = %e, "remote cache backing failed"))?;
            info!(endpoint = %config.vm_cache_endpoint.display(), "using remote cache backing");
            Box::new(remote)
        } else {
            info!("using direct backing");
            Box::new(Direct::new(Arc::clone(launcher), vm_config))
        };

        if config.cache > 0 {
            info!(size = config.cache, "wrapping backing in vm pool");
            return Ok(Box::new(VmCache::new(config.cache as usize, base)));
        }
        Ok(base)
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
        request: &VmConfig,
    ) -> Result<Box<dyn Vm>> {
        let request = validate_new_vm_config(request)?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        // Backings stop any VM they obtained before reporting cancellation.
        if let Err(mismatch) = check_vm_config(&request, self.base.config()) {
            info!(reason = %mismatch, "request incompatible with base vms, booting directly");
            let direct = Direct::new(Arc::clone(&self.launcher), request.clone());
            return direct.get_base_vm(cancel, &request).await;
        }

        let mut vm = self
            .base
            .get_base_vm(cancel, &request)
            .await
            .inspect_err(|e| error!(error = %e, "failed to get base vm"))?;

        if let Err(e) = self.bring_up(cancel, vm.as_mut(), &request).await {
            error!(id = %vm.id(), error = %e, "vm bring-up failed, stopping vm");
            if let Err(stop_err) = vm.stop().await {
                warn!(id = %vm.id(), error = %stop_err, "failed to stop vm after bring-up failure");
            }
            return Err(e);
        }

        info!(id = %vm.id(), "vm ready");
        Ok(vm)
    }

    /// Resume a base VM, refresh its entropy and clock, then grow it to
    /// the requested size.
    async fn bring_up(
        &self,
        cancel: &CancellationToken,
        vm: &mut dyn Vm,
        request: &VmConfig,
    ) -> Result<()> {
        run_step(cancel, BringUpStep::Resume, vm.resume()).await?;
        run_step(cancel, BringUpStep::ReseedRng, vm.reseed_rng()).await?;
        run_step(cancel, BringUpStep::SyncTime, vm.sync_time()).await?;

        let base = &self.base.config().hypervisor_config;
        let wanted = &request.hypervisor_config;
        let mut grown = false;

        if wanted.num_vcpus > base.num_vcpus {
            let delta = wanted.num_vcpus - base.num_vcpus;
            debug!(delta, "hot-adding vcpus");
            run_step(cancel, BringUpStep::AddCpus, vm.add_cpus(delta)).await?;
            grown = true;
        }
        if wanted.memory_size > base.memory_size {
            let delta = wanted.memory_size - base.memory_size;
            debug!(delta_mib = delta, "hot-adding memory");
            run_step(cancel, BringUpStep::AddMemory, vm.add_memory(delta)).await?;
            grown = true;
        }
        if grown {
            run_step(cancel, BringUpStep::OnlineCpuMemory, vm.online_cpu_memory()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FactoryBase for VmFactory {
    fn config(&self) -> &VmConfig {
        self.base.config()
    }

    /// The backing's raw, still paused VM.
    async fn get_base_vm(
        &self,
        cancel: &CancellationToken,
        config: &VmConfig,
    ) -> Result<Box<dyn Vm>> {
        let span = info_span!(parent: &self.span, "get_base_vm");
        self.base.get_base_vm(cancel, config).instrument(span).await
    }

    async fn close(&self) {
        self.base.close().instrument(self.span.clone()).await;
    }

    async fn status(&self) -> Vec<VmInfo> {
        self.base.status().await
    }
}

#[async_trait]
impl Factory for VmFactory {
    async fn get_vm(&self, cancel: &CancellationToken, config: &VmConfig) -> Result<Box<dyn Vm>> {
        let span = info_span!(parent: &self.span, "get_vm");
        self.acquire(cancel, config).instrument(span).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::MsFlags;
use sandbox::{FactoryBase, Result, SandboxError, Vm, VmConfig, VmLauncher};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::factory::cancellable;

/// Extra tmpfs space reserved for the saved device state.
const DEVICE_STATE_SIZE_MIB: u32 = 8;

/// How long to let the guest agent restart its listener after the host
/// disconnects from the template VM. Paid once per template so every VM
/// restored from it connects without waiting.
pub const AGENT_SETTLE_TIME: Duration = Duration::from_secs(2);

/// Files making up a VM template.
pub struct TemplatePaths {
    dir: PathBuf,
}

impl TemplatePaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shared guest memory image.
    pub fn memory(&self) -> PathBuf {
        self.dir.join("memory")
    }

    /// Saved device state.
    pub fn state(&self) -> PathBuf {
        self.dir.join("state")
    }
}

pub struct TemplateOptions {
    pub path: PathBuf,
    /// Mount a tmpfs on `path` before creating the template.
    pub tmpfs: bool,
    pub agent_settle: Duration,
}

/// Restores base VMs from a paused template VM whose memory and device
/// state were saved to disk.
pub struct Template {
    paths: TemplatePaths,
    config: VmConfig,
    launcher: Arc<dyn VmLauncher>,
    /// Created by this process (and torn down on close) rather than fetched.
    owned: bool,
    mounted: AtomicBool,
    closed: AtomicBool,
}

impl Template {
    /// Boot a template VM from `config` and save it under `options.path`.
    ///
    /// Fails if a template already exists there. On failure everything
    /// created so far is removed again.
    pub async fn new(
        launcher: Arc<dyn VmLauncher>,
        config: VmConfig,
        options: TemplateOptions,
    ) -> Result<Self> {
        let template = Self::with_paths(launcher, config, options.path, true);

        if template.exists().await {
            return Err(SandboxError::BackendNotAvailable(format!(
                "vm template already exists in {}",
                template.paths.dir().display()
            )));
        }

        if let Err(e) = template.prepare(options.tmpfs).await {
            template.teardown().await;
            return Err(e);
        }

        if let Err(e) = template.create_template_vm(options.agent_settle).await {
            template.teardown().await;
            return Err(e);
        }

        info!(dir = %template.paths.dir().display(), "vm template created");
        Ok(template)
    }

    /// Attach to a template another process already created.
    pub async fn fetch(
        launcher: Arc<dyn VmLauncher>,
        config: VmConfig,
        path: PathBuf,
    ) -> Result<Self> {
        let template = Self::with_paths(launcher, config, path, false);
        if !template.exists().await {
            return Err(SandboxError::BackendNotAvailable(format!(
                "no vm template found in {}",
                template.paths.dir().display()
            )));
        }
        info!(dir = %template.paths.dir().display(), "attached to vm template");
        Ok(template)
    }

    fn with_paths(
        launcher: Arc<dyn VmLauncher>,
        config: VmConfig,
        dir: PathBuf,
        owned: bool,
    ) -> Self {
        Self {
            paths: TemplatePaths::new(dir),
            config,
            launcher,
            owned,
            mounted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    async fn exists(&self) -> bool {
        let memory = tokio::fs::try_exists(self.paths.memory()).await;
        let state = tokio::fs::try_exists(self.paths.state()).await;
        matches!((memory, state), (Ok(true), Ok(true)))
    }

    async fn prepare(&self, tmpfs: bool) -> Result<()> {
        let dir = self.paths.dir();
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            SandboxError::BackendNotAvailable(format!("mkdir {}: {e}", dir.display()))
        })?;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| {
                SandboxError::BackendNotAvailable(format!("chmod {}: {e}", dir.display()))
            })?;

        if tmpfs {
            let size = self
                .config
                .hypervisor_config
                .memory_size
                .saturating_add(DEVICE_STATE_SIZE_MIB);
            let opts = format!("size={size}M");
            nix::mount::mount(
                Some("tmpfs"),
                dir,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(opts.as_str()),
            )
            .map_err(|e| {
                SandboxError::BackendNotAvailable(format!("mount tmpfs on {}: {e}", dir.display()))
            })?;
            self.mounted.store(true, Ordering::Release);
        }

        tokio::fs::File::create(self.paths.memory())
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("create memory file: {e}")))?;

        Ok(())
    }

    async fn create_template_vm(&self, agent_settle: Duration) -> Result<()> {
        let mut config = self.config.clone();
        config.hypervisor_config.boot_to_be_template = true;
        config.hypervisor_config.boot_from_template = false;
        config.hypervisor_config.memory_path = self.paths.memory();
        config.hypervisor_config.devices_state_path = self.paths.state();

        let mut vm = self.launcher.launch(&config).await?;
        let result = save_template_vm(vm.as_mut(), agent_settle).await;

        // The template VM is only needed for its saved state.
        if let Err(e) = vm.stop().await {
            warn!(id = %vm.id(), error = %e, "failed to stop template vm");
        }

        result
    }

    async fn teardown(&self) {
        let dir = self.paths.dir();
        if self.mounted.swap(false, Ordering::AcqRel)
            && let Err(e) = nix::mount::umount(dir)
        {
            warn!(dir = %dir.display(), error = %e, "failed to unmount template tmpfs");
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), error = %e, "failed to remove template dir");
        }
    }
}

async fn save_template_vm(vm: &mut dyn Vm, agent_settle: Duration) -> Result<()> {
    vm.disconnect().await?;
    tokio::time::sleep(agent_settle).await;
    vm.pause().await?;
    vm.save().await
}

#[async_trait]
impl FactoryBase for Template {
    fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Restore a VM from the template. Only the proxy settings are taken
    /// from the request; they are wired per VM.
    async fn get_base_vm(
        &self,
        cancel: &CancellationToken,
        request: &VmConfig,
    ) -> Result<Box<dyn Vm>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::Closed);
        }

        let mut config = self.config.clone();
        config.hypervisor_config.boot_to_be_template = false;
        config.hypervisor_config.boot_from_template = true;
        config.hypervisor_config.memory_path = self.paths.memory();
        config.hypervisor_config.devices_state_path = self.paths.state();
        config.proxy_type = request.proxy_type;
        config.proxy_config = request.proxy_config.clone();

        cancellable(cancel, self.launcher.launch(&config)).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) || !self.owned {
            return;
        }
        self.teardown().await;
        info!(dir = %self.paths.dir().display(), "vm template removed");
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{FactoryBase, Result, SandboxError, Vm, VmConfig, VmInfo};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Fill = JoinHandle<Result<Box<dyn Vm>>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn_fill(base: &Arc<dyn FactoryBase>, shutdown: &CancellationToken) -> Fill {
    let base = Arc::clone(base);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { base.get_base_vm(&shutdown, base.config()).await })
}

async fn stop_vm(mut vm: Box<dyn Vm>) {
    if let Err(e) = vm.stop().await {
        warn!(id = %vm.id(), error = %e, "failed to stop pooled vm");
    }
}

/// Wait for a fill nobody will take and stop the VM it produced.
async fn reap(fill: Fill) {
    match fill.await {
        Ok(Ok(vm)) => stop_vm(vm).await,
        Ok(Err(SandboxError::Cancelled)) => {}
        Ok(Err(e)) => debug!(error = %e, "abandoned vm pool fill failed"),
        Err(e) => error!(error = %e, "vm pool fill task panicked"),
    }
}

// ---------------------------------------------------------------------------
// VmCache
// ---------------------------------------------------------------------------

struct PoolState {
    active: bool,
    queue: VecDeque<Box<dyn Vm>>,
    /// In-flight fills. Spawned tasks only talk to the backing and return
    /// their VM through the handle; they never touch pool state.
    pending: VecDeque<Fill>,
    /// Fills taken out of `pending` by callers awaiting them unlocked.
    claimed: usize,
}

/// Bounded pool of ready base VMs in front of another [`FactoryBase`].
///
/// Keeps `size` VMs either ready in `queue` or being built in `pending`.
/// [`get_base_vm`](FactoryBase::get_base_vm) pops a ready VM first, then
/// claims the oldest in-flight fill and awaits it without holding the pool
/// lock, and boots on demand through the backing as a last resort. Every
/// acquisition tops the pool back up.
///
/// Pooled VMs are built from the backing's own config; the request passed
/// to `get_base_vm` is not consulted.
pub struct VmCache {
    base: Arc<dyn FactoryBase>,
    size: usize,
    /// Cancels in-flight fills on close.
    shutdown: CancellationToken,
    state: tokio::sync::Mutex<PoolState>,
}

impl VmCache {
    /// Wrap `base` in a pool of `size` VMs and start filling it in the
    /// background. Must be called from within a Tokio runtime.
    pub fn new(size: usize, base: Box<dyn FactoryBase>) -> Self {
        let base: Arc<dyn FactoryBase> = Arc::from(base);
        let shutdown = CancellationToken::new();
        let pending = (0..size).map(|_| spawn_fill(&base, &shutdown)).collect();
        info!(size, "vm pool filling");

        Self {
            base,
            size,
            shutdown,
            state: tokio::sync::Mutex::new(PoolState {
                active: true,
                queue: VecDeque::with_capacity(size),
                pending,
                claimed: 0,
            }),
        }
    }

    /// Move fills that already finished into the ready queue.
    async fn collect_finished(state: &mut PoolState) {
        let mut running = VecDeque::with_capacity(state.pending.len());
        while let Some(fill) = state.pending.pop_front() {
            if !fill.is_finished() {
                running.push_back(fill);
                continue;
            }
            match fill.await {
                Ok(Ok(vm)) => state.queue.push_back(vm),
                Ok(Err(e)) => error!(error = %e, "failed to fill vm pool"),
                Err(e) => error!(error = %e, "vm pool fill task panicked"),
            }
        }
        state.pending = running;
    }

    /// Spawn fills until ready, in-flight and claimed VMs reach the pool size.
    fn replenish(&self, state: &mut PoolState) {
        if !state.active {
            return;
        }
        let total = state.queue.len() + state.pending.len() + state.claimed;
        let needed = self.size.saturating_sub(total);
        for _ in 0..needed {
            state.pending.push_back(spawn_fill(&self.base, &self.shutdown));
        }
        if needed > 0 {
            debug!(needed, "spawned vm pool fill tasks");
        }
    }
}

#[async_trait]
impl FactoryBase for VmCache {
    fn config(&self) -> &VmConfig {
        self.base.config()
    }

    async fn get_base_vm(
        &self,
        cancel: &CancellationToken,
        _config: &VmConfig,
    ) -> Result<Box<dyn Vm>> {
        loop {
            let mut fill = {
                let mut state = self.state.lock().await;
                if !state.active {
                    return Err(SandboxError::Closed);
                }
                Self::collect_finished(&mut state).await;

                // Tier 1: ready queue.
                if let Some(vm) = state.queue.pop_front() {
                    info!(id = %vm.id(), remaining = state.queue.len(), "acquired vm from pool");
                    self.replenish(&mut state);
                    return Ok(vm);
                }

                // Tier 2: claim the oldest in-flight fill.
                match state.pending.pop_front() {
                    Some(fill) => {
                        state.claimed += 1;
                        fill
                    }
                    None => {
                        self.replenish(&mut state);
                        break;
                    }
                }
            };

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = &mut fill => Some(joined),
            };

            let mut state = self.state.lock().await;
            state.claimed = state.claimed.saturating_sub(1);
            match joined {
                None => {
                    if state.active {
                        state.pending.push_front(fill);
                    } else {
                        tokio::spawn(reap(fill));
                    }
                    return Err(SandboxError::Cancelled);
                }
                Some(Ok(Ok(vm))) => {
                    info!(id = %vm.id(), "acquired vm from pending fill");
                    self.replenish(&mut state);
                    return Ok(vm);
                }
                Some(Ok(Err(e))) => error!(error = %e, "failed to fill vm pool"),
                Some(Err(e)) => error!(error = %e, "vm pool fill task panicked"),
            }
        }

        // Tier 3: on demand, without holding the pool lock.
        info!("vm pool exhausted, booting base vm on demand");
        self.base.get_base_vm(cancel, self.base.config()).await
    }

    /// Stop every pooled VM, wind down in-flight fills and close the backing.
    async fn close(&self) {
        let (pending, queue) = {
            let mut state = self.state.lock().await;
            if !state.active {
                return;
            }
            state.active = false;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.queue),
            )
        };

        self.shutdown.cancel();
        for fill in pending {
            reap(fill).await;
        }

        info!(count = queue.len(), "stopping pooled vms");
        for vm in queue {
            stop_vm(vm).await;
        }

        self.base.close().await;
        info!("vm pool closed");
    }

    async fn status(&self) -> Vec<VmInfo> {
        let mut state = self.state.lock().await;
        Self::collect_finished(&mut state).await;
        state.queue.iter().map(|vm| vm.info()).collect()
    }
}

impl Drop for VmCache {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.active {
            self.shutdown.cancel();
            warn!(
                queued = state.queue.len(),
                pending = state.pending.len(),
                "VmCache dropped without calling close()"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Recording mock hypervisor backend for unit tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    AgentType, HypervisorConfig, HypervisorType, ProxyType, Result, SandboxError, Vm, VmConfig,
    VmInfo, VmLauncher,
};

/// A lifecycle call observed on a mock VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Pause,
    Save,
    Resume,
    Stop,
    Disconnect,
    ReseedRng,
    SyncTime,
    AddCpus(u32),
    AddMemory(u32),
    OnlineCpuMemory,
}

/// Lifecycle operation selector for failure/blocking injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Pause,
    Save,
    Resume,
    ReseedRng,
    SyncTime,
    AddCpus,
    AddMemory,
    OnlineCpuMemory,
}

#[derive(Clone)]
pub(crate) struct VmRecord {
    pub id: String,
    pub config: VmConfig,
    pub attached: bool,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl VmRecord {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[derive(Default)]
struct LauncherState {
    vms: Vec<VmRecord>,
    fail_launch: bool,
    fail_on: Option<Op>,
    block_on: Option<Op>,
}

/// Launcher that hands out [`MockVm`]s and remembers every one of them.
#[derive(Default)]
pub(crate) struct MockLauncher {
    state: Mutex<LauncherState>,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.state.lock().expect("state lock").fail_launch = fail;
    }

    /// Make `op` fail on every VM created afterwards.
    pub fn set_fail_on(&self, op: Option<Op>) {
        self.state.lock().expect("state lock").fail_on = op;
    }

    /// Make `op` never complete on every VM created afterwards.
    pub fn set_block_on(&self, op: Option<Op>) {
        self.state.lock().expect("state lock").block_on = op;
    }

    pub fn vms(&self) -> Vec<VmRecord> {
        self.state.lock().expect("state lock").vms.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.vms().iter().filter(|vm| !vm.attached).count()
    }

    pub fn record(&self, id: &str) -> VmRecord {
        self.vms()
            .into_iter()
            .find(|vm| vm.id == id)
            .expect("unknown vm id")
    }

    /// Wait until the VM `id` has seen exactly `expected`.
    pub async fn wait_for_calls(&self, id: &str, expected: &[Call]) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.record(id).calls() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if waited.is_err() {
            panic!("vm {id} saw {:?}, expected {expected:?}", self.record(id).calls());
        }
    }

    fn create(&self, id: String, config: &VmConfig, attached: bool) -> MockVm {
        let mut state = self.state.lock().expect("state lock");
        let calls = Arc::new(Mutex::new(Vec::new()));
        state.vms.push(VmRecord {
            id: id.clone(),
            config: config.clone(),
            attached,
            calls: Arc::clone(&calls),
        });
        MockVm {
            id,
            cpu: config.hypervisor_config.num_vcpus,
            memory_mib: config.hypervisor_config.memory_size,
            calls,
            fail_on: state.fail_on,
            block_on: state.block_on,
        }
    }
}

#[async_trait]
impl VmLauncher for MockLauncher {
    async fn launch(&self, config: &VmConfig) -> Result<Box<dyn Vm>> {
        if self.state.lock().expect("state lock").fail_launch {
            return Err(SandboxError::Vm("launch failed".into()));
        }
        let id = format!("mock-{}", uuid::Uuid::new_v4());
        Ok(Box::new(self.create(id, config, false)))
    }

    async fn attach(&self, info: &VmInfo, config: &VmConfig) -> Result<Box<dyn Vm>> {
        Ok(Box::new(self.create(info.id.clone(), config, true)))
    }
}

pub(crate) struct MockVm {
    id: String,
    cpu: u32,
    memory_mib: u32,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_on: Option<Op>,
    block_on: Option<Op>,
}

impl MockVm {
    async fn call(&mut self, op: Op, call: Call) -> Result<()> {
        self.calls.lock().expect("calls lock").push(call);
        if self.block_on == Some(op) {
            std::future::pending::<()>().await;
        }
        if self.fail_on == Some(op) {
            return Err(SandboxError::Vm(format!("{call:?} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl Vm for MockVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> VmInfo {
        VmInfo {
            id: self.id.clone(),
            cpu: self.cpu,
            memory_mib: self.memory_mib,
            hypervisor_state: serde_json::json!({ "backend": "mock" }),
        }
    }

    async fn pause(&mut self) -> Result<()> {
        self.call(Op::Pause, Call::Pause).await
    }

    async fn save(&mut self) -> Result<()> {
        self.call(Op::Save, Call::Save).await
    }

    async fn resume(&mut self) -> Result<()> {
        self.call(Op::Resume, Call::Resume).await
    }

    async fn stop(&mut self) -> Result<()> {
        self.calls.lock().expect("calls lock").push(Call::Stop);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.calls.lock().expect("calls lock").push(Call::Disconnect);
        Ok(())
    }

    async fn reseed_rng(&mut self) -> Result<()> {
        self.call(Op::ReseedRng, Call::ReseedRng).await
    }

    async fn sync_time(&mut self) -> Result<()> {
        self.call(Op::SyncTime, Call::SyncTime).await
    }

    async fn add_cpus(&mut self, num: u32) -> Result<()> {
        self.call(Op::AddCpus, Call::AddCpus(num)).await?;
        self.cpu += num;
        Ok(())
    }

    async fn add_memory(&mut self, mib: u32) -> Result<()> {
        self.call(Op::AddMemory, Call::AddMemory(mib)).await?;
        self.memory_mib += mib;
        Ok(())
    }

    async fn online_cpu_memory(&mut self) -> Result<()> {
        self.call(Op::OnlineCpuMemory, Call::OnlineCpuMemory).await
    }
}

/// A valid request for the mock hypervisor with the given sizing.
pub(crate) fn vm_config(num_vcpus: u32, memory_size: u32) -> VmConfig {
    VmConfig {
        agent_type: Some(AgentType::Kata),
        proxy_type: Some(ProxyType::KataBuiltin),
        ..VmConfig::new(
            HypervisorType::Mock,
            HypervisorConfig {
                kernel_path: PathBuf::from("/opt/vm/vmlinux"),
                image_path: PathBuf::from("/opt/vm/rootfs.img"),
                num_vcpus,
                memory_size,
                ..Default::default()
            },
        )
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

use serde::{Deserialize, Serialize};

/// Portable description of a running VM.
///
/// Produced by [`Vm::info`](crate::Vm::info) and consumed by
/// [`VmLauncher::attach`](crate::VmLauncher::attach), so a VM booted in one
/// process can be handed to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub cpu: u32,
    pub memory_mib: u32,
    /// Hypervisor-specific state needed to reconnect (pids, sockets, ...).
    #[serde(default)]
    pub hypervisor_state: serde_json::Value,
}

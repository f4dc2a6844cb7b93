use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cache_proto::{
    Decoder, MSG_BASE_VM, MSG_CONFIG, MSG_CONFIG_RESULT, MSG_ERROR, MSG_GET_BASE_VM, MSG_QUIT,
    MSG_QUIT_ACK, MSG_STATUS, MSG_STATUS_RESULT, RawMessage,
};
use sandbox::{FactoryBase, Result, SandboxError, Vm, VmConfig, VmInfo, VmLauncher};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CacheStatus;
use crate::factory::cancellable;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUF_SIZE: usize = 16 * 1024;

fn remote_err(context: &str, e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Remote(format!("{context}: {e}"))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One request/response exchange with the cache server.
struct Connection {
    stream: UnixStream,
    decoder: Decoder,
    next_seq: u32,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl Connection {
    async fn open(endpoint: &Path) -> Result<Self> {
        let stream = time::timeout(CONNECT_TIMEOUT, UnixStream::connect(endpoint))
            .await
            .map_err(|_| {
                SandboxError::Remote(format!(
                    "connect {}: timed out after {}ms",
                    endpoint.display(),
                    CONNECT_TIMEOUT.as_millis()
                ))
            })?
            .map_err(|e| remote_err(&format!("connect {}", endpoint.display()), e))?;

        Ok(Self {
            stream,
            decoder: Decoder::new(),
            next_seq: 1,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        })
    }

    /// Get next sequence number, wrapping around and skipping 0.
    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.next_seq == 0 {
            self.next_seq = 1;
        }
        seq
    }

    /// Send an empty-bodied request and wait for the reply with the same seq.
    async fn request(&mut self, msg_type: u8) -> Result<RawMessage> {
        let seq = self.next_seq();
        let frame = cache_proto::encode(msg_type, seq, &[]).map_err(|e| remote_err("encode", e))?;
        self.stream.write_all(&frame).await?;

        loop {
            let n = self.stream.read(self.read_buf.as_mut()).await?;
            if n == 0 {
                return Err(SandboxError::Remote("connection closed by server".into()));
            }
            let messages = self
                .decoder
                // n <= read_buf.len() is guaranteed by read()
                .decode(self.read_buf.get(..n).unwrap_or_default())
                .map_err(|e| remote_err("decode", e))?;
            if let Some(msg) = messages.into_iter().find(|m| m.seq == seq) {
                return Ok(msg);
            }
        }
    }

    /// Send `msg_type` and decode a JSON reply of type `expected`.
    async fn call<T: DeserializeOwned>(&mut self, msg_type: u8, expected: u8) -> Result<T> {
        let resp = self.request(msg_type).await?;
        check_reply(msg_type, expected, &resp)?;
        cache_proto::decode_json(&resp.payload).map_err(|e| remote_err("decode reply", e))
    }
}

fn check_reply(request: u8, expected: u8, resp: &RawMessage) -> Result<()> {
    if resp.msg_type == MSG_ERROR {
        let msg = cache_proto::decode_error(&resp.payload).map_err(|e| remote_err("decode", e))?;
        return Err(SandboxError::Remote(msg.to_string()));
    }
    if resp.msg_type != expected {
        return Err(SandboxError::Remote(format!(
            "unexpected reply to {}: {}",
            cache_proto::message_name(request),
            cache_proto::message_name(resp.msg_type)
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RemoteCache
// ---------------------------------------------------------------------------

/// Client side of a remote VM cache.
///
/// Every request opens its own connection to the endpoint. VMs handed over
/// by the server are attached through the local [`VmLauncher`] using the
/// server's config, which is fetched once at connect time.
pub struct RemoteCache {
    endpoint: PathBuf,
    config: VmConfig,
    launcher: Arc<dyn VmLauncher>,
    closed: AtomicBool,
}

impl RemoteCache {
    /// Connect to the cache server at `endpoint` and fetch its config.
    pub async fn connect(launcher: Arc<dyn VmLauncher>, endpoint: PathBuf) -> Result<Self> {
        let mut conn = Connection::open(&endpoint).await?;
        let config: VmConfig = conn.call(MSG_CONFIG, MSG_CONFIG_RESULT).await?;
        info!(
            endpoint = %endpoint.display(),
            hypervisor = %config.hypervisor_type,
            "connected to remote vm cache"
        );

        Ok(Self {
            endpoint,
            config,
            launcher,
            closed: AtomicBool::new(false),
        })
    }

    /// Query the server's pid and pooled VMs.
    pub async fn server_status(&self) -> Result<CacheStatus> {
        let mut conn = Connection::open(&self.endpoint).await?;
        conn.call(MSG_STATUS, MSG_STATUS_RESULT).await
    }

    /// Ask the server to shut down.
    pub async fn quit(&self) -> Result<()> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let resp = conn.request(MSG_QUIT).await?;
        check_reply(MSG_QUIT, MSG_QUIT_ACK, &resp)?;
        info!(endpoint = %self.endpoint.display(), "remote vm cache asked to quit");
        Ok(())
    }
}

#[async_trait]
impl FactoryBase for RemoteCache {
    fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Take a VM from the server's pool and attach to it. The request is not
    /// consulted; the server builds VMs from its own config.
    ///
    /// Once the server has replied the VM belongs to this client, so
    /// attaching is not interrupted; a VM attached after `cancel` fired is
    /// stopped.
    async fn get_base_vm(
        &self,
        cancel: &CancellationToken,
        _config: &VmConfig,
    ) -> Result<Box<dyn Vm>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::Closed);
        }

        let info: VmInfo = cancellable(cancel, async {
            let mut conn = Connection::open(&self.endpoint).await?;
            conn.call(MSG_GET_BASE_VM, MSG_BASE_VM).await
        })
        .await?;
        let mut vm = self.launcher.attach(&info, &self.config).await?;

        if cancel.is_cancelled() {
            if let Err(e) = vm.stop().await {
                warn!(id = %vm.id(), error = %e, "failed to stop vm attached after cancellation");
            }
            return Err(SandboxError::Cancelled);
        }

        info!(id = %vm.id(), "attached vm from remote cache");
        Ok(vm)
    }

    /// The server owns the pool; closing only stops this client.
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn status(&self) -> Vec<VmInfo> {
        match self.server_status().await {
            Ok(status) => status.vms,
            Err(e) => {
                warn!(
                    endpoint = %self.endpoint.display(),
                    error = %e,
                    "failed to query remote vm cache"
                );
                Vec::new()
            }
        }
    }
}

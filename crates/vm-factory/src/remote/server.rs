use std::io;
use std::path::Path;
use std::sync::Arc;

use cache_proto::{
    Decoder, MSG_BASE_VM, MSG_CONFIG, MSG_CONFIG_RESULT, MSG_ERROR, MSG_GET_BASE_VM, MSG_QUIT,
    MSG_QUIT_ACK, MSG_STATUS, MSG_STATUS_RESULT, RawMessage,
};
use sandbox::{FactoryBase, SandboxError, Vm};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CacheStatus;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Bind the cache endpoint, removing a stale socket first.
pub fn bind(endpoint: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(endpoint) {
        Ok(()) => debug!(endpoint = %endpoint.display(), "removed stale cache socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(endpoint)
}

/// Serves base VMs from a local factory to remote clients.
pub struct CacheServer {
    factory: Arc<dyn FactoryBase>,
    shutdown: CancellationToken,
}

impl CacheServer {
    pub fn new(factory: Arc<dyn FactoryBase>) -> Self {
        Self {
            factory,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`serve`](Self::serve) when cancelled. A client's
    /// quit request cancels it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down. The wrapped factory is left open;
    /// closing it is up to the caller.
    pub async fn serve(&self, listener: UnixListener) {
        info!("vm cache server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handle_connection(
                            stream,
                            Arc::clone(&self.factory),
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "failed to accept cache client"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "cache connection task failed");
                    }
                }
            }
        }

        // Connection tasks watch the same token; joining lets a cancelled
        // acquisition stop the VM it was holding.
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "cache connection task failed");
            }
        }
        info!("vm cache server stopped");
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    factory: Arc<dyn FactoryBase>,
    shutdown: CancellationToken,
) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = stream.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "cache client read failed");
                return;
            }
        };
        // n <= buf.len() is guaranteed by read()
        let messages = match decoder.decode(buf.get(..n).unwrap_or_default()) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "malformed frame from cache client");
                return;
            }
        };

        for msg in messages {
            let quit = msg.msg_type == MSG_QUIT;
            let Reply { frame, served } = reply(&msg, factory.as_ref(), &shutdown).await;
            let written = stream.write_all(&frame).await;
            if let Some(vm) = served {
                hand_over(vm, written.is_ok()).await;
            }
            if let Err(e) = written {
                debug!(error = %e, "cache client write failed");
                return;
            }
            if quit {
                info!("quit requested by cache client");
                shutdown.cancel();
                return;
            }
        }
    }
}

/// Reply frame for one request, plus the VM it hands to the client.
struct Reply {
    frame: Vec<u8>,
    /// Still held by this process until the frame reaches the client.
    served: Option<Box<dyn Vm>>,
}

impl Reply {
    fn frame(frame: Vec<u8>) -> Self {
        Self {
            frame,
            served: None,
        }
    }
}

/// Release a served VM to the client, or stop it if the client never got
/// the reply.
async fn hand_over(mut vm: Box<dyn Vm>, delivered: bool) {
    if !delivered {
        warn!(id = %vm.id(), "cache client went away before taking its vm, stopping it");
        if let Err(e) = vm.stop().await {
            warn!(id = %vm.id(), error = %e, "failed to stop undelivered vm");
        }
        return;
    }
    // The client attaches to the VM; this process lets go of it.
    if let Err(e) = vm.disconnect().await {
        warn!(id = %vm.id(), error = %e, "failed to disconnect from served vm");
    }
    info!(id = %vm.id(), "served vm to cache client");
}

/// Build the reply for one request; failures become error frames.
async fn reply(
    msg: &RawMessage,
    factory: &dyn FactoryBase,
    shutdown: &CancellationToken,
) -> Reply {
    let frame = match respond(msg, factory, shutdown).await {
        Ok(reply) => return reply,
        Err(e) => {
            warn!(
                request = cache_proto::message_name(msg.msg_type),
                error = %e,
                "cache request failed"
            );
            cache_proto::encode(MSG_ERROR, msg.seq, &cache_proto::encode_error(&e.to_string()))
        }
    };
    Reply::frame(frame.unwrap_or_else(|e| {
        warn!(error = %e, "failed to encode cache reply");
        Vec::new()
    }))
}

async fn respond(
    msg: &RawMessage,
    factory: &dyn FactoryBase,
    shutdown: &CancellationToken,
) -> Result<Reply, SandboxError> {
    let encode_err = |e: cache_proto::ProtocolError| SandboxError::Remote(e.to_string());

    match msg.msg_type {
        MSG_CONFIG => cache_proto::encode_json(MSG_CONFIG_RESULT, msg.seq, factory.config())
            .map(Reply::frame)
            .map_err(encode_err),
        MSG_GET_BASE_VM => {
            let mut vm = factory.get_base_vm(shutdown, factory.config()).await?;
            let info = vm.info();
            match cache_proto::encode_json(MSG_BASE_VM, msg.seq, &info) {
                Ok(frame) => Ok(Reply {
                    frame,
                    served: Some(vm),
                }),
                Err(e) => {
                    if let Err(stop_err) = vm.stop().await {
                        warn!(id = %info.id, error = %stop_err, "failed to stop unsent vm");
                    }
                    Err(encode_err(e))
                }
            }
        }
        MSG_STATUS => {
            let status = CacheStatus {
                pid: std::process::id(),
                vms: factory.status().await,
            };
            cache_proto::encode_json(MSG_STATUS_RESULT, msg.seq, &status)
                .map(Reply::frame)
                .map_err(encode_err)
        }
        MSG_QUIT => cache_proto::encode(MSG_QUIT_ACK, msg.seq, &[])
            .map(Reply::frame)
            .map_err(encode_err),
        other => Err(SandboxError::Remote(format!(
            "unsupported request: {}",
            cache_proto::message_name(other)
        ))),
    }
}

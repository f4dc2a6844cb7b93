//! Remote VM cache: a server process keeps a pool of base VMs and hands
//! them to clients over a Unix socket using the `cache-proto` framing.
//!
//! ## Flow
//!
//! 1. Server wraps a [`FactoryBase`](sandbox::FactoryBase) (normally a
//!    [`VmCache`](crate::VmCache)) and listens on the endpoint
//! 2. Client connects and fetches the server's `VmConfig` once
//! 3. For each base VM the client sends `get_base_vm`; the server takes a VM
//!    from its pool, replies with the VM's `VmInfo` and disconnects from it
//! 4. Client attaches to the VM through its own `VmLauncher`

mod client;
mod server;

use sandbox::VmInfo;
use serde::{Deserialize, Serialize};

pub use client::RemoteCache;
pub use server::{CacheServer, bind};

/// Reply to a status request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    /// Server process id.
    pub pid: u32,
    /// VMs ready in the server's pool.
    pub vms: Vec<VmInfo>,
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use cache_proto::MSG_GET_BASE_VM;
    use sandbox::{FactoryBase, SandboxError};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cache::VmCache;
    use crate::direct::Direct;
    use crate::testing::{Call, MockLauncher, Op, init_tracing, vm_config};

    struct Harness {
        server: Arc<CacheServer>,
        task: JoinHandle<()>,
        server_launcher: Arc<MockLauncher>,
        factory: Arc<dyn FactoryBase>,
    }

    fn start_server(endpoint: &Path, pool_size: usize) -> Harness {
        init_tracing();
        let server_launcher = MockLauncher::new();
        let direct = Box::new(Direct::new(server_launcher.clone(), vm_config(1, 512)));
        let factory: Arc<dyn FactoryBase> = if pool_size > 0 {
            Arc::new(VmCache::new(pool_size, direct))
        } else {
            Arc::from(direct as Box<dyn FactoryBase>)
        };

        let listener = bind(endpoint).expect("bind");
        let server = Arc::new(CacheServer::new(Arc::clone(&factory)));
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });

        Harness {
            server,
            task,
            server_launcher,
            factory,
        }
    }

    impl Harness {
        async fn stop(self) {
            self.server.shutdown_token().cancel();
            self.task.await.expect("server task");
            self.factory.close().await;
        }
    }

    #[tokio::test]
    async fn connect_fetches_server_config() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);

        let client = RemoteCache::connect(MockLauncher::new(), endpoint)
            .await
            .expect("connect");
        assert_eq!(client.config(), &vm_config(1, 512));

        harness.stop().await;
    }

    #[tokio::test]
    async fn get_base_vm_transfers_vm_to_client() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);
        let client_launcher = MockLauncher::new();

        let client = RemoteCache::connect(client_launcher.clone(), endpoint)
            .await
            .expect("connect");
        let vm = client
            .get_base_vm(&CancellationToken::new(), &vm_config(2, 2048))
            .await
            .expect("base vm");

        harness
            .server_launcher
            .wait_for_calls(vm.id(), &[Call::Pause, Call::Disconnect])
            .await;
        let attached = client_launcher.record(vm.id());
        assert!(attached.attached);
        assert_eq!(attached.config, vm_config(1, 512));
        assert!(attached.calls().is_empty());

        harness.stop().await;
    }

    #[tokio::test]
    async fn status_reports_pooled_vms() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 2);

        let client = RemoteCache::connect(MockLauncher::new(), endpoint)
            .await
            .expect("connect");
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = client.server_status().await.expect("status");
                if status.vms.len() == 2 {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not fill in time");

        assert_eq!(status.pid, std::process::id());
        assert_eq!(client.status().await.len(), 2);

        harness.stop().await;
    }

    #[tokio::test]
    async fn server_errors_reach_the_client() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);
        harness.server_launcher.set_fail_launch(true);

        let client = RemoteCache::connect(MockLauncher::new(), endpoint)
            .await
            .expect("connect");
        let Err(err) = client
            .get_base_vm(&CancellationToken::new(), &vm_config(1, 512))
            .await
        else {
            panic!("server should fail to launch");
        };
        assert!(matches!(err, SandboxError::Remote(_)), "{err}");
        assert!(err.to_string().contains("launch failed"), "{err}");

        harness.stop().await;
    }

    #[tokio::test]
    async fn vm_is_stopped_when_client_leaves_before_reply() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);

        let mut stream = UnixStream::connect(&endpoint).await.expect("connect");
        let frame = cache_proto::encode(MSG_GET_BASE_VM, 1, &[]).expect("encode");
        stream.write_all(&frame).await.expect("write request");
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.server_launcher.vms().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server did not launch a vm");
        let id = harness.server_launcher.vms()[0].id.clone();
        harness
            .server_launcher
            .wait_for_calls(&id, &[Call::Pause, Call::Stop])
            .await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn shutdown_stops_vm_of_abandoned_request() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);
        harness.server_launcher.set_block_on(Some(Op::Pause));

        let client = RemoteCache::connect(MockLauncher::new(), endpoint)
            .await
            .expect("connect");
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        });
        let result = client.get_base_vm(&cancel, &vm_config(1, 512)).await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));

        let server_launcher = Arc::clone(&harness.server_launcher);
        harness.stop().await;
        let vms = server_launcher.vms();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].calls(), vec![Call::Pause, Call::Stop]);
    }

    #[tokio::test]
    async fn connect_fails_without_server() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("absent.sock");
        let result = RemoteCache::connect(MockLauncher::new(), endpoint).await;
        assert!(matches!(result, Err(SandboxError::Remote(_))));
    }

    #[tokio::test]
    async fn quit_stops_the_server() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);

        let client = RemoteCache::connect(MockLauncher::new(), endpoint)
            .await
            .expect("connect");
        client.quit().await.expect("quit");

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("server did not stop")
            .expect("server task");
        harness.factory.close().await;
    }

    #[tokio::test]
    async fn closed_client_refuses_requests() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = tmp.path().join("cache.sock");
        let harness = start_server(&endpoint, 0);

        let client = RemoteCache::connect(MockLauncher::new(), endpoint)
            .await
            .expect("connect");
        client.close().await;
        let result = client
            .get_base_vm(&CancellationToken::new(), &vm_config(1, 512))
            .await;
        assert!(matches!(result, Err(SandboxError::Closed)));

        harness.stop().await;
    }
}

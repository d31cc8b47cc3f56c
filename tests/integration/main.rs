//! cvp integration test harness.
//!
//! Each test runs a complete daemon in-process: coordinator, workers and
//! the TCP listener on a loopback port, with its own scratch directory.
//! Peers talk to it over real sockets using the client helpers.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cvp_core::verdict::Action;
use cvp_core::{FilenamePrefixPolicy, RequestParams, Verdict};
use cvp_services::{
    serve, submit_content, Coordinator, CoordinatorHandle, ScratchStore, TransportSettings,
};

mod inspection;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Chunk size the test daemon streams content back with.
pub const SERVER_CHUNK: usize = 1024;

/// Chunk size test peers upload with.
pub const CLIENT_CHUNK: usize = 4096;

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct Daemon {
    pub addr: SocketAddr,
    pub store: ScratchStore,
    shutdown: broadcast::Sender<()>,
    coordinator: JoinHandle<Result<()>>,
    listener: JoinHandle<Result<()>>,
}

impl Daemon {
    pub async fn start() -> Result<Self> {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root: PathBuf = std::env::temp_dir().join(format!(
            "cvp-integration-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&root);
        let store = ScratchStore::new(&root)?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind loopback listener")?;
        let addr = listener.local_addr()?;

        let (shutdown, _) = broadcast::channel(1);
        let (coordinator, reports) = Coordinator::new(
            SERVER_CHUNK,
            store.clone(),
            Arc::new(FilenamePrefixPolicy::default()),
        );
        let (handle, events) = CoordinatorHandle::new();

        let coordinator = tokio::spawn(coordinator.run(reports, events, shutdown.subscribe()));
        let listener = tokio::spawn(serve(
            listener,
            handle,
            TransportSettings::default(),
            shutdown.subscribe(),
        ));

        Ok(Self {
            addr,
            store,
            shutdown,
            coordinator,
            listener,
        })
    }

    /// Inspect `content` under `filename` and return what came back.
    pub async fn inspect(
        &self,
        filename: &str,
        action: Action,
        content: &[u8],
    ) -> Result<(Verdict, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let request = RequestParams {
            filename: Some(filename.into()),
            action,
            ..Default::default()
        };
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            submit_content(
                &mut stream,
                request,
                Bytes::copy_from_slice(content),
                CLIENT_CHUNK,
            ),
        )
        .await
        .context("inspection timed out")??;
        Ok(result)
    }

    /// Wait until no scratch files are left behind.
    pub async fn wait_for_clean_scratch(&self) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.store.count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .context("scratch files were not removed")
    }

    /// Shut down and check that every worker cleaned up after itself.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(10), self.coordinator)
            .await
            .context("coordinator did not stop")???;
        tokio::time::timeout(Duration::from_secs(5), self.listener)
            .await
            .context("listener did not stop")???;

        let leftover = self.store.count();
        let _ = std::fs::remove_dir_all(self.store.root());
        anyhow::ensure!(leftover == 0, "{leftover} scratch files left after shutdown");
        Ok(())
    }
}

/// Deterministic test content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

//! State shared by every connection spawned under one owner.
use std::future::Future;

use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{config::TcpConfig, OnTcpConnect, OnTcpDisconnect};

/// Shutdown signal, join tracker and lifecycle callbacks of a server or
/// client. Connections hold it behind an `Arc`; it lives as long as the
/// longest holder.
pub(crate) struct TcpSock {
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) on_connect: OnTcpConnect,
    pub(crate) on_disconnect: OnTcpDisconnect,
    pub(crate) config: TcpConfig,
}

impl TcpSock {
    pub(crate) fn new(
        on_connect: OnTcpConnect,
        on_disconnect: OnTcpDisconnect,
        config: TcpConfig,
    ) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            on_connect,
            on_disconnect,
            config,
        }
    }

    /// Spawns `task` so that [`TcpSock::join`] waits for it.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fires the owner-wide signal and waits until every tracked task exits.
    pub(crate) async fn join(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#![cfg(feature = "bench")]

//! Internal helpers for Criterion benchmarks.
//!
//! These helpers stand up a loopback echo server and a connected client so
//! the benchmarks can exercise the write queue and both connection loops
//! over real sockets.

use std::{io, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{TcpClient, TcpConfig, TcpConn, TcpServer, TcpSession};

struct Echo {
    conn: Arc<TcpConn>,
}

impl TcpSession for Echo {
    fn sock_handle(&self) -> u64 {
        self.conn.id()
    }

    fn read(&self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.conn
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn close(&self) -> io::Result<()> {
        self.conn.close();
        Ok(())
    }
}

/// Forwards every chunk the client receives into a channel, or drops it when
/// no channel is attached.
struct Sink {
    id: u64,
    tx: Option<mpsc::UnboundedSender<usize>>,
}

impl TcpSession for Sink {
    fn sock_handle(&self) -> u64 {
        self.id
    }

    fn read(&self, buf: &[u8]) -> io::Result<usize> {
        if let Some(tx) = &self.tx {
            let _ = tx.send(buf.len());
        }
        Ok(buf.len())
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// An echo server with one connected client.
pub struct EchoContext {
    /// Server side; sessions echo everything back.
    pub server: TcpServer,
    /// Client connected to `server`.
    pub client: TcpClient,
    received: tokio::sync::Mutex<mpsc::UnboundedReceiver<usize>>,
}

impl EchoContext {
    /// Starts the server on an ephemeral port and connects the client.
    pub async fn start() -> Self {
        Self::launch(true).await
    }

    /// Like [`EchoContext::start`], but the client drops what it receives, so
    /// nothing accumulates when traffic is never awaited.
    pub async fn start_discarding() -> Self {
        Self::launch(false).await
    }

    async fn launch(track: bool) -> Self {
        let config = TcpConfig::default().with_send_poll_interval(Duration::from_millis(1));
        let server = TcpServer::with_config(
            "127.0.0.1:0",
            config.clone(),
            |conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> {
                Some(Arc::new(Echo {
                    conn: Arc::clone(conn),
                }))
            },
            |_conn: &TcpConn| {},
            None,
        );
        server.serve();

        let (tx, rx) = mpsc::unbounded_channel();
        let client = TcpClient::with_config(
            &server.local_addr().to_string(),
            config,
            move |conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> {
                Some(Arc::new(Sink {
                    id: conn.id(),
                    tx: track.then(|| tx.clone()),
                }))
            },
            |_conn: &TcpConn| {},
        );
        client
            .open()
            .await
            .expect("bench client should reach the local server");

        Self {
            server,
            client,
            received: tokio::sync::Mutex::new(rx),
        }
    }

    /// Sends `payload` and waits until the echo has fully come back.
    pub async fn round_trip(&self, payload: &[u8]) {
        self.client
            .write(payload)
            .expect("bench connection should stay open");

        let mut rx = self.received.lock().await;
        let mut got = 0;
        while got < payload.len() {
            match rx.recv().await {
                Some(n) => got += n,
                None => return,
            }
        }
    }

    /// Number of received chunks nobody has awaited yet.
    #[cfg(test)]
    pub(crate) async fn backlog(&self) -> usize {
        self.received.lock().await.len()
    }

    /// Stops both ends.
    pub async fn shutdown(&self) {
        self.client.close().await;
        self.server.close().await;
    }
}

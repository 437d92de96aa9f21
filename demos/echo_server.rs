//! Echo server: every byte a client sends is written back to it.
//!
//! Run with `RUST_LOG=debug cargo run --example echo_server`.
use std::{io, sync::Arc, time::Duration};

use tcpsock::{TcpConn, TcpServer, TcpSession};
use tracing::info;
use tracing_subscriber::EnvFilter;

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

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = TcpServer::new(
        "127.0.0.1:9527",
        |conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> {
            info!(id = conn.id(), peer = ?conn.peer_addr().ok(), "client connected");
            Some(Arc::new(Echo {
                conn: Arc::clone(conn),
            }))
        },
        |conn: &TcpConn| info!(id = conn.id(), "client disconnected"),
        None,
    );
    server.serve();

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    for _ in 0..12 {
        ticker.tick().await;
        info!(live = server.count(), "status");
    }

    server.close().await;
}

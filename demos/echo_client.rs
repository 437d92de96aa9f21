//! Connects to the echo server, sends a few messages and prints the replies.
use std::{io, sync::Arc, time::Duration};

use tcpsock::{TcpClient, TcpConn, TcpSession};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Printer {
    id: u64,
}

impl TcpSession for Printer {
    fn sock_handle(&self) -> u64 {
        self.id
    }

    fn read(&self, buf: &[u8]) -> io::Result<usize> {
        info!(reply = %String::from_utf8_lossy(buf), "received");
        Ok(buf.len())
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> tcpsock::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = TcpClient::new(
        "127.0.0.1:9527",
        |conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> {
            Some(Arc::new(Printer { id: conn.id() }))
        },
        |_conn: &TcpConn| info!("disconnected"),
    );
    client.open().await?;

    for i in 0..5 {
        client.write(format!("ping {i}").as_bytes())?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    client.close().await;
    Ok(())
}

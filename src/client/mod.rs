//! Dialing side: a single outbound connection.
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{
    config::TcpConfig,
    conn::TcpConn,
    error::{Result, TcpSockError},
    session::TcpSession,
    sock::TcpSock,
};

/// Id given to a client's connection.
pub const CLIENT_CONN_ID: u64 = 0;

/// A TCP client owning at most one connection to `svr_addr`.
///
/// ## Example
///
/// ```rust,no_run
/// use tcpsock::TcpClient;
///
/// #[tokio::main]
/// async fn main() -> tcpsock::Result<()> {
///     let client = TcpClient::new(
///         "127.0.0.1:9000",
///         |_conn| None,
///         |conn| println!("connection {} closed", conn.id()),
///     );
///     client.open().await?;
///     client.write(b"ping")?;
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct TcpClient {
    svr_addr: String,
    sock: Arc<TcpSock>,
    conn: Mutex<Option<Arc<TcpConn>>>,
}

impl TcpClient {
    /// Creates a client for `svr_addr` with the default [`TcpConfig`].
    ///
    /// ## Panics
    ///
    /// Panics if `svr_addr` is empty.
    pub fn new<C, D>(svr_addr: &str, on_connect: C, on_disconnect: D) -> Self
    where
        C: Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync + 'static,
        D: Fn(&TcpConn) + Send + Sync + 'static,
    {
        Self::with_config(svr_addr, TcpConfig::default(), on_connect, on_disconnect)
    }

    pub fn with_config<C, D>(
        svr_addr: &str,
        config: TcpConfig,
        on_connect: C,
        on_disconnect: D,
    ) -> Self
    where
        C: Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync + 'static,
        D: Fn(&TcpConn) + Send + Sync + 'static,
    {
        match Self::try_new(svr_addr, config, on_connect, on_disconnect) {
            Ok(client) => client,
            Err(e) => panic!("invalid TcpClient setup: {e}"),
        }
    }

    pub fn try_new<C, D>(
        svr_addr: &str,
        config: TcpConfig,
        on_connect: C,
        on_disconnect: D,
    ) -> Result<Self>
    where
        C: Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync + 'static,
        D: Fn(&TcpConn) + Send + Sync + 'static,
    {
        if svr_addr.trim().is_empty() {
            return Err(TcpSockError::InvalidAddress(svr_addr.to_string()));
        }
        config.validate()?;

        Ok(Self {
            svr_addr: svr_addr.to_string(),
            sock: Arc::new(TcpSock::new(
                Arc::new(on_connect),
                Arc::new(on_disconnect),
                config,
            )),
            conn: Mutex::new(None),
        })
    }

    /// Dials the server and starts the connection.
    ///
    /// When this returns `Ok`, the connect callback has run, its session is
    /// wired in and both loops are started. A failed or timed-out dial
    /// creates no connection and fires no callback.
    ///
    /// Opening again while connected closes the previous connection first.
    pub async fn open(&self) -> Result<()> {
        if self.sock.is_shutdown() {
            return Err(TcpSockError::ConnectionClosed);
        }

        let timeout = self.sock.config.dial_timeout;
        let dial = TcpStream::connect(self.svr_addr.as_str());
        let stream = match tokio::time::timeout(timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                warn!(addr = %self.svr_addr, error = %source, "dial failed");
                return Err(TcpSockError::Dial {
                    addr: self.svr_addr.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(addr = %self.svr_addr, ?timeout, "dial timed out");
                return Err(TcpSockError::DialTimeout {
                    addr: self.svr_addr.clone(),
                    timeout,
                });
            }
        };

        let previous = self.conn.lock().take();
        if let Some(previous) = previous {
            previous.close();
        }

        let on_close = Arc::clone(&self.sock.on_disconnect);
        let conn = Arc::new(TcpConn::new(
            CLIENT_CONN_ID,
            Arc::clone(&self.sock),
            stream,
            on_close,
        ));
        if let Some(session) = (self.sock.on_connect)(&conn) {
            conn.set_session(session);
        }

        *self.conn.lock() = Some(Arc::clone(&conn));
        conn.run();
        debug!(addr = %self.svr_addr, "client connected");
        Ok(())
    }

    /// Queues `buf` on the current connection.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.conn() {
            Some(conn) => conn.write(buf),
            None => Err(TcpSockError::NotConnected),
        }
    }

    /// The current connection, if `open` has succeeded.
    pub fn conn(&self) -> Option<Arc<TcpConn>> {
        self.conn.lock().clone()
    }

    /// Signals shutdown and waits for the connection's loops to finish.
    pub async fn close(&self) {
        self.sock.join().await;
        debug!(addr = %self.svr_addr, "client closed");
    }
}

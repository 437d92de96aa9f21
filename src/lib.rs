//! # tcpsock
//!
//! A small connection manager for TCP services that keep many long-lived
//! sockets open, such as online game servers.
//!
//! `tcpsock` accepts or dials sockets, runs a send loop and a receive loop for
//! each of them, buffers outbound writes, and shuts everything down
//! cooperatively. It knows nothing about message framing: the application
//! plugs in a [`TcpSession`] per connection and parses the raw byte stream
//! itself.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::{io, sync::Arc, time::Duration};
//! use tcpsock::{TcpConn, TcpServer, TcpSession};
//!
//! struct Echo(Arc<TcpConn>);
//!
//! impl TcpSession for Echo {
//!     fn sock_handle(&self) -> u64 {
//!         self.0.id()
//!     }
//!     fn read(&self, buf: &[u8]) -> io::Result<usize> {
//!         self.write(buf)
//!     }
//!     fn write(&self, buf: &[u8]) -> io::Result<usize> {
//!         self.0
//!             .write(buf)
//!             .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
//!     }
//!     fn close(&self) -> io::Result<()> {
//!         self.0.close();
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = TcpServer::new(
//!         "127.0.0.1:9000",
//!         |conn| {
//!             let session: Arc<dyn TcpSession> = Arc::new(Echo(Arc::clone(conn)));
//!             Some(session)
//!         },
//!         |conn| println!("connection {} closed", conn.id()),
//!         None,
//!     );
//!     server.serve();
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     server.close().await;
//! }
//! ```
use std::{net::SocketAddr, sync::Arc};

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod server;
pub mod session;

pub(crate) mod sock;

#[cfg(feature = "bench")]
pub mod bench_support;

#[cfg(test)]
mod tests;

pub use client::TcpClient;
pub use config::TcpConfig;
pub use conn::TcpConn;
pub use error::{Result, TcpSockError};
pub use server::TcpServer;
pub use session::TcpSession;

/// Called once per accepted or dialed connection, before its loops start.
///
/// Returning `None` leaves the connection running without a session: inbound
/// bytes are read and discarded, and the server does not register it.
pub type OnTcpConnect = Arc<dyn Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync>;

/// Called once per connection during its close sequence, after the socket is
/// shut down.
pub type OnTcpDisconnect = Arc<dyn Fn(&TcpConn) + Send + Sync>;

/// Admission filter consulted for every accepted socket. Returning `false`
/// drops the socket without firing any callback.
pub type OnCheckIp = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

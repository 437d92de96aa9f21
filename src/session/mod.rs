//! The application side of a connection.
use std::io;

/// Application framing over one connection's byte stream.
///
/// `tcpsock` never looks inside the bytes it moves. A `TcpSession` is what
/// the embedding application hands back from its connect callback; the
/// connection's ingress loop feeds it every chunk read off the socket and the
/// server routes `send`/`broadcast` through its `write`.
///
/// Sessions are shared between the server registry and the connection, so
/// every method takes `&self`. Keep mutable parse state behind a lock.
///
/// ## Example
///
/// ```rust
/// use std::{io, sync::Arc};
/// use tcpsock::{TcpConn, TcpSession};
///
/// struct Echo {
///     conn: Arc<TcpConn>,
/// }
///
/// impl TcpSession for Echo {
///     fn sock_handle(&self) -> u64 {
///         self.conn.id()
///     }
///
///     fn read(&self, buf: &[u8]) -> io::Result<usize> {
///         self.write(buf)
///     }
///
///     fn write(&self, buf: &[u8]) -> io::Result<usize> {
///         self.conn
///             .write(buf)
///             .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
///     }
///
///     fn close(&self) -> io::Result<()> {
///         self.conn.close();
///         Ok(())
///     }
/// }
/// ```
pub trait TcpSession: Send + Sync {
    /// Id of the connection this session is bound to.
    fn sock_handle(&self) -> u64;

    /// Consumes bytes delivered by the ingress loop.
    ///
    /// Must report the whole chunk as consumed. Returning fewer bytes or an
    /// error closes the connection.
    fn read(&self, buf: &[u8]) -> io::Result<usize>;

    /// Queues bytes for the peer.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Tears the session down.
    fn close(&self) -> io::Result<()>;
}

//! A single managed TCP connection.
//!
//! [`TcpConn`] owns one socket and drives it with two tasks: an egress loop
//! that drains a FIFO of pending writes into coalesced socket writes, and an
//! ingress loop that reads the socket and hands each chunk to the installed
//! [`TcpSession`]. Either loop, the owner, or the application may end the
//! connection; the close sequence runs exactly once whichever gets there
//! first.
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    future::Future,
    io,
    net::{Shutdown, SocketAddr},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{Result, TcpSockError},
    session::TcpSession,
    sock::TcpSock,
    OnTcpDisconnect,
};

/// Pending outbound frames, in `write` order.
#[derive(Default)]
pub(crate) struct SendQueue {
    frames: VecDeque<Vec<u8>>,
    queued: usize,
}

impl SendQueue {
    pub(crate) fn push(&mut self, frame: Vec<u8>) {
        self.queued += frame.len();
        self.frames.push_back(frame);
    }

    /// Pops whole frames into one buffer until `window` bytes are gathered.
    ///
    /// At least one frame is taken when the queue is not empty, even if that
    /// frame alone is larger than the window.
    pub(crate) fn drain_window(&mut self, window: usize) -> Option<Vec<u8>> {
        let mut out = self.frames.pop_front()?;
        while let Some(next) = self.frames.front() {
            if out.len() + next.len() > window {
                break;
            }
            if let Some(next) = self.frames.pop_front() {
                out.extend_from_slice(&next);
            }
        }
        self.queued -= out.len();
        Some(out)
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.queued = 0;
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Handle to one live TCP connection.
///
/// Connections are created by [`TcpServer`](crate::TcpServer) on accept and by
/// [`TcpClient`](crate::TcpClient) on dial, and handed to the connect callback
/// as `Arc<TcpConn>`. Keep a clone inside your session to write to the peer.
///
/// ## Writing
///
/// [`write`](Self::write) never blocks: it copies the payload into the
/// connection's queue and returns. The egress loop transmits queued payloads in
/// call order.
///
/// ## Closing
///
/// [`close`](Self::close) is idempotent and safe to call from any task,
/// including from inside a session callback. The first call sets the closed
/// flag, cancels both loops, shuts the socket down, fires the owner's
/// disconnect callback and drops whatever was still queued. The descriptor
/// itself is freed when the last clone of the connection is dropped.
pub struct TcpConn {
    id: u64,
    owner: Arc<TcpSock>,
    stream: TcpStream,
    close_token: CancellationToken,
    closed: AtomicBool,
    on_close: OnTcpDisconnect,
    send_queue: Mutex<SendQueue>,
    reader: RwLock<Option<Arc<dyn TcpSession>>>,
}

impl TcpConn {
    pub(crate) fn new(
        id: u64,
        owner: Arc<TcpSock>,
        stream: TcpStream,
        on_close: OnTcpDisconnect,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(id, error = %e, "failed to set TCP_NODELAY");
        }
        // A child token fires on either the owner's shutdown or our own close.
        let close_token = owner.shutdown.child_token();
        Self {
            id,
            owner,
            stream,
            close_token,
            closed: AtomicBool::new(false),
            on_close,
            send_queue: Mutex::new(SendQueue::default()),
            reader: RwLock::new(None),
        }
    }

    /// Returns the connection id.
    ///
    /// Server connections are numbered from 1 in accept order. A client's
    /// connection is always 0.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the underlying socket, for diagnostics.
    pub fn raw_conn(&self) -> &TcpStream {
        &self.stream
    }

    /// Returns the remote address of this connection.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Returns the local address of this connection.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Whether the close sequence has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues `buf` for transmission and returns its length.
    ///
    /// ## Errors
    ///
    /// - [`TcpSockError::ConnectionClosed`] once the connection is closing.
    /// - [`TcpSockError::InvalidArgument`] if `buf` is empty or longer than
    ///   the configured `max_frame_len`. Nothing is queued in that case.
    ///
    /// A peer that stops reading long enough for the queue to pass
    /// `send_queue_limit` bytes gets disconnected; the write that crossed the
    /// limit reports `ConnectionClosed`.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(TcpSockError::ConnectionClosed);
        }

        let max = self.owner.config.max_frame_len;
        let len = buf.len();
        if len == 0 || len > max {
            return Err(TcpSockError::InvalidArgument { len, max });
        }

        let frame = buf.to_vec();
        let overflow = {
            let mut queue = self.send_queue.lock();
            // `close` sets the flag before it clears the queue under this lock,
            // so a push either lands before the clear or is refused here.
            if self.is_closed() {
                return Err(TcpSockError::ConnectionClosed);
            }
            if queue.queued() + len > self.owner.config.send_queue_limit {
                true
            } else {
                queue.push(frame);
                false
            }
        };

        if overflow {
            warn!(id = self.id, "send queue limit reached, dropping slow peer");
            self.close();
            return Err(TcpSockError::ConnectionClosed);
        }
        Ok(len)
    }

    /// Closes the connection. Only the first call does anything.
    ///
    /// The socket is shut down in both directions, but its file descriptor is
    /// released only when the last `Arc<TcpConn>` is dropped. Sessions that
    /// keep a clone should drop it from the disconnect callback, or the
    /// descriptor stays open for as long as the session lives.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.close_token.cancel();
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            // The peer may already have reset the socket.
            trace!(id = self.id, error = %e, "socket shutdown failed");
        }
        (self.on_close)(self);
        self.send_queue.lock().clear();
        // Sessions usually hold an `Arc<TcpConn>`; dropping ours breaks the cycle.
        self.reader.write().take();
        debug!(id = self.id, "connection closed");
    }

    /// Installs the session that ingress chunks are delivered to.
    pub(crate) fn set_session(&self, session: Arc<dyn TcpSession>) {
        *self.reader.write() = Some(session);
        if self.is_closed() {
            self.reader.write().take();
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_bytes(&self) -> usize {
        self.send_queue.lock().queued()
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> usize {
        self.send_queue.lock().len()
    }

    /// Starts the egress and ingress loops on the owner's tracker.
    pub(crate) fn run(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.owner
            .spawn(async move { conn.supervise("egress", conn.send_loop()).await });

        let conn = Arc::clone(self);
        self.owner
            .spawn(async move { conn.supervise("ingress", conn.recv_loop()).await });
    }

    /// Runs one loop to completion and closes the connection afterwards, even
    /// when the loop panicked.
    async fn supervise<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()>,
    {
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            warn!(
                id = self.id,
                task = name,
                panic = panic_message(&*panic),
                "connection loop panicked"
            );
        }
        self.close();
    }

    async fn send_loop(&self) {
        let window = self.owner.config.send_window;
        let interval = self.owner.config.send_poll_interval;

        loop {
            if self.is_closed() || self.close_token.is_cancelled() {
                return;
            }

            let next = self.send_queue.lock().drain_window(window);
            match next {
                Some(buf) => {
                    tokio::select! {
                        biased;
                        _ = self.close_token.cancelled() => return,
                        res = self.write_all(&buf) => {
                            if let Err(e) = res {
                                trace!(id = self.id, error = %e, "egress write failed");
                                return;
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = self.close_token.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    async fn recv_loop(&self) {
        let mut buf = vec![0u8; self.owner.config.recv_buf_len];

        loop {
            if self.is_closed() {
                return;
            }

            let read = tokio::select! {
                biased;
                _ = self.close_token.cancelled() => return,
                res = self.read_some(&mut buf) => res,
            };

            let cnt = match read {
                Ok(0) => {
                    trace!(id = self.id, "peer closed the connection");
                    return;
                }
                Ok(cnt) => cnt,
                Err(e) => {
                    trace!(id = self.id, error = %e, "ingress read failed");
                    return;
                }
            };

            let session = self.reader.read().clone();
            if let Some(session) = session {
                match session.read(&buf[..cnt]) {
                    Ok(n) if n == cnt => {}
                    Ok(n) => {
                        debug!(id = self.id, read = cnt, consumed = n, "session short-consumed");
                        return;
                    }
                    Err(e) => {
                        debug!(id = self.id, error = %e, "session rejected data");
                        return;
                    }
                }
            }
        }
    }

    async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("id", &self.id)
            .field("peer", &self.stream.peer_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

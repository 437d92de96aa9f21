//! Shared fixtures for the test modules below.
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};

use crate::{sock::TcpSock, TcpConfig, TcpConn, TcpSession, OnTcpConnect, OnTcpDisconnect};

mod server_test;

pub(crate) const WAIT: Duration = Duration::from_secs(3);

/// Session that records every chunk it is fed and optionally echoes it back.
pub(crate) struct EchoSession {
    conn: Arc<TcpConn>,
    echo: bool,
    seen: Arc<Mutex<Vec<u8>>>,
}

impl EchoSession {
    pub(crate) fn shared(
        conn: &Arc<TcpConn>,
        echo: bool,
        seen: Arc<Mutex<Vec<u8>>>,
    ) -> Arc<dyn TcpSession> {
        Arc::new(Self {
            conn: Arc::clone(conn),
            echo,
            seen,
        })
    }
}

impl TcpSession for EchoSession {
    fn sock_handle(&self) -> u64 {
        self.conn.id()
    }

    fn read(&self, buf: &[u8]) -> io::Result<usize> {
        self.seen.lock().extend_from_slice(buf);
        if self.echo {
            self.write(buf)?;
        }
        Ok(buf.len())
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

/// Owner state whose disconnect callback bumps `disconnects`.
pub(crate) fn owner(config: TcpConfig, disconnects: Arc<AtomicUsize>) -> Arc<TcpSock> {
    let on_connect: OnTcpConnect =
        Arc::new(|_conn: &Arc<TcpConn>| -> Option<Arc<dyn TcpSession>> { None });
    let on_disconnect: OnTcpDisconnect = Arc::new(move |_conn: &TcpConn| {
        disconnects.fetch_add(1, Ordering::SeqCst);
    });
    Arc::new(TcpSock::new(on_connect, on_disconnect, config))
}

/// Returns `(accepted, dialed)` ends of a loopback connection.
pub(crate) async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accepted.unwrap().0, dialed.unwrap())
}

/// Polls `cond` until it holds or [`WAIT`] elapses.
pub(crate) async fn wait_until<F>(cond: F) -> bool
where
    F: Fn() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Reads exactly `len` bytes or panics after [`WAIT`].
pub(crate) async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for bytes")
        .expect("read failed");
    buf
}

/// True if the peer closed `stream` (EOF or reset) within [`WAIT`].
pub(crate) async fn peer_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(WAIT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

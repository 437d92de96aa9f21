//! Accepting side: listener, accept loop and the session registry.
use std::{
    collections::HashMap,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::{
    config::TcpConfig,
    conn::TcpConn,
    error::{Result, TcpSockError},
    session::TcpSession,
    sock::TcpSock,
    OnCheckIp, OnTcpDisconnect,
};

/// Registry of live sessions keyed by connection id.
pub(crate) type SessionRegistry = RwLock<HashMap<u64, Arc<dyn TcpSession>>>;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A TCP server that accepts connections and tracks their sessions.
///
/// `TcpServer` is cheap to clone; clones share the same listener and registry,
/// so a session can keep one around to reach its peers.
///
/// ## Lifecycle
///
/// 1. [`TcpServer::new`] binds the listener.
/// 2. [`TcpServer::serve`] starts the accept loop in the background.
/// 3. Each accepted socket gets the next id, is wrapped in a [`TcpConn`] and
///    handed to the connect callback. A returned session is registered.
/// 4. [`TcpServer::close`] stops accepting, closes every connection and waits
///    for all of their tasks to finish.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    sock: Arc<TcpSock>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    auto_inc_id: AtomicU64,
    count: AtomicUsize,
    sessions: SessionRegistry,
    on_check_ip: Option<OnCheckIp>,
}

impl TcpServer {
    /// Binds `addr` with the default [`TcpConfig`].
    ///
    /// ## Panics
    ///
    /// Panics if `addr` is empty or cannot be bound. Must be called from
    /// within a Tokio runtime.
    pub fn new<C, D>(
        addr: &str,
        on_connect: C,
        on_disconnect: D,
        on_check_ip: Option<OnCheckIp>,
    ) -> Self
    where
        C: Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync + 'static,
        D: Fn(&TcpConn) + Send + Sync + 'static,
    {
        Self::with_config(addr, TcpConfig::default(), on_connect, on_disconnect, on_check_ip)
    }

    /// Like [`TcpServer::new`], with an explicit configuration.
    pub fn with_config<C, D>(
        addr: &str,
        config: TcpConfig,
        on_connect: C,
        on_disconnect: D,
        on_check_ip: Option<OnCheckIp>,
    ) -> Self
    where
        C: Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync + 'static,
        D: Fn(&TcpConn) + Send + Sync + 'static,
    {
        match Self::try_new(addr, config, on_connect, on_disconnect, on_check_ip) {
            Ok(server) => server,
            Err(e) => panic!("invalid TcpServer setup: {e}"),
        }
    }

    /// Fallible constructor: reports an empty address, an invalid config or a
    /// bind failure instead of panicking.
    pub fn try_new<C, D>(
        addr: &str,
        config: TcpConfig,
        on_connect: C,
        on_disconnect: D,
        on_check_ip: Option<OnCheckIp>,
    ) -> Result<Self>
    where
        C: Fn(&Arc<TcpConn>) -> Option<Arc<dyn TcpSession>> + Send + Sync + 'static,
        D: Fn(&TcpConn) + Send + Sync + 'static,
    {
        if addr.trim().is_empty() {
            return Err(TcpSockError::InvalidAddress(addr.to_string()));
        }
        config.validate()?;

        let bind_err = |source| TcpSockError::Bind {
            addr: addr.to_string(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let registry_capacity = config.registry_capacity;
        let sock = TcpSock::new(Arc::new(on_connect), Arc::new(on_disconnect), config);

        Ok(Self {
            inner: Arc::new(ServerInner {
                sock: Arc::new(sock),
                listener: Mutex::new(Some(listener)),
                local_addr,
                auto_inc_id: AtomicU64::new(0),
                count: AtomicUsize::new(0),
                sessions: RwLock::new(HashMap::with_capacity(registry_capacity)),
                on_check_ip,
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Starts the accept loop and returns immediately.
    pub fn serve(&self) {
        let Some(listener) = self.inner.listener.lock().take() else {
            warn!(addr = %self.inner.local_addr, "server is already serving or closed");
            return;
        };

        info!(addr = %self.inner.local_addr, "tcp server listening");
        let inner = Arc::clone(&self.inner);
        self.inner.sock.spawn(inner.accept_loop(listener));
    }

    /// Stops accepting, closes every connection and waits until the accept
    /// loop and all connection loops have exited.
    pub async fn close(&self) {
        // Drop the listener if `serve` never took it.
        self.inner.listener.lock().take();
        self.inner.sock.join().await;
        info!(addr = %self.inner.local_addr, "tcp server closed");
    }

    /// Number of currently open connections.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Calls `f` for every registered session.
    ///
    /// The registry is copied before the first call, so `f` may freely
    /// `send`, `kick` or close connections. A session registered after the
    /// copy is not visited; one removed after it may still be.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(u64, &Arc<dyn TcpSession>),
    {
        for (id, session) in self.inner.snapshot() {
            f(id, &session);
        }
    }

    /// Writes `buf` to the session registered under `id`.
    ///
    /// Unknown ids are ignored: the connection may already be gone.
    pub fn send(&self, id: u64, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }

        if let Some(session) = self.session(id) {
            if let Err(e) = session.write(buf) {
                debug!(id, error = %e, "send failed");
            }
        }
    }

    /// Writes `buf` to every registered session.
    pub fn broadcast(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }

        for (id, session) in self.inner.snapshot() {
            if let Err(e) = session.write(buf) {
                debug!(id, error = %e, "broadcast failed");
            }
        }
    }

    /// Removes `id` from the registry without closing its connection.
    pub fn kick(&self, id: u64) {
        self.inner.del_session(id);
    }

    /// Session registered under `id`, if any.
    pub fn session(&self, id: u64) -> Option<Arc<dyn TcpSession>> {
        self.inner.sessions.read().get(&id).cloned()
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.sock.shutdown.cancelled() => break,
                res = listener.accept() => res,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if !self.check_conn(&peer) {
                debug!(%peer, live = self.count.load(Ordering::Acquire), "connection rejected");
                continue;
            }

            let id = self.auto_inc_id.fetch_add(1, Ordering::AcqRel) + 1;
            self.count.fetch_add(1, Ordering::AcqRel);

            let server = Arc::clone(&self);
            self.sock.spawn(async move { server.setup_conn(id, stream, peer) });
        }

        debug!(addr = %self.local_addr, "accept loop stopped");
    }

    fn check_conn(&self, peer: &SocketAddr) -> bool {
        if self.count.load(Ordering::Acquire) >= self.sock.config.max_conn {
            return false;
        }

        match &self.on_check_ip {
            Some(check) => check(peer),
            None => true,
        }
    }

    fn setup_conn(self: &Arc<Self>, id: u64, stream: TcpStream, peer: SocketAddr) {
        let server: Weak<ServerInner> = Arc::downgrade(self);
        let on_close: OnTcpDisconnect = Arc::new(move |conn: &TcpConn| {
            if let Some(server) = server.upgrade() {
                server.conn_close(conn);
            }
        });

        let conn = Arc::new(TcpConn::new(id, Arc::clone(&self.sock), stream, on_close));
        debug!(id, %peer, "connection accepted");

        let on_connect = &self.sock.on_connect;
        let session = match panic::catch_unwind(AssertUnwindSafe(|| on_connect(&conn))) {
            Ok(session) => session,
            Err(_) => {
                warn!(id, "connect callback panicked");
                conn.close();
                return;
            }
        };

        if let Some(session) = session {
            conn.set_session(Arc::clone(&session));
            self.add_session(id, session);
            // The callback itself may have closed the connection.
            if conn.is_closed() {
                self.del_session(id);
            }
        }

        conn.run();
    }

    fn conn_close(&self, conn: &TcpConn) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        (self.sock.on_disconnect)(conn);
        self.del_session(conn.id());
    }

    fn snapshot(&self) -> Vec<(u64, Arc<dyn TcpSession>)> {
        self.sessions
            .read()
            .iter()
            .map(|(id, session)| (*id, Arc::clone(session)))
            .collect()
    }

    fn add_session(&self, id: u64, session: Arc<dyn TcpSession>) {
        self.sessions.write().insert(id, session);
    }

    fn del_session(&self, id: u64) {
        if self.sessions.write().remove(&id).is_some() {
            trace!(id, "session unregistered");
        }
    }
}

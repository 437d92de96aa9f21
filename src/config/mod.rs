//! Tunables for servers, clients and the connections they spawn.
use std::time::Duration;

use crate::error::{Result, TcpSockError};

/// Default cap on live server connections.
pub const NUM_OF_CONN_MAX: usize = 10_000;
/// Default largest payload accepted by a single `write`.
pub const SEND_BUF_LEN_MAX: usize = 24 * 1024;
/// Default egress coalescing window.
pub const TCP_BUF_LEN_MAX: usize = 16 * 1024;
/// Default ingress read buffer size.
pub const RECV_BUF_LEN_MAX: usize = 16 * 1024;

/// Configuration shared by everything spawned under one owner.
///
/// Construct with [`TcpConfig::default`] and adjust with the `with_*`
/// setters:
///
/// ```rust
/// use std::time::Duration;
///
/// use tcpsock::TcpConfig;
///
/// let config = TcpConfig::default()
///     .with_max_conn(512)
///     .with_dial_timeout(Duration::from_millis(500));
/// assert_eq!(config.max_conn, 512);
/// ```
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Largest number of simultaneously open server connections.
    pub max_conn: usize,
    /// Largest payload accepted by `TcpConn::write`.
    pub max_frame_len: usize,
    /// Byte budget the egress loop coalesces into one socket write.
    pub send_window: usize,
    /// Upper bound on bytes queued but not yet written. A connection whose
    /// peer falls this far behind is closed.
    pub send_queue_limit: usize,
    /// Size of the buffer each ingress read fills.
    pub recv_buf_len: usize,
    /// How long an idle egress loop sleeps before polling its queue again.
    pub send_poll_interval: Duration,
    /// Bound on a client dial.
    pub dial_timeout: Duration,
    /// Initial capacity of the server's session registry.
    pub registry_capacity: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_conn: NUM_OF_CONN_MAX,
            max_frame_len: SEND_BUF_LEN_MAX,
            send_window: TCP_BUF_LEN_MAX,
            send_queue_limit: 4 * 1024 * 1024,
            recv_buf_len: RECV_BUF_LEN_MAX,
            send_poll_interval: Duration::from_millis(5),
            dial_timeout: Duration::from_secs(2),
            registry_capacity: 100,
        }
    }
}

impl TcpConfig {
    /// Rejects settings that would make every connection fail on its own.
    ///
    /// Called by the `try_new` constructors of the server and the client.
    pub fn validate(&self) -> Result<()> {
        if self.recv_buf_len == 0 {
            return Err(TcpSockError::InvalidConfig("recv_buf_len must be non-zero"));
        }
        if self.max_frame_len == 0 {
            return Err(TcpSockError::InvalidConfig("max_frame_len must be non-zero"));
        }
        if self.max_frame_len > self.send_queue_limit {
            return Err(TcpSockError::InvalidConfig(
                "max_frame_len must not exceed send_queue_limit",
            ));
        }
        Ok(())
    }

    pub fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_send_window(mut self, send_window: usize) -> Self {
        self.send_window = send_window;
        self
    }

    pub fn with_send_queue_limit(mut self, send_queue_limit: usize) -> Self {
        self.send_queue_limit = send_queue_limit;
        self
    }

    pub fn with_recv_buf_len(mut self, recv_buf_len: usize) -> Self {
        self.recv_buf_len = recv_buf_len;
        self
    }

    pub fn with_send_poll_interval(mut self, interval: Duration) -> Self {
        self.send_poll_interval = interval;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_registry_capacity(mut self, capacity: usize) -> Self {
        self.registry_capacity = capacity;
        self
    }
}

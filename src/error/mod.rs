//! Error type shared by connections, servers and clients.
use std::{io, time::Duration};

use thiserror::Error;

/// Errors surfaced by `tcpsock`.
///
/// Transport faults on a running connection are never reported through this
/// type. They end the connection and show up only as the disconnect callback.
/// What lands here are per-call validation failures and startup problems.
#[derive(Debug, Error)]
pub enum TcpSockError {
    /// The connection's close sequence has already started.
    #[error("connection closed")]
    ConnectionClosed,

    /// The payload handed to `write` was empty or larger than the frame limit.
    #[error("invalid data: payload of {len} bytes (allowed 1..={max})")]
    InvalidArgument {
        /// Length of the rejected payload.
        len: usize,
        /// Largest payload the connection accepts.
        max: usize,
    },

    /// A `TcpConfig` field holds a value connections cannot run with.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// A client was asked to write before `open` succeeded.
    #[error("client is not connected")]
    NotConnected,

    /// An owner was constructed with an unusable address.
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    /// The server listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the listener was asked to bind.
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The client dial failed.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        /// Address being dialed.
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The client dial did not finish in time.
    #[error("dialing {addr} timed out after {timeout:?}")]
    DialTimeout {
        /// Address being dialed.
        addr: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TcpSockError>;

use std::io;

use thiserror::Error;

use crate::handle::Role;

/// Errors returned by every operation on a [`SocketHandle`](crate::SocketHandle).
///
/// OS-level detail travels as the `source` of the variant and is also logged
/// through `tracing`; the variant alone decides what the caller does next.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Host or service lookup failed, or produced no candidate address
    #[error("could not resolve '{host}:{service}'")]
    Resolution {
        host:    String,
        service: String,
        #[source]
        source:  io::Error,
    },

    /// Every candidate address failed
    #[error("could not resolve or connect to '{target}'")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// TLS negotiation failed, client or server side
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// Socket creation, option setting or bind failed while preparing a listener
    #[error("could not bind listener on '{port}'")]
    Bind {
        port:   String,
        #[source]
        source: io::Error,
    },

    #[error("listen failed")]
    Listen(#[source] io::Error),

    /// No pending connection on a non-blocking listener
    #[error("accept would block")]
    AcceptWouldBlock,

    #[error("accept failed")]
    Accept(#[source] io::Error),

    /// No data became readable within the read window
    #[error("no data within the read window")]
    ReadTimeout,

    #[error("read failed")]
    Read(#[source] io::Error),

    /// Orderly shutdown by the peer
    #[error("peer closed the connection")]
    PeerClosed,

    /// Nothing at all could be sent
    #[error("write failed")]
    Write(#[source] io::Error),

    /// The sandbox policy forbids the operation
    #[error("operation denied by sandbox policy")]
    PolicyDenied,

    /// The handle has been closed; no OS call was attempted
    #[error("socket handle is closed")]
    Closed,

    #[error("socket handle is not connected")]
    NotConnected,

    #[error("operation not valid for a handle in state {0:?}")]
    InvalidState(Role),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    /// Certificate or key material could not be loaded
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("could not launch bridged process")]
    Spawn(#[source] io::Error),

    /// The bridged child process exited before the connection could be used
    #[error("bridged process exited after connect")]
    ChildExited,

    /// Readiness or socket option failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Whether the caller can retry with the same or a different target.
    ///
    /// `false` means the handle is unusable and a new one must be allocated.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SocketError::Resolution { .. }
                | SocketError::Connect { .. }
                | SocketError::AcceptWouldBlock
                | SocketError::Accept(_)
                | SocketError::ReadTimeout
                | SocketError::Write(_)
                | SocketError::Spawn(_)
        )
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = SocketError> = std::result::Result<T, E>;

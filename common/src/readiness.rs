use std::{io, mem::MaybeUninit, time::Duration};

use crate::{
    error::Result,
    handle::{Role, SocketHandle},
    platform_socket::{Interest, Os, SocketPlatform},
};

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Readable, a connection is pending, or an error condition is flagged
    Ready,
    /// Nothing happened before the timeout
    NotReady,
}

impl SocketHandle {
    /// Waits up to `timeout` for the descriptor to become readable (or report
    /// an error). Used by reads, `accept_timeout` and the connect path.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let socket = self.socket()?;
        let ready = Os::wait(socket, Interest::Read, timeout).map_err(|e| {
            tracing::warn!("Readiness wait failed: {}", e);
            e
        })?;
        Ok(if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        })
    }

    /// Switches blocking mode; a non-zero `timeout` also becomes the receive
    /// timeout (SO_RCVTIMEO)
    pub fn set_blocking(&mut self, blocking: bool, timeout: Duration) -> Result<()> {
        let socket = self.socket()?;
        socket.set_nonblocking(!blocking)?;
        if !timeout.is_zero() {
            socket.set_read_timeout(Some(timeout))?;
        }
        self.blocking = blocking;
        Ok(())
    }

    /// Checks whether the peer still looks alive without consuming data.
    ///
    /// Peeks one byte in non-blocking mode, then restores the previous mode.
    /// Pending data or "would block" mean alive; an orderly shutdown or an
    /// error mean gone.
    pub fn is_connected(&mut self) -> bool {
        if self.role != Role::ConnectedClient {
            return false;
        }
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        if transport.has_buffered_input() {
            return true;
        }

        let socket = transport.socket();
        if self.blocking && socket.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        let alive = match socket.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                tracing::debug!("Peer probe failed: {}", e);
                false
            }
        };
        if self.blocking {
            if let Err(e) = socket.set_nonblocking(false) {
                tracing::warn!("Failed to restore blocking mode: {}", e);
            }
        }
        alive
    }
}

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::ServerConfig;
use socket2::{SockAddr, Socket};

use crate::{
    bridge::SpawnedPeer,
    config::TransportConfig,
    error::{Result, SocketError},
    init,
    platform_socket::{Os, SocketPlatform},
    policy::{SandboxPolicy, Unrestricted},
    tls_config::ClientTrust,
    tls_stream::TlsStream,
};

/// Where a handle is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Fresh handle, no descriptor yet
    Unconnected,
    /// Connected stream, from `connect`, `accept` or an adopted descriptor
    ConnectedClient,
    /// Bound and listening; produces new handles through `accept`
    Listening,
    /// Terminal; the descriptor is gone
    Closed,
}

/// The live descriptor, plain or wrapped in an established TLS session
pub(crate) enum Transport {
    Plain(Socket),
    Tls(Box<TlsStream>),
}

impl Transport {
    pub(crate) fn socket(&self) -> &Socket {
        match self {
            Transport::Plain(socket) => socket,
            Transport::Tls(stream) => stream.socket(),
        }
    }

    pub(crate) fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => Os::send(socket, buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            Transport::Tls(stream) => stream.flush(),
        }
    }

    /// True when a read can be served without waiting on the socket
    pub(crate) fn has_buffered_input(&mut self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(stream) => stream.has_buffered_plaintext(),
        }
    }

    fn teardown(self) {
        let socket = match self {
            Transport::Plain(socket) => socket,
            Transport::Tls(mut stream) => {
                stream.send_close_notify();
                Os::shutdown_for_close(stream.socket());
                return;
            }
        };
        Os::shutdown_for_close(&socket);
    }
}

/// Exclusive owner of one transport descriptor.
///
/// A handle starts `Unconnected`, becomes either a connected stream or a
/// listener, and ends `Closed`. The descriptor is never exposed and never
/// duplicated; dropping the handle closes it.
pub struct SocketHandle {
    pub(crate) transport:     Option<Transport>,
    pub(crate) role:          Role,
    pub(crate) tls_requested: bool,
    pub(crate) local_only:    bool,
    pub(crate) blocking:      bool,
    pub(crate) peer:          Option<SockAddr>,
    pub(crate) config:        TransportConfig,
    pub(crate) policy:        Arc<dyn SandboxPolicy>,
    pub(crate) client_trust:  ClientTrust,
    /// Server context of a TLS listener, shared with every accepted handle
    pub(crate) server_tls:    Option<Arc<ServerConfig>>,
    /// Process on the far end of a bridged connection
    pub(crate) bridged:       Option<Box<dyn SpawnedPeer>>,
}

impl SocketHandle {
    /// Creates an unconnected handle. Requesting TLS runs the process-wide
    /// TLS initialization the first time.
    pub fn new(request_tls: bool) -> Self {
        Self::with_config(request_tls, TransportConfig::default())
    }

    pub fn with_config(request_tls: bool, config: TransportConfig) -> Self {
        if request_tls {
            init::ensure();
        }
        Self {
            transport: None,
            role: Role::Unconnected,
            tls_requested: request_tls,
            local_only: false,
            blocking: true,
            peer: None,
            config,
            policy: Arc::new(Unrestricted),
            client_trust: ClientTrust::default(),
            server_tls: None,
            bridged: None,
        }
    }

    /// Adopts an already connected socket as a plain `ConnectedClient`
    pub(crate) fn from_socket(socket: Socket) -> Self {
        let mut handle = Self::new(false);
        handle.peer = socket.peer_addr().ok();
        handle.transport = Some(Transport::Plain(socket));
        handle.role = Role::ConnectedClient;
        handle
    }

    /// Binds listeners to the loopback interface only
    pub fn set_local_only(&mut self, local_only: bool) {
        self.local_only = local_only;
    }

    pub fn set_policy(&mut self, policy: Arc<dyn SandboxPolicy>) {
        self.policy = policy;
    }

    /// Trust mode for the client side of TLS connects
    pub fn set_client_trust(&mut self, trust: ClientTrust) {
        self.client_trust = trust;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether an established TLS session carries the traffic
    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    pub fn tls_requested(&self) -> bool {
        self.tls_requested
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Peer address recorded when the connection was established
    pub fn peer_addr(&self) -> Option<&SockAddr> {
        self.peer.as_ref()
    }

    /// Local TCP port, mainly to find out what an ephemeral bind picked
    pub fn local_port(&self) -> Option<u16> {
        let socket = self.transport.as_ref()?.socket();
        socket.local_addr().ok()?.as_socket().map(|addr| addr.port())
    }

    /// Shuts the connection down and closes the descriptor.
    ///
    /// TLS sessions send close_notify first. Teardown happens once: later
    /// calls return [`SocketError::Closed`] without touching the OS.
    pub fn close(&mut self) -> Result<()> {
        match self.role {
            Role::Closed => return Err(SocketError::Closed),
            Role::Unconnected => {
                self.role = Role::Closed;
                return Err(SocketError::NotConnected);
            }
            Role::ConnectedClient | Role::Listening => {}
        }

        self.role = Role::Closed;
        self.peer = None;
        self.server_tls = None;
        if let Some(mut peer) = self.bridged.take() {
            // Reaps the child if it is already gone; a live one keeps running
            match peer.has_exited() {
                Ok(exited) => tracing::debug!("Bridged process exited: {}", exited),
                Err(e) => tracing::debug!("Bridged process status unknown: {}", e),
            }
        }
        match self.transport.take() {
            Some(transport) => {
                transport.teardown();
                tracing::debug!("Socket closed");
                Ok(())
            }
            None => Err(SocketError::NotConnected),
        }
    }

    /// Fails fast on closed handles
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.role {
            Role::Closed => Err(SocketError::Closed),
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_role(&self, expected: Role) -> Result<()> {
        self.ensure_open()?;
        if self.role == expected {
            Ok(())
        } else {
            Err(SocketError::InvalidState(self.role))
        }
    }

    /// The transport of a connected stream
    pub(crate) fn stream_mut(&mut self) -> Result<&mut Transport> {
        self.ensure_open()?;
        if self.role != Role::ConnectedClient {
            return Err(SocketError::NotConnected);
        }
        self.transport.as_mut().ok_or(SocketError::NotConnected)
    }

    /// The descriptor of a connected stream or a listener
    pub(crate) fn socket(&self) -> Result<&Socket> {
        self.ensure_open()?;
        self.transport
            .as_ref()
            .map(Transport::socket)
            .ok_or(SocketError::NotConnected)
    }

    /// Renders the remote endpoint for logs: `ip:port` or `unix:<path>` on
    /// POSIX, a descriptor label elsewhere
    pub fn peer_string(&self) -> Option<String> {
        let socket = self.socket().ok()?;
        Os::peer_label(socket)
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if self.transport.is_some() {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("role", &self.role)
            .field("tls", &self.is_tls())
            .field("tls_requested", &self.tls_requested)
            .field("local_only", &self.local_only)
            .field("peer", &self.peer.as_ref().and_then(SockAddr::as_socket))
            .finish()
    }
}

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_string() {
            Some(peer) => f.write_str(&peer),
            None => write!(f, "<{:?}>", self.role),
        }
    }
}

#[cfg(unix)]
impl From<std::os::fd::OwnedFd> for SocketHandle {
    /// Takes ownership of a connected stream descriptor obtained elsewhere
    fn from(fd: std::os::fd::OwnedFd) -> Self {
        Self::from_socket(Socket::from(fd))
    }
}

#[cfg(unix)]
impl std::os::fd::FromRawFd for SocketHandle {
    /// # Safety
    ///
    /// `fd` must be an open, connected stream socket not owned by anything
    /// else; the handle closes it.
    unsafe fn from_raw_fd(fd: std::os::fd::RawFd) -> Self {
        Self::from_socket(<Socket as std::os::fd::FromRawFd>::from_raw_fd(fd))
    }
}

#[cfg(windows)]
impl From<std::os::windows::io::OwnedSocket> for SocketHandle {
    fn from(socket: std::os::windows::io::OwnedSocket) -> Self {
        Self::from_socket(Socket::from(socket))
    }
}

#[cfg(windows)]
impl std::os::windows::io::FromRawSocket for SocketHandle {
    /// # Safety
    ///
    /// `sock` must be an open, connected stream socket not owned by anything
    /// else; the handle closes it.
    unsafe fn from_raw_socket(sock: std::os::windows::io::RawSocket) -> Self {
        Self::from_socket(<Socket as std::os::windows::io::FromRawSocket>::from_raw_socket(sock))
    }
}

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use rustls::ServerConnection;
use socket2::{Domain, Protocol as IpProtocol, Socket, Type};

use crate::{
    config::{LISTEN_BACKLOG, LISTEN_LINGER, LISTEN_SEND_BUFFER},
    connect::port_by_name,
    error::{Result, SocketError},
    handle::{Role, SocketHandle, Transport},
    readiness::Readiness,
    tls_config::server_config_from_bundle,
    tls_stream::TlsStream,
};

impl SocketHandle {
    /// Turns an unconnected handle into a TCP listener on `port`.
    ///
    /// `port` is a number or a service name; `0` picks an ephemeral port
    /// (see [`local_port`](Self::local_port)). Binds to loopback when the
    /// handle is local-only. A TLS handle loads its certificate chain and key
    /// from `cert_bundle` here and handshakes in [`accept`](Self::accept).
    pub fn listen(&mut self, port: &str, cert_bundle: Option<&Path>) -> Result<()> {
        self.ensure_role(Role::Unconnected)?;
        if self.policy.is_restricted() {
            tracing::warn!("Sandbox policy denies listening on {}", port);
            return Err(SocketError::PolicyDenied);
        }

        let bind_error = |source| SocketError::Bind {
            port: port.to_string(),
            source,
        };
        let port_number = port_by_name(port).ok_or_else(|| {
            bind_error(io::Error::new(io::ErrorKind::InvalidInput, "unknown port or service"))
        })?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(IpProtocol::TCP))
            .map_err(bind_error)?;
        socket.set_linger(Some(LISTEN_LINGER)).map_err(bind_error)?;
        socket
            .set_send_buffer_size(LISTEN_SEND_BUFFER)
            .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;

        let ip = if self.local_only {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        socket
            .bind(&SocketAddr::from((ip, port_number)).into())
            .map_err(|e| {
                tracing::error!("Bind to {}:{} failed: {}", ip, port_number, e);
                bind_error(e)
            })?;
        socket.listen(LISTEN_BACKLOG).map_err(SocketError::Listen)?;

        let server_tls = if self.tls_requested {
            let bundle = cert_bundle.ok_or_else(|| {
                SocketError::Tls("a TLS listener needs a certificate bundle".to_string())
            })?;
            Some(server_config_from_bundle(bundle).map_err(|e| {
                tracing::error!("TLS context for listener failed: {}", e);
                e
            })?)
        } else {
            None
        };

        self.transport = Some(Transport::Plain(socket));
        self.server_tls = server_tls;
        self.role = Role::Listening;
        tracing::info!(
            "Listening on {}:{}{}",
            ip,
            self.local_port().unwrap_or(port_number),
            if self.server_tls.is_some() { " (TLS)" } else { "" }
        );
        Ok(())
    }

    /// Listens on a UNIX domain socket at `path`, replacing a stale socket
    /// file. UNIX listeners are always plain.
    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: impl AsRef<Path>) -> Result<()> {
        use std::{fs, os::unix::fs::PermissionsExt};

        use socket2::SockAddr;

        use crate::config::UNIX_LISTEN_BACKLOG;

        let path = path.as_ref();
        self.ensure_role(Role::Unconnected)?;
        if self.policy.is_restricted() {
            tracing::warn!("Sandbox policy denies listening on {:?}", path);
            return Err(SocketError::PolicyDenied);
        }
        if self.tls_requested {
            tracing::warn!("UNIX listener at {:?} will not use TLS", path);
        }

        let bind_error = |source| SocketError::Bind {
            port: path.display().to_string(),
            source,
        };
        match fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed stale socket file {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(bind_error)?;
        socket
            .bind(&SockAddr::unix(path).map_err(bind_error)?)
            .map_err(bind_error)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o777)).map_err(bind_error)?;
        socket.listen(UNIX_LISTEN_BACKLOG).map_err(SocketError::Listen)?;

        self.transport = Some(Transport::Plain(socket));
        self.server_tls = None;
        self.role = Role::Listening;
        tracing::info!("Listening on unix:{}", path.display());
        Ok(())
    }

    /// Accepts one connection as a new, independent handle.
    ///
    /// Blocks until a peer arrives. TLS listeners complete the server
    /// handshake before returning, giving the peer one read window per read;
    /// a failed or stalled handshake closes the new socket and leaves the
    /// listener usable.
    pub fn accept(&mut self) -> Result<SocketHandle> {
        self.ensure_role(Role::Listening)?;
        let listener = self.socket()?;

        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!("No pending connection");
                return Err(SocketError::AcceptWouldBlock);
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                return Err(SocketError::Accept(e));
            }
        };
        socket.set_nonblocking(false).map_err(SocketError::Accept)?;

        let transport = match &self.server_tls {
            Some(config) => {
                // A silent peer must not hold the listener past one read window
                let window = self.config.read_window;
                if !window.is_zero() {
                    socket.set_read_timeout(Some(window)).map_err(SocketError::Accept)?;
                }
                let session = ServerConnection::new(Arc::clone(config))
                    .map_err(|e| SocketError::Handshake(io::Error::other(e)))?;
                let stream = TlsStream::from_server(socket, session).map_err(|e| {
                    tracing::error!("TLS server handshake failed: {}", e);
                    SocketError::Handshake(e)
                })?;
                stream
                    .socket()
                    .set_read_timeout(None)
                    .map_err(SocketError::Accept)?;
                Transport::Tls(Box::new(stream))
            }
            None => Transport::Plain(socket),
        };

        let mut client = SocketHandle::with_config(self.server_tls.is_some(), self.config);
        client.local_only = self.local_only;
        client.policy = Arc::clone(&self.policy);
        client.client_trust = self.client_trust.clone();
        client.peer = Some(peer);
        client.transport = Some(transport);
        client.role = Role::ConnectedClient;
        tracing::debug!("Accepted connection from {}", client);
        Ok(client)
    }

    /// Waits up to `timeout` for a pending connection; `None` when none
    /// arrived in time
    pub fn accept_timeout(&mut self, timeout: Duration) -> Result<Option<SocketHandle>> {
        self.ensure_role(Role::Listening)?;
        if self.wait_ready(timeout)? == Readiness::NotReady {
            return Ok(None);
        }
        match self.accept() {
            Ok(client) => Ok(Some(client)),
            Err(SocketError::AcceptWouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
    time::Duration,
};

use rustls::ClientConnection;
use socket2::{Domain, Protocol as IpProtocol, SockAddr, Socket, Type};

use crate::{
    error::{Result, SocketError},
    handle::{Role, SocketHandle, Transport},
    platform_socket::{Interest, Os, SocketPlatform},
    tls_config::{client_config, server_name_for},
    tls_stream::TlsStream,
};

/// Transport family for [`SocketHandle::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    /// UNIX domain stream socket; the host is the filesystem path
    Unix,
    /// Reserved, always rejected
    Udp,
}

/// Resolves a port given as a number or a service name.
///
/// Numbers are decimal or `0x` hexadecimal; anything else is looked up in the
/// system services database for TCP.
pub fn port_by_name(name: &str) -> Option<u16> {
    parse_port_number(name).or_else(|| Os::service_port(name.trim()))
}

fn parse_port_number(text: &str) -> Option<u16> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl SocketHandle {
    /// Connects an unconnected handle.
    ///
    /// TCP tries every resolved address in order; a zero `timeout` means a
    /// plain blocking connect. With TLS requested the client handshake runs
    /// before the handle becomes connected, and a failed handshake leaves it
    /// unconnected with nothing open.
    pub fn connect(
        &mut self,
        host: &str,
        service: &str,
        protocol: Protocol,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_role(Role::Unconnected)?;

        let socket = match protocol {
            Protocol::Tcp => connect_tcp(host, service, timeout)?,
            Protocol::Unix => connect_unix(Path::new(host))?,
            Protocol::Udp => return Err(SocketError::Unsupported("UDP transport")),
        };
        let peer = socket.peer_addr().ok();

        let transport = if self.tls_requested {
            let config = client_config(&self.client_trust)?;
            let server_name = server_name_for(host)?;
            let session = ClientConnection::new(config, server_name)
                .map_err(|e| SocketError::Handshake(io::Error::other(e)))?;
            let stream = TlsStream::from_client(socket, session).map_err(|e| {
                tracing::error!("TLS client handshake with {} failed: {}", host, e);
                SocketError::Handshake(e)
            })?;
            Transport::Tls(Box::new(stream))
        } else {
            Transport::Plain(socket)
        };

        self.transport = Some(transport);
        self.peer = peer;
        self.blocking = true;
        self.role = Role::ConnectedClient;
        tracing::info!(
            "Connected to {} ({:?}{})",
            self.peer_string().unwrap_or_else(|| host.to_string()),
            protocol,
            if self.is_tls() { ", TLS" } else { "" }
        );
        Ok(())
    }
}

fn connect_tcp(host: &str, service: &str, timeout: Duration) -> Result<Socket> {
    let resolution_error = |source| SocketError::Resolution {
        host: host.to_string(),
        service: service.to_string(),
        source,
    };

    let port = port_by_name(service).ok_or_else(|| {
        resolution_error(io::Error::new(io::ErrorKind::InvalidInput, "unknown port or service"))
    })?;
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(resolution_error)?
        .collect();
    if candidates.is_empty() {
        return Err(resolution_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses found",
        )));
    }

    let mut last_error = None;
    for addr in candidates {
        match connect_candidate(addr, timeout) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(SocketError::Connect {
        target: format!("{host}:{service}"),
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no candidate")),
    })
}

/// One connect attempt. The socket is dropped, and thereby closed, on every
/// error path.
fn connect_candidate(addr: SocketAddr, timeout: Duration) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(IpProtocol::TCP))?;
    socket.set_tcp_nodelay(true)?;
    let target = SockAddr::from(addr);

    if timeout.is_zero() {
        socket.connect(&target)?;
        return Ok(socket);
    }

    socket.set_nonblocking(true)?;
    socket.set_read_timeout(Some(timeout))?;
    match socket.connect(&target) {
        Ok(()) => {}
        Err(e) if Os::connect_in_progress(&e) => {
            if !Os::wait(&socket, Interest::Write, timeout)? {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
            if let Some(e) = socket.take_error()? {
                return Err(e);
            }
        }
        Err(e) => return Err(e),
    }
    socket.set_nonblocking(false)?;
    Ok(socket)
}

fn connect_unix(path: &Path) -> Result<Socket> {
    let connect_error = |source| SocketError::Connect {
        target: format!("unix:{}", path.display()),
        source,
    };

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(connect_error)?;
    let addr = SockAddr::unix(path).map_err(connect_error)?;
    socket.connect(&addr).map_err(|e| {
        tracing::debug!("Connect to {:?} failed: {}", path, e);
        connect_error(e)
    })?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn numeric_ports_parse() {
        assert_eq!(port_by_name("9090"), Some(9090));
        assert_eq!(port_by_name(" 0x1F90 "), Some(0x1f90));
        assert_eq!(port_by_name("0"), Some(0));
        assert_eq!(port_by_name("70000"), None);
        assert_eq!(port_by_name("no-such-service-here"), None);
    }

    #[test]
    fn udp_is_rejected() {
        let mut handle = SocketHandle::new(false);
        let err = handle
            .connect("127.0.0.1", "9", Protocol::Udp, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SocketError::Unsupported(_)));
        assert_eq!(handle.role(), Role::Unconnected);
    }

    #[test]
    fn refused_connect_is_a_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut handle = SocketHandle::new(false);
        let err = handle
            .connect("127.0.0.1", &port.to_string(), Protocol::Tcp, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SocketError::Connect { .. }));
        assert_eq!(handle.role(), Role::Unconnected);
    }

    #[test]
    fn unknown_service_is_a_resolution_error() {
        let mut handle = SocketHandle::new(false);
        let err = handle
            .connect("127.0.0.1", "no-such-service-here", Protocol::Tcp, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SocketError::Resolution { .. }));
    }

    #[test]
    fn timed_connect_restores_blocking_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let mut handle = SocketHandle::new(false);
        handle
            .connect("127.0.0.1", &port, Protocol::Tcp, Duration::from_secs(2))
            .unwrap();
        assert_eq!(handle.role(), Role::ConnectedClient);
        assert_eq!(
            handle.peer_string().unwrap(),
            listener.local_addr().unwrap().to_string()
        );

        // Blocking again: a raw recv sits out the receive timeout
        handle.socket().unwrap().set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let started = std::time::Instant::now();
        let mut buf = [0u8; 1];
        assert!(handle.transport.as_mut().unwrap().recv(&mut buf).is_err());
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn connect_twice_is_invalid() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let mut handle = SocketHandle::new(false);
        handle.connect("127.0.0.1", &port, Protocol::Tcp, Duration::ZERO).unwrap();
        let err = handle
            .connect("127.0.0.1", &port, Protocol::Tcp, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SocketError::InvalidState(Role::ConnectedClient)));
    }

    #[cfg(unix)]
    #[test]
    fn unix_connect_to_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = SocketHandle::new(false);
        let err = handle
            .connect(
                dir.path().join("absent.sock").to_str().unwrap(),
                "",
                Protocol::Unix,
                Duration::ZERO,
            )
            .unwrap_err();
        assert!(matches!(err, SocketError::Connect { .. }));
        assert_eq!(handle.role(), Role::Unconnected);
    }
}

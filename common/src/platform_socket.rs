//! Per-OS socket capabilities.
//!
//! Everything that differs between POSIX and Windows sockets goes through
//! [`SocketPlatform`]; the rest of the crate only ever calls `Os::...`, and
//! the implementation is picked at build time.

use std::{io, time::Duration};

use socket2::Socket;

/// What a bounded wait is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    /// Readable data, a pending connection, or an error/hangup
    Read,
    /// Send capacity, a completed connect, or an error
    Write,
}

pub(crate) trait SocketPlatform {
    /// Waits up to `timeout` for `interest`. Error and hangup conditions count
    /// as ready so the following call surfaces them.
    fn wait(socket: &Socket, interest: Interest, timeout: Duration) -> io::Result<bool>;

    /// Whether a non-blocking connect returned "started, not finished yet"
    fn connect_in_progress(err: &io::Error) -> bool;

    /// Sends one buffer without raising SIGPIPE where the OS would
    fn send(socket: &Socket, buf: &[u8]) -> io::Result<usize>;

    /// Tears down both directions ahead of the descriptor being closed
    fn shutdown_for_close(socket: &Socket);

    /// Human readable peer label for diagnostics
    fn peer_label(socket: &Socket) -> Option<String>;

    /// Port for a service name from the system services database
    fn service_port(name: &str) -> Option<u16>;
}

#[cfg(unix)]
pub(crate) type Os = Posix;

#[cfg(windows)]
pub(crate) type Os = WinSock;

fn timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

#[cfg(unix)]
pub(crate) struct Posix;

#[cfg(unix)]
impl SocketPlatform for Posix {
    fn wait(socket: &Socket, interest: Interest, timeout: Duration) -> io::Result<bool> {
        use std::os::fd::AsFd;

        use nix::{
            errno::Errno,
            poll::{poll, PollFd, PollFlags, PollTimeout},
        };

        let events = match interest {
            Interest::Read => PollFlags::POLLIN | PollFlags::POLLPRI,
            Interest::Write => PollFlags::POLLOUT,
        };
        let timeout = PollTimeout::try_from(timeout_millis(timeout)).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(socket.as_fd(), events)];

        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn connect_in_progress(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
    }

    fn send(socket: &Socket, buf: &[u8]) -> io::Result<usize> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        const FLAGS: libc::c_int = 0;

        socket.send_with_flags(buf, FLAGS)
    }

    fn shutdown_for_close(socket: &Socket) {
        if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
            // Peers that already went away leave ENOTCONN behind
            tracing::trace!("shutdown before close: {}", e);
        }
    }

    fn peer_label(socket: &Socket) -> Option<String> {
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!("getpeername failed: {}", e);
                return None;
            }
        };

        if let Some(inet) = addr.as_socket() {
            return Some(inet.to_string());
        }
        match addr.as_pathname() {
            Some(path) => Some(format!("unix:{}", path.display())),
            None => Some("unix:unnamed".to_string()),
        }
    }

    fn service_port(name: &str) -> Option<u16> {
        let name = std::ffi::CString::new(name).ok()?;

        // SAFETY: both arguments are valid NUL-terminated strings. The returned
        // pointer is either null or points to a static servent that stays valid
        // until the next getservbyname call on this thread; s_port is copied out
        // before returning.
        let port = unsafe {
            let entry = libc::getservbyname(name.as_ptr(), b"tcp\0".as_ptr().cast());
            if entry.is_null() {
                return None;
            }
            (*entry).s_port
        };

        // s_port holds the port in network byte order in its low 16 bits
        match u16::from_be(port as u16) {
            0 => None,
            port => Some(port),
        }
    }
}

#[cfg(windows)]
pub(crate) struct WinSock;

#[cfg(windows)]
impl SocketPlatform for WinSock {
    fn wait(socket: &Socket, interest: Interest, timeout: Duration) -> io::Result<bool> {
        use std::os::windows::io::AsRawSocket;

        use windows_sys::Win32::Networking::WinSock::{
            WSAPoll, POLLRDBAND, POLLRDNORM, POLLWRNORM, SOCKET, SOCKET_ERROR, WSAPOLLFD,
        };

        let events = match interest {
            Interest::Read => POLLRDNORM | POLLRDBAND,
            Interest::Write => POLLWRNORM,
        };
        let mut fd = WSAPOLLFD {
            fd: socket.as_raw_socket() as SOCKET,
            events,
            revents: 0,
        };

        // SAFETY: `fd` is a single valid WSAPOLLFD on the stack and the count
        // passed matches. The socket stays open for the duration of the call.
        let ret = unsafe { WSAPoll(&mut fd, 1, timeout_millis(timeout)) };
        if ret == SOCKET_ERROR {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret > 0)
        }
    }

    fn connect_in_progress(err: &io::Error) -> bool {
        // WSAEWOULDBLOCK surfaces as WouldBlock
        err.kind() == io::ErrorKind::WouldBlock
    }

    fn send(socket: &Socket, buf: &[u8]) -> io::Result<usize> {
        socket.send(buf)
    }

    fn shutdown_for_close(socket: &Socket) {
        use std::mem::MaybeUninit;

        // closesocket discards unsent data, so half-close and drain briefly first
        if socket.shutdown(std::net::Shutdown::Write).is_err() {
            return;
        }
        if !matches!(
            Self::wait(socket, Interest::Read, Duration::from_millis(250)),
            Ok(true)
        ) {
            return;
        }
        let mut scratch = [MaybeUninit::<u8>::uninit(); 64];
        while let Ok(n) = socket.recv(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }

    fn peer_label(socket: &Socket) -> Option<String> {
        use std::os::windows::io::AsRawSocket;

        Some(format!("fd{}", socket.as_raw_socket()))
    }

    fn service_port(name: &str) -> Option<u16> {
        use windows_sys::Win32::Networking::WinSock::getservbyname;

        let name = std::ffi::CString::new(name).ok()?;

        // SAFETY: both arguments are valid NUL-terminated strings; the returned
        // SERVENT is owned by Winsock and only read before returning.
        let port = unsafe {
            let entry = getservbyname(name.as_ptr().cast(), b"tcp\0".as_ptr());
            if entry.is_null() {
                return None;
            }
            (*entry).s_port
        };

        match u16::from_be(port as u16) {
            0 => None,
            port => Some(port),
        }
    }
}

use std::io::{self, Read, Write};

use rustls::{ClientConnection, Connection, ServerConnection};
use socket2::Socket;

/// Synchronous TLS session bound to one socket.
///
/// Constructed only through a completed handshake, so holding a `TlsStream`
/// means the session is usable.
pub struct TlsStream {
    socket: Socket,
    tls:    Connection,
}

impl TlsStream {
    /// Wraps an accepted socket and completes the server handshake.
    ///
    /// On failure the socket is dropped, which closes it.
    pub fn from_server(socket: Socket, tls: ServerConnection) -> io::Result<Self> {
        let mut stream = Self {
            socket,
            tls: Connection::Server(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Wraps a connected socket and completes the client handshake.
    ///
    /// On failure the socket is dropped, which closes it.
    pub fn from_client(socket: Socket, tls: ClientConnection) -> io::Result<Self> {
        let mut stream = Self {
            socket,
            tls: Connection::Client(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    fn complete_handshake(&mut self) -> io::Result<()> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls.write_tls(&mut self.socket)?;
            }
            if self.tls.wants_read() {
                if self.tls.read_tls(&mut self.socket)? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    ));
                }
                if let Err(e) = self.tls.process_new_packets() {
                    // Push the alert describing the failure before giving up
                    let _ = self.tls.write_tls(&mut self.socket);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }
        // Flush whatever the last handshake flight left behind
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        Ok(())
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Whether decrypted bytes are already waiting, so a read would not touch
    /// the socket
    pub fn has_buffered_plaintext(&mut self) -> bool {
        match self.tls.process_new_packets() {
            Ok(state) => state.plaintext_bytes_to_read() > 0,
            Err(_) => false,
        }
    }

    /// Queues close_notify and pushes it out, best effort
    pub fn send_close_notify(&mut self) {
        self.tls.send_close_notify();
        while self.tls.wants_write() {
            if let Err(e) = self.tls.write_tls(&mut self.socket) {
                tracing::debug!("close_notify not delivered: {}", e);
                break;
            }
        }
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            // Records carrying no application data (tickets, key updates)
            // leave the reader empty; keep pulling until plaintext shows up
            if self.tls.read_tls(&mut self.socket)? == 0 {
                return Ok(0);
            }
            self.tls
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;

        // Push ciphertext to the socket (ignore WouldBlock in non-blocking mode)
        while self.tls.wants_write() {
            if let Err(e) = self.tls.write_tls(&mut self.socket) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    return Err(e);
                }
                break;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;

        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        self.socket.flush()
    }
}

use std::{fmt, io};

use crate::{
    config::PRINTF_LIMIT,
    error::{Result, SocketError},
    handle::SocketHandle,
    platform_socket::{Interest, Os, SocketPlatform},
};

impl SocketHandle {
    /// Sends `buf` in chunks of at most `write_chunk` bytes.
    ///
    /// Stops at the first chunk that sends nothing or fails. Returns the full
    /// length on success or the number of bytes that reached the OS before
    /// the failure; only a failure before the first byte is an error, so the
    /// caller can resume from the returned offset.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let chunk = self.config.write_chunk.max(1);
        let transport = self.stream_mut()?;

        let mut sent = 0;
        while sent < buf.len() {
            let end = buf.len().min(sent + chunk);
            match transport.send(&buf[sent..end]) {
                Ok(0) => {
                    tracing::debug!("Send accepted no bytes after {} of {}", sent, buf.len());
                    if sent == 0 {
                        return Err(SocketError::Write(io::ErrorKind::WriteZero.into()));
                    }
                    break;
                }
                Ok(n) => sent += n,
                Err(e) => {
                    tracing::debug!("Send failed after {} of {} bytes: {}", sent, buf.len(), e);
                    if sent == 0 {
                        return Err(SocketError::Write(e));
                    }
                    break;
                }
            }
        }
        Ok(sent)
    }

    /// Writes a string as-is
    pub fn puts(&mut self, text: &str) -> Result<usize> {
        self.write(text.as_bytes())
    }

    /// Formats and writes, truncating the text to fit the printf buffer.
    ///
    /// ```no_run
    /// # fn demo(handle: &mut wiresock_common::SocketHandle) -> wiresock_common::Result<()> {
    /// handle.printf(format_args!("seek 0x{:x}\n", 0x4000))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn printf(&mut self, args: fmt::Arguments<'_>) -> Result<usize> {
        let mut text = fmt::format(args);
        // Leaves room for the terminator the fixed buffer always reserved
        if text.len() >= PRINTF_LIMIT {
            let mut end = PRINTF_LIMIT - 1;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        self.write(text.as_bytes())
    }

    /// Waits up to the read window for data, then performs exactly one read.
    ///
    /// May return fewer bytes than `buf` holds. An orderly close by the peer
    /// is [`SocketError::PeerClosed`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let window = self.config.read_window;
        let transport = self.stream_mut()?;
        if buf.is_empty() {
            return Ok(0);
        }

        if !transport.has_buffered_input() {
            match Os::wait(transport.socket(), Interest::Read, window) {
                Ok(true) => {}
                Ok(false) => return Err(SocketError::ReadTimeout),
                Err(e) => {
                    tracing::warn!("Readiness wait before read failed: {}", e);
                    return Err(SocketError::Read(e));
                }
            }
        }

        match transport.recv(buf) {
            Ok(0) => Err(SocketError::PeerClosed),
            Ok(n) => Ok(n),
            Err(e) => {
                tracing::debug!("Read failed: {}", e);
                Err(SocketError::Read(e))
            }
        }
    }

    /// Reads until `len` bytes arrived or a read fails; the result may be
    /// short
    pub fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        self.stream_mut()?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) => {
                    tracing::debug!("Block read stopped at {} of {} bytes: {}", filled, len, e);
                    break;
                }
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Reads one line, byte by byte, without its CR or LF terminator.
    ///
    /// Stops at the terminator, after `max_len` bytes, or when a read fails.
    /// A failure with nothing read is returned as the error; a failure after
    /// some bytes yields the partial line.
    pub fn read_line(&mut self, max_len: usize) -> Result<String> {
        self.stream_mut()?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < max_len {
            match self.read(&mut byte) {
                Ok(_) if byte[0] == b'\r' || byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) if line.is_empty() => return Err(e),
                Err(e) => {
                    tracing::debug!("Line ended early after {} bytes: {}", line.len(), e);
                    break;
                }
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Reads everything until the peer closes or goes quiet for a read
    /// window. `None` when nothing arrived at all.
    pub fn slurp(&mut self) -> Result<Option<Vec<u8>>> {
        let block = self.config.slurp_block.max(1);
        self.stream_mut()?;

        let mut data = Vec::with_capacity(block);
        loop {
            let start = data.len();
            data.resize(start + block, 0);
            match self.read(&mut data[start..]) {
                Ok(n) => data.truncate(start + n),
                Err(e) => {
                    data.truncate(start);
                    tracing::debug!("Slurp finished with {} bytes: {}", start, e);
                    break;
                }
            }
        }

        Ok(if data.is_empty() { None } else { Some(data) })
    }

    /// Pushes buffered TLS records to the socket; nothing to do for plain
    /// transports
    pub fn flush(&mut self) -> Result<()> {
        let transport = self.stream_mut()?;
        transport.flush().map_err(SocketError::Write)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        io::{Read, Write},
        os::{fd::OwnedFd, unix::net::UnixStream},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::config::TransportConfig;

    fn pair() -> (SocketHandle, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (SocketHandle::from(OwnedFd::from(ours)), theirs)
    }

    fn pair_with(config: TransportConfig) -> (SocketHandle, UnixStream) {
        let (mut handle, peer) = pair();
        handle.config = config;
        (handle, peer)
    }

    #[test]
    fn write_sends_everything_in_small_chunks() {
        let (mut handle, mut peer) = pair_with(TransportConfig::new().with_write_chunk(3));
        let payload = b"0123456789abcdef";

        assert_eq!(handle.write(payload).unwrap(), payload.len());
        let mut received = vec![0u8; payload.len()];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received, payload);
    }

    #[test]
    fn write_reports_exact_partial_count() {
        let (mut handle, mut peer) = pair();
        // Nobody reads, so a non-blocking send stops once the buffer fills
        handle.set_blocking(false, Duration::ZERO).unwrap();
        let payload = vec![0x5au8; 8 * 1024 * 1024];

        let sent = handle.write(&payload).unwrap();
        assert!(sent > 0);
        assert!(sent < payload.len());

        peer.set_nonblocking(true).unwrap();
        let mut received = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(received, sent);
    }

    #[test]
    fn write_of_nothing_is_zero() {
        let (mut handle, _peer) = pair();
        assert_eq!(handle.write(b"").unwrap(), 0);
    }

    #[test]
    fn write_to_vanished_peer_fails() {
        crate::init::ensure();
        let (mut handle, peer) = pair();
        drop(peer);
        assert!(matches!(handle.write(b"lost"), Err(SocketError::Write(_))));
    }

    #[test]
    fn read_times_out_within_window() {
        let (mut handle, _peer) =
            pair_with(TransportConfig::new().with_read_window(Duration::from_millis(50)));
        let mut buf = [0u8; 4];
        assert!(matches!(handle.read(&mut buf), Err(SocketError::ReadTimeout)));
    }

    #[test]
    fn read_returns_what_is_available() {
        let (mut handle, mut peer) = pair();
        peer.write_all(b"ab").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(handle.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn read_after_peer_close_fails() {
        let (mut handle, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 4];
        assert!(matches!(handle.read(&mut buf), Err(SocketError::PeerClosed)));
    }

    #[test]
    fn read_block_gathers_trickled_data() {
        let (mut handle, mut peer) = pair();
        let writer = thread::spawn(move || {
            for part in [&b"he"[..], b"ll", b"o!"] {
                peer.write_all(part).unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            peer
        });

        assert_eq!(handle.read_block(6).unwrap(), b"hello!");
        writer.join().unwrap();
    }

    #[test]
    fn read_block_is_short_when_peer_closes() {
        let (mut handle, mut peer) = pair();
        peer.write_all(b"abc").unwrap();
        drop(peer);
        assert_eq!(handle.read_block(10).unwrap(), b"abc");
    }

    #[test]
    fn read_line_strips_crlf() {
        let (mut handle, mut peer) = pair();
        peer.write_all(b"hello\r\n").unwrap();
        assert_eq!(handle.read_line(64).unwrap(), "hello");
    }

    #[test]
    fn read_line_returns_partial_line_on_close() {
        let (mut handle, mut peer) = pair();
        peer.write_all(b"partial").unwrap();
        drop(peer);
        assert_eq!(handle.read_line(64).unwrap(), "partial");
    }

    #[test]
    fn read_line_fails_on_immediate_close() {
        let (mut handle, peer) = pair();
        drop(peer);
        assert!(matches!(handle.read_line(64), Err(SocketError::PeerClosed)));
    }

    #[test]
    fn read_line_stops_at_max_len() {
        let (mut handle, mut peer) = pair();
        peer.write_all(b"abcdefgh\n").unwrap();
        assert_eq!(handle.read_line(4).unwrap(), "abcd");
        assert_eq!(handle.read_line(64).unwrap(), "efgh");
    }

    #[test]
    fn slurp_collects_until_close() {
        let (mut handle, mut peer) =
            pair_with(TransportConfig::new().with_slurp_block(4));
        peer.write_all(b"0123456789").unwrap();
        drop(peer);
        assert_eq!(handle.slurp().unwrap().unwrap(), b"0123456789");
    }

    #[test]
    fn slurp_of_nothing_is_none() {
        let (mut handle, peer) = pair();
        drop(peer);
        assert!(handle.slurp().unwrap().is_none());
    }

    #[test]
    fn printf_formats_and_truncates() {
        let (mut handle, mut peer) = pair();
        assert_eq!(handle.printf(format_args!("x={} y={}", 1, 2)).unwrap(), 7);

        let long = "z".repeat(PRINTF_LIMIT * 2);
        assert_eq!(handle.printf(format_args!("{long}")).unwrap(), PRINTF_LIMIT - 1);

        let mut head = [0u8; 7];
        peer.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"x=1 y=2");
    }

    #[test]
    fn flush_is_noop_for_plain() {
        let (mut handle, _peer) = pair();
        handle.flush().unwrap();
    }

    #[test]
    fn io_on_unconnected_handle_is_rejected() {
        let mut handle = SocketHandle::new(false);
        assert!(matches!(handle.write(b"x"), Err(SocketError::NotConnected)));
        assert!(matches!(handle.read_line(8), Err(SocketError::NotConnected)));
        assert!(matches!(handle.slurp(), Err(SocketError::NotConnected)));
    }

    #[test]
    fn io_on_closed_handle_fails_fast() {
        let (mut handle, _peer) = pair();
        handle.close().unwrap();
        assert!(matches!(handle.write(b"x"), Err(SocketError::Closed)));
        assert!(matches!(handle.read_block(4), Err(SocketError::Closed)));
        assert!(matches!(handle.flush(), Err(SocketError::Closed)));
    }
}

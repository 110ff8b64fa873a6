use std::{env, ops::Range, path::PathBuf, time::Duration};

/// Bytes handed to the OS per send call. Kept near a conservative MTU so
/// stacks and TLS layers that accept partial buffers never see a huge write.
pub const WRITE_CHUNK: usize = 1500;

/// Growth increment used by [`SocketHandle::slurp`](crate::SocketHandle::slurp)
pub const SLURP_BLOCK: usize = 4096;

/// Maximum formatted length accepted by [`SocketHandle::printf`](crate::SocketHandle::printf)
pub const PRINTF_LIMIT: usize = 4096;

pub const LISTEN_BACKLOG: i32 = 32;
pub const UNIX_LISTEN_BACKLOG: i32 = 1;

/// Send buffer forced on TCP listeners; works around truncation-on-close
/// seen with some peer stacks.
pub const LISTEN_SEND_BUFFER: usize = 1500;

/// Linger grace applied to TCP listeners
pub const LISTEN_LINGER: Duration = Duration::from_secs(1);

/// How long a single read waits for the descriptor to become readable
pub const DEFAULT_READ_WINDOW: Duration = Duration::from_secs(2);

/// Ports the process bridge picks its rendezvous port from
pub const BRIDGE_PORT_RANGE: Range<u16> = 2000..4000;

/// Delay between launching a bridged process and connecting to it
pub const BRIDGE_SETTLE: Duration = Duration::from_secs(1);

/// Delay between connecting to a bridged process and checking whether it
/// already exited
pub const BRIDGE_EXIT_PROBE: Duration = Duration::from_secs(4);

const CERTS_DIR_ENV: &str = "WIRESOCK_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";
const BUNDLE_FILE: &str = "bundle.pem";

const READ_WINDOW_ENV: &str = "WIRESOCK_READ_WINDOW_MS";
const WRITE_CHUNK_ENV: &str = "WIRESOCK_WRITE_CHUNK";
const BRIDGE_SETTLE_ENV: &str = "WIRESOCK_BRIDGE_SETTLE_MS";
const BRIDGE_EXIT_PROBE_ENV: &str = "WIRESOCK_BRIDGE_EXIT_PROBE_MS";

fn get_certs_dir() -> PathBuf {
    env::var(CERTS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERTS_DIR))
}

/// Location of the PEM bundle (certificate chain + private key) used by TLS
/// listeners
pub struct CertBundlePath {
    pub bundle_path: PathBuf,
}

impl CertBundlePath {
    /// Resolves `bundle.pem` inside `$WIRESOCK_CERTS_DIR`, or `./certs`
    pub fn new() -> Self {
        Self {
            bundle_path: get_certs_dir().join(BUNDLE_FILE),
        }
    }
}

impl Default for CertBundlePath {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-handle tunables for the I/O primitives and the process bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bounded wait before each individual read
    pub read_window:       Duration,
    /// Chunk size for [`SocketHandle::write`](crate::SocketHandle::write)
    pub write_chunk:       usize,
    /// Increment for [`SocketHandle::slurp`](crate::SocketHandle::slurp)
    pub slurp_block:       usize,
    /// Sleep between launching a bridged process and connecting to it
    pub bridge_settle:     Duration,
    /// Sleep between connecting to a bridged process and probing whether it exited
    pub bridge_exit_probe: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_window:       DEFAULT_READ_WINDOW,
            write_chunk:       WRITE_CHUNK,
            slurp_block:       SLURP_BLOCK,
            bridge_settle:     BRIDGE_SETTLE,
            bridge_exit_probe: BRIDGE_EXIT_PROBE,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `WIRESOCK_READ_WINDOW_MS`, `WIRESOCK_WRITE_CHUNK`,
    /// `WIRESOCK_BRIDGE_SETTLE_MS` and `WIRESOCK_BRIDGE_EXIT_PROBE_MS`.
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        if let Some(ms) = env_number(READ_WINDOW_ENV) {
            config.read_window = Duration::from_millis(ms);
        }
        if let Some(chunk) = env_number(WRITE_CHUNK_ENV).filter(|c| *c > 0) {
            config.write_chunk = chunk as usize;
        }
        if let Some(ms) = env_number(BRIDGE_SETTLE_ENV) {
            config.bridge_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number(BRIDGE_EXIT_PROBE_ENV) {
            config.bridge_exit_probe = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_read_window(mut self, window: Duration) -> Self {
        self.read_window = window;
        self
    }

    /// Zero is clamped to one byte
    pub fn with_write_chunk(mut self, chunk: usize) -> Self {
        self.write_chunk = chunk.max(1);
        self
    }

    pub fn with_slurp_block(mut self, block: usize) -> Self {
        self.slurp_block = block.max(1);
        self
    }

    pub fn with_bridge_settle(mut self, settle: Duration) -> Self {
        self.bridge_settle = settle;
        self
    }

    pub fn with_bridge_exit_probe(mut self, delay: Duration) -> Self {
        self.bridge_exit_probe = delay;
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = TransportConfig::default();
        assert_eq!(config.read_window, DEFAULT_READ_WINDOW);
        assert_eq!(config.write_chunk, WRITE_CHUNK);
        assert_eq!(config.slurp_block, SLURP_BLOCK);
        assert_eq!(config.bridge_exit_probe, BRIDGE_EXIT_PROBE);
    }

    #[test]
    fn zero_chunk_is_clamped() {
        let config = TransportConfig::new().with_write_chunk(0).with_slurp_block(0);
        assert_eq!(config.write_chunk, 1);
        assert_eq!(config.slurp_block, 1);
    }

    #[test]
    fn bundle_path_ends_with_bundle_file() {
        assert!(CertBundlePath::new().bundle_path.ends_with(BUNDLE_FILE));
    }
}

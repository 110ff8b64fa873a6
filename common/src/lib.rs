//! Wiresock transport layer
//!
//! One [`SocketHandle`] type covers TCP, UNIX domain sockets, and TLS over
//! either, with the same contract on POSIX and Windows:
//!
//! - connect with a timeout across every resolved address
//! - listen/accept with the TLS handshake deferred to `accept`
//! - chunked writes that report partial progress, and reads bounded by a
//!   readiness window
//! - blocking-mode control, readiness waits and a non-consuming liveness probe
//! - a process bridge that connects to a freshly spawned child over loopback
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use wiresock_common::{Protocol, SocketHandle};
//!
//! # fn main() -> wiresock_common::Result<()> {
//! let mut handle = SocketHandle::new(false);
//! handle.connect("127.0.0.1", "9090", Protocol::Tcp, Duration::from_secs(2))?;
//! handle.puts("PING\n")?;
//! let reply = handle.read_line(64)?;
//! println!("{handle} answered {reply}");
//! # Ok(())
//! # }
//! ```

/// Process bridge and its launcher collaborators
pub mod bridge;
/// Constants and per-handle tunables
pub mod config;
/// Client side connect
pub mod connect;
pub mod error;
/// The owned socket resource and its lifecycle
pub mod handle;
/// One-time process setup
pub mod init;
/// Server side listen/accept
pub mod listener;
pub mod policy;
/// Blocking mode and readiness
pub mod readiness;
/// TLS contexts and PEM loading
pub mod tls_config;
/// rustls session bound to a socket
pub mod tls_stream;
/// Read/write primitives
pub mod transport_io;

mod platform_socket;

pub use bridge::{ProcessLauncher, RunnerLauncher, SpawnedPeer};
pub use config::{CertBundlePath, TransportConfig};
pub use connect::{port_by_name, Protocol};
pub use error::{Result, SocketError};
pub use handle::{Role, SocketHandle};
pub use policy::{EnvSandbox, Restricted, SandboxPolicy, Unrestricted};
pub use readiness::Readiness;
pub use tls_config::ClientTrust;

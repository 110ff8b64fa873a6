//! Wiresock Client Library
//!
//! A small line-oriented client over the wiresock transport: TCP, UNIX domain
//! sockets or TLS on either, or a spawned process reached through the
//! process bridge.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use wiresock_client::{ClientConfig, StreamClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new()
//!     .with_tcp("127.0.0.1", "9090")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_verbose(true);
//!
//! let mut client = StreamClient::new(config);
//! client.connect()?;
//!
//! let response = client.send_request("status")?;
//! println!("Server status: {}", response);
//!
//! client.disconnect()?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export the transport types callers configure clients with
pub use wiresock_common::{ClientTrust, RunnerLauncher, TransportConfig};

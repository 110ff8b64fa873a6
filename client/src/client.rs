use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use wiresock_common::{
    ClientTrust, ProcessLauncher, Protocol, SandboxPolicy, SocketError, SocketHandle,
    TransportConfig, Unrestricted,
};

/// Longest reply line read back from the server
const MAX_REPLY: usize = 4096;

/// Where the client connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: String },
    Unix(PathBuf),
}

impl Default for Target {
    fn default() -> Self {
        Target::Tcp {
            host: "127.0.0.1".to_string(),
            port: "9090".to_string(),
        }
    }
}

/// Configuration for the stream client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target:    Target,
    /// Wrap the connection in TLS
    pub tls:       bool,
    /// How the TLS client decides to trust the server
    pub trust:     ClientTrust,
    /// Connect timeout; zero means a plain blocking connect
    pub timeout:   Duration,
    pub transport: TransportConfig,
    /// Consulted before spawning a bridged process
    pub policy:    Arc<dyn SandboxPolicy>,
    /// Enable verbose logging
    pub verbose:   bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target:    Target::default(),
            tls:       false,
            trust:     ClientTrust::default(),
            timeout:   Duration::from_secs(5),
            transport: TransportConfig::default(),
            policy:    Arc::new(Unrestricted),
            verbose:   false,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tcp<H: Into<String>, P: Into<String>>(mut self, host: H, port: P) -> Self {
        self.target = Target::Tcp {
            host: host.into(),
            port: port.into(),
        };
        self
    }

    pub fn with_unix<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.target = Target::Unix(path.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Verify the server against the CA certificates in `ca_path`
    pub fn with_ca_file<P: Into<PathBuf>>(mut self, ca_path: P) -> Self {
        self.trust = ClientTrust::Roots(ca_path.into());
        self
    }

    /// Set the connect timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn SandboxPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Line-oriented client over one [`SocketHandle`]
pub struct StreamClient {
    config:          ClientConfig,
    handle:          Option<SocketHandle>,
    request_counter: u32,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            handle: None,
            request_counter: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::default())
    }

    fn fresh_handle(&self) -> SocketHandle {
        let mut handle = SocketHandle::with_config(self.config.tls, self.config.transport);
        handle.set_client_trust(self.config.trust.clone());
        handle.set_policy(Arc::clone(&self.config.policy));
        handle
    }

    /// Connects to the configured target
    pub fn connect(&mut self) -> Result<()> {
        let mut handle = self.fresh_handle();
        match &self.config.target {
            Target::Tcp { host, port } => {
                if self.config.verbose {
                    tracing::info!("Connecting to {}:{}", host, port);
                }
                handle
                    .connect(host, port, Protocol::Tcp, self.config.timeout)
                    .with_context(|| format!("Failed to connect to {host}:{port}"))?;
            }
            Target::Unix(path) => {
                let path_str = path
                    .to_str()
                    .ok_or_else(|| anyhow!("Socket path is not valid UTF-8: {:?}", path))?;
                if self.config.verbose {
                    tracing::info!("Connecting to unix:{}", path_str);
                }
                handle
                    .connect(path_str, "", Protocol::Unix, self.config.timeout)
                    .with_context(|| format!("Failed to connect to {path_str}"))?;
            }
        }

        if self.config.verbose {
            tracing::info!("✓ Connected to {}", handle);
        }
        self.handle = Some(handle);
        Ok(())
    }

    /// Spawns `command` through `launcher` and talks to it instead of a
    /// server
    pub fn spawn(&mut self, launcher: &dyn ProcessLauncher, command: &str) -> Result<()> {
        let mut handle = self.fresh_handle();
        handle
            .spawn_process_bridge(launcher, command, self.config.timeout)
            .with_context(|| format!("Failed to bridge {command:?}"))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Disconnect from the server
    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            match handle.close() {
                Ok(()) | Err(SocketError::Closed) => {}
                Err(e) => return Err(e).context("Failed to close connection"),
            }
            if self.config.verbose {
                tracing::info!("✓ Disconnected");
            }
        }
        Ok(())
    }

    /// Whether a connection is held and the peer still looks alive
    pub fn is_connected(&mut self) -> bool {
        self.handle.as_mut().is_some_and(SocketHandle::is_connected)
    }

    fn handle_mut(&mut self) -> Result<&mut SocketHandle> {
        self.handle
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to server"))
    }

    /// Sends `PING` and expects `PONG`
    pub fn ping(&mut self) -> Result<()> {
        match self.send_request("PING")?.as_str() {
            "PONG" => Ok(()),
            other => Err(anyhow!("Expected PONG, got: {:?}", other)),
        }
    }

    /// Sends one command line and returns the reply line
    pub fn send_request(&mut self, command: &str) -> Result<String> {
        self.request_counter += 1;
        let request_id = self.request_counter;
        let verbose = self.config.verbose;
        let handle = self.handle_mut()?;

        if verbose {
            tracing::info!("Sending request {}: {}", request_id, command);
        }
        handle
            .printf(format_args!("{command}\n"))
            .context("Failed to send request")?;
        handle.flush().context("Failed to flush request")?;

        let reply = handle
            .read_line(MAX_REPLY)
            .with_context(|| format!("No reply to request {request_id}"))?;
        if let Some(message) = reply.strip_prefix("ERR ") {
            return Err(anyhow!("Request {} failed: {}", request_id, message));
        }
        Ok(reply)
    }

    /// Writes raw bytes, returning how many were sent
    pub fn send_raw(&mut self, data: &[u8]) -> Result<usize> {
        let handle = self.handle_mut()?;
        let sent = handle.write(data).context("Failed to send data")?;
        handle.flush().context("Failed to flush data")?;
        if sent < data.len() {
            tracing::warn!("Partial write: {} of {} bytes", sent, data.len());
        }
        Ok(sent)
    }

    /// Reads whatever the peer sends until it closes or goes quiet
    pub fn slurp(&mut self) -> Result<Vec<u8>> {
        let handle = self.handle_mut()?;
        Ok(handle.slurp().context("Failed to read")?.unwrap_or_default())
    }

    /// Get connection and usage statistics
    pub fn get_stats(&mut self) -> ClientStats {
        ClientStats {
            connected:     self.is_connected(),
            peer:          self.handle.as_ref().and_then(SocketHandle::peer_string),
            tls:           self.handle.as_ref().is_some_and(SocketHandle::is_tls),
            requests_sent: self.request_counter,
        }
    }
}

/// Statistics about the client connection
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub connected:     bool,
    pub peer:          Option<String>,
    pub tls:           bool,
    pub requests_sent: u32,
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

// Convenience functions for common operations
impl StreamClient {
    /// Execute a single command (connect, execute, disconnect)
    pub fn execute_command(config: ClientConfig, command: &str) -> Result<String> {
        let mut client = Self::new(config);
        client.connect()?;
        let result = client.send_request(command);
        client.disconnect()?;
        result
    }

    /// Quick ping test (connect, ping, disconnect)
    pub fn quick_ping(config: ClientConfig) -> Result<()> {
        let mut client = Self::new(config);
        client.connect()?;
        let result = client.ping();
        client.disconnect()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = ClientConfig::new()
            .with_unix("/tmp/debug.sock")
            .with_tls(true)
            .with_ca_file("ca.pem")
            .with_timeout(Duration::from_secs(1));

        assert_eq!(config.target, Target::Unix(PathBuf::from("/tmp/debug.sock")));
        assert!(config.tls);
        assert!(matches!(config.trust, ClientTrust::Roots(_)));
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    fn requests_need_a_connection() {
        let mut client = StreamClient::with_defaults();
        assert!(!client.is_connected());
        assert!(client.send_request("status").is_err());
        assert!(client.disconnect().is_ok());
        assert_eq!(client.get_stats().requests_sent, 1);
    }

    #[test]
    fn sandboxed_client_refuses_to_spawn() {
        let config = ClientConfig::new().with_policy(Arc::new(wiresock_common::Restricted));
        let mut client = StreamClient::new(config);
        let launcher = wiresock_common::RunnerLauncher::new("/nonexistent/runner");

        let err = client.spawn(&launcher, "ls").unwrap_err();
        assert!(format!("{err:#}").contains("sandbox"));
        assert!(!client.is_connected());
    }
}

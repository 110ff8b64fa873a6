//! Line-oriented echo daemon on top of the wiresock transport.
//!
//! Serves one client at a time: every line a client sends is answered with
//! one line, until the client sends `quit` or goes away.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use wiresock_common::{SandboxPolicy, SocketError, SocketHandle, TransportConfig};

/// Longest request line accepted from a client
const MAX_LINE: usize = 4096;

/// How often the accept loop looks at the shutdown flag
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Where and how the daemon listens
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port number or service name; `0` for an ephemeral port
    pub port:       String,
    /// Serve on a UNIX domain socket at this path instead of TCP
    pub unix_path:  Option<PathBuf>,
    /// PEM bundle with certificate chain and key; enables TLS on TCP
    pub tls_bundle: Option<PathBuf>,
    pub local_only: bool,
    pub transport:  TransportConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port:       "9090".to_string(),
            unix_path:  None,
            tls_bundle: None,
            local_only: true,
            transport:  TransportConfig::default(),
        }
    }
}

/// What to do after answering a request
enum Reply {
    Line(String),
    Quit,
}

#[derive(Clone)]
pub struct EchoServer {
    options: ServerOptions,
    policy:  Option<Arc<dyn SandboxPolicy>>,
}

impl EchoServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            policy: None,
        }
    }

    /// Sandbox policy applied to the listening handle
    pub fn with_policy(mut self, policy: Arc<dyn SandboxPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Creates the listening handle. Split out from [`serve`](Self::serve)
    /// so callers can learn an ephemeral port before serving.
    pub fn bind(&self) -> Result<SocketHandle> {
        let tls = self.options.tls_bundle.is_some();
        let mut listener = SocketHandle::with_config(tls, self.options.transport);
        listener.set_local_only(self.options.local_only);
        if let Some(policy) = &self.policy {
            listener.set_policy(Arc::clone(policy));
        }

        match &self.options.unix_path {
            #[cfg(unix)]
            Some(path) => listener
                .listen_unix(path)
                .with_context(|| format!("Failed to listen on {}", path.display()))?,
            #[cfg(not(unix))]
            Some(path) => {
                return Err(anyhow!(
                    "UNIX domain sockets are not available here: {}",
                    path.display()
                ))
            }
            None => listener
                .listen(&self.options.port, self.options.tls_bundle.as_deref())
                .with_context(|| format!("Failed to listen on port {}", self.options.port))?,
        }

        tracing::info!("Echo server listening on {}", self.endpoint(&listener));
        Ok(listener)
    }

    /// Serves until the process is killed
    pub fn run(&self) -> Result<()> {
        self.run_with_shutdown(Arc::new(AtomicBool::new(true)))
    }

    /// Serves while `running` stays true
    pub fn run_with_shutdown(&self, running: Arc<AtomicBool>) -> Result<()> {
        let mut listener = self.bind()?;
        self.serve(&mut listener, running)
    }

    /// Accept loop over an already listening handle
    pub fn serve(&self, listener: &mut SocketHandle, running: Arc<AtomicBool>) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            match listener.accept_timeout(ACCEPT_POLL) {
                Ok(Some(mut client)) => {
                    tracing::info!("New connection from {}", client);
                    if let Err(e) = self.handle_client(&mut client, &running) {
                        tracing::error!("Client error: {:#}", e);
                    }
                }
                Ok(None) => {}
                Err(e @ SocketError::Handshake(_)) => {
                    tracing::warn!("Dropped connection: {}", e);
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Accept failed: {}", e);
                }
                Err(e) => return Err(e).context("Listener failed"),
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        Ok(())
    }

    fn handle_client(&self, client: &mut SocketHandle, running: &AtomicBool) -> Result<()> {
        loop {
            let line = match client.read_line(MAX_LINE) {
                Ok(line) => line,
                Err(SocketError::ReadTimeout) => {
                    if running.load(Ordering::SeqCst) && client.is_connected() {
                        continue;
                    }
                    break;
                }
                Err(SocketError::PeerClosed) => {
                    tracing::info!("Client disconnected");
                    break;
                }
                Err(e) => return Err(e).context("Failed to read request"),
            };
            // Blank lines come from CRLF pairs
            if line.is_empty() {
                continue;
            }

            tracing::debug!("Request: {:?}", line);
            match Self::process_command(&line) {
                Reply::Line(reply) => {
                    client
                        .puts(&format!("{reply}\n"))
                        .context("Failed to send reply")?;
                    client.flush().context("Failed to flush reply")?;
                }
                Reply::Quit => {
                    let _ = client.puts("BYE\n");
                    tracing::info!("Client sent quit");
                    break;
                }
            }
        }

        let _ = client.close();
        Ok(())
    }

    fn process_command(line: &str) -> Reply {
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (line, ""),
        };

        match command {
            "PING" | "ping" => Reply::Line("PONG".to_string()),
            "status" => Reply::Line("OK".to_string()),
            "version" => Reply::Line(env!("CARGO_PKG_VERSION").to_string()),
            "echo" => Reply::Line(rest.to_string()),
            "quit" => Reply::Quit,
            other => Reply::Line(format!("ERR unknown command: {other}")),
        }
    }

    fn endpoint(&self, listener: &SocketHandle) -> String {
        match &self.options.unix_path {
            Some(path) => format!("unix:{}", path.display()),
            None => match listener.local_port() {
                Some(port) => format!("port {port}"),
                None => format!("port {}", self.options.port),
            },
        }
    }
}

/// Loads the TLS bundle location the way the binary does when `--tls` is
/// given without a path
pub fn default_tls_bundle() -> Result<PathBuf> {
    let bundle = wiresock_common::CertBundlePath::new().bundle_path;
    if !bundle.exists() {
        return Err(anyhow!("TLS bundle not found at {:?}", bundle));
    }
    Ok(bundle)
}

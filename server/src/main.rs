use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiresock_common::{EnvSandbox, TransportConfig};
use wiresock_server::{default_tls_bundle, EchoServer, ServerOptions};

#[derive(Parser)]
#[command(name = "wiresock-server")]
#[command(about = "Line echo daemon over TCP, UNIX domain sockets and TLS")]
struct Args {
    /// Port number or service name
    #[arg(short, long, default_value = "9090")]
    port: String,

    /// Listen on a UNIX domain socket at this path instead of TCP
    #[arg(long)]
    unix: Option<PathBuf>,

    /// Enable TLS; uses the bundle in $WIRESOCK_CERTS_DIR unless --bundle is given
    #[arg(long)]
    tls: bool,

    /// PEM file holding the certificate chain and private key
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Accept connections from other hosts, not only loopback
    #[arg(long)]
    public: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let tls_bundle = match (args.tls, args.bundle) {
        (_, Some(bundle)) => Some(bundle),
        (true, None) => Some(default_tls_bundle()?),
        (false, None) => None,
    };

    let options = ServerOptions {
        port: args.port,
        unix_path: args.unix,
        tls_bundle,
        local_only: !args.public,
        transport: TransportConfig::from_env(),
    };
    let server = EchoServer::new(options).with_policy(Arc::new(EnvSandbox));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    info!("Starting wiresock echo server...");
    server.run_with_shutdown(running).context("Server error")?;
    Ok(())
}

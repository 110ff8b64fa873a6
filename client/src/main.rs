use std::{
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiresock_client::{ClientConfig, RunnerLauncher, StreamClient, TransportConfig};
use wiresock_common::EnvSandbox;

#[derive(Parser)]
#[command(name = "wiresock-client")]
#[command(about = "Talk to a wiresock peer over TCP, UNIX sockets, TLS or a spawned process")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Server host for TCP targets
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number or service name for TCP targets
    #[arg(short, long, default_value = "9090")]
    port: String,

    /// Connect to a UNIX domain socket instead of TCP
    #[arg(long)]
    unix: Option<PathBuf>,

    /// Use TLS
    #[arg(long)]
    tls: bool,

    /// Verify the server against this PEM CA file instead of trusting any certificate
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Connect timeout in milliseconds; 0 blocks
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send PING and wait for PONG
    Ping,
    /// Send one command line and print the reply
    Request {
        /// Command line to send
        line: Vec<String>,
    },
    /// Send stdin as raw bytes
    Send,
    /// Print everything the peer sends until it closes
    Slurp,
    /// Spawn a command through an inetd-style runner and relay stdin to it
    Spawn {
        /// Command run by the runner
        command: String,
        /// Runner program
        #[arg(long, default_value = RunnerLauncher::DEFAULT_PROGRAM)]
        runner: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = ClientConfig::new()
        .with_tcp(args.host, args.port)
        .with_tls(args.tls)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_transport(TransportConfig::from_env())
        .with_policy(Arc::new(EnvSandbox))
        .with_verbose(args.verbose);
    if let Some(path) = args.unix {
        config = config.with_unix(path);
    }
    if let Some(ca) = args.ca {
        config = config.with_ca_file(ca);
    }

    info!("Starting wiresock client...");
    let mut client = StreamClient::new(config);

    match args.command {
        Commands::Ping => {
            client.connect()?;
            client.ping().context("Failed to ping server")?;
            println!("PONG");
        }

        Commands::Request { line } => {
            client.connect()?;
            let reply = client
                .send_request(&line.join(" "))
                .context("Request failed")?;
            println!("{reply}");
        }

        Commands::Send => {
            client.connect()?;
            let data = read_stdin()?;
            let sent = client.send_raw(&data)?;
            info!("Sent {} of {} bytes", sent, data.len());
        }

        Commands::Slurp => {
            client.connect()?;
            let data = client.slurp()?;
            io::stdout().write_all(&data).context("Failed to write output")?;
        }

        Commands::Spawn { command, runner } => {
            client.spawn(&RunnerLauncher::new(runner), &command)?;
            let data = read_stdin()?;
            if !data.is_empty() {
                client.send_raw(&data)?;
            }
            let reply = client.slurp()?;
            io::stdout().write_all(&reply).context("Failed to write output")?;
        }
    }

    client.disconnect()?;
    Ok(())
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut data = Vec::new();
    io::stdin()
        .read_to_end(&mut data)
        .context("Failed to read stdin")?;
    Ok(data)
}

use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use wiresock_common::{Protocol, Restricted, SocketHandle};
use wiresock_server::{EchoServer, ServerOptions};

struct Running {
    port:   String,
    flag:   Arc<AtomicBool>,
    thread: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    fn stop(self) {
        self.flag.store(false, Ordering::SeqCst);
        self.thread.join().unwrap().unwrap();
    }
}

fn start(options: ServerOptions) -> Running {
    let server = EchoServer::new(options);
    let mut listener = server.bind().unwrap();
    let port = listener.local_port().unwrap_or_default().to_string();
    let flag = Arc::new(AtomicBool::new(true));
    let running = flag.clone();
    let thread = thread::spawn(move || server.serve(&mut listener, running));
    Running { port, flag, thread }
}

fn ephemeral() -> ServerOptions {
    ServerOptions {
        port: "0".to_string(),
        ..ServerOptions::default()
    }
}

fn converse(client: &mut SocketHandle) {
    client.puts("PING\r\n").unwrap();
    assert_eq!(client.read_line(64).unwrap(), "PONG");
    client.puts("echo over the wire\n").unwrap();
    assert_eq!(client.read_line(64).unwrap(), "over the wire");
    client.puts("bogus\n").unwrap();
    assert_eq!(client.read_line(64).unwrap(), "ERR unknown command: bogus");
    client.puts("quit\n").unwrap();
    assert_eq!(client.read_line(64).unwrap(), "BYE");
}

#[test]
fn plain_tcp_session() {
    let server = start(ephemeral());

    let mut client = SocketHandle::new(false);
    client
        .connect("127.0.0.1", &server.port, Protocol::Tcp, Duration::from_secs(2))
        .unwrap();
    converse(&mut client);

    let mut buf = [0u8; 4];
    assert!(client.read(&mut buf).is_err());
    server.stop();
}

#[test]
fn tls_session() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let mut bundle = tempfile::NamedTempFile::new().unwrap();
    bundle.write_all(cert.cert.pem().as_bytes()).unwrap();
    bundle.write_all(cert.key_pair.serialize_pem().as_bytes()).unwrap();

    let server = start(ServerOptions {
        tls_bundle: Some(bundle.path().to_path_buf()),
        ..ephemeral()
    });

    let mut client = SocketHandle::new(true);
    client
        .connect("127.0.0.1", &server.port, Protocol::Tcp, Duration::from_secs(2))
        .unwrap();
    assert!(client.is_tls());
    converse(&mut client);
    server.stop();
}

#[cfg(unix)]
#[test]
fn unix_socket_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let server = start(ServerOptions {
        unix_path: Some(path.clone()),
        ..ephemeral()
    });

    let mut client = SocketHandle::new(false);
    client
        .connect(path.to_str().unwrap(), "", Protocol::Unix, Duration::ZERO)
        .unwrap();
    converse(&mut client);
    server.stop();
}

#[test]
fn sandboxed_server_refuses_to_listen() {
    let server = EchoServer::new(ephemeral()).with_policy(Arc::new(Restricted));
    let err = server.bind().unwrap_err();
    assert!(format!("{err:#}").contains("sandbox"));
}

#[test]
fn shutdown_flag_stops_idle_server() {
    let server = start(ephemeral());
    thread::sleep(Duration::from_millis(100));
    server.stop();
}

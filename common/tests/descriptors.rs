//! Kept in its own test binary: the descriptor count is process wide, so no
//! other test may open sockets while it runs.
#![cfg(target_os = "linux")]

use std::{fs, net::TcpListener, time::Duration};

use wiresock_common::{Protocol, SocketError, SocketHandle};

fn open_descriptors() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port().to_string()
}

#[test]
fn failed_candidates_leave_no_descriptors_behind() {
    let refused = closed_port();

    // Only IPv4 listens, so a `localhost` that also resolves to ::1 walks
    // past a refused candidate before it succeeds
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let open = listener.local_addr().unwrap().port().to_string();

    // Warm up the resolver so its own descriptors are counted as baseline
    let mut warm = SocketHandle::new(false);
    warm.connect("localhost", &open, Protocol::Tcp, Duration::ZERO).unwrap();
    drop(warm);
    drop(listener.accept().unwrap());

    let before = open_descriptors();

    for round in 0..50 {
        let timeout = if round % 2 == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(500)
        };

        let mut plain = SocketHandle::new(false);
        let err = plain
            .connect("127.0.0.1", &refused, Protocol::Tcp, timeout)
            .unwrap_err();
        assert!(matches!(err, SocketError::Connect { .. }));

        let mut tls = SocketHandle::new(true);
        let err = tls
            .connect("localhost", &refused, Protocol::Tcp, timeout)
            .unwrap_err();
        assert!(matches!(err, SocketError::Connect { .. }));

        let mut client = SocketHandle::new(false);
        client
            .connect("localhost", &open, Protocol::Tcp, timeout)
            .unwrap();
        drop(listener.accept().unwrap());
        client.close().unwrap();
    }

    assert_eq!(open_descriptors(), before);
}

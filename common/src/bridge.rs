//! Turning a freshly spawned process into a byte-stream peer.
//!
//! The child is started inetd-style by a [`ProcessLauncher`] so that it
//! listens on a loopback port with its stdio attached to the first
//! connection; the handle then connects to that port like any TCP client.

use std::{
    io,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use crate::{
    config::BRIDGE_PORT_RANGE,
    connect::Protocol,
    error::{Result, SocketError},
    handle::{Role, SocketHandle},
};

/// A launched process the bridge can check on
pub trait SpawnedPeer: Send {
    /// Non-blocking check; reaps the process when it has exited
    fn has_exited(&mut self) -> io::Result<bool>;

    /// Stops the process and reaps it
    fn terminate(&mut self) -> io::Result<()>;
}

impl SpawnedPeer for Child {
    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn terminate(&mut self) -> io::Result<()> {
        // kill fails with InvalidInput once the child has been reaped
        match self.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => return Ok(()),
            Err(e) => return Err(e),
        }
        self.wait().map(|_| ())
    }
}

/// Kills a bridged process whose connection was never handed out
fn abandon(child: &mut dyn SpawnedPeer, command: &str) {
    if let Err(e) = child.terminate() {
        tracing::warn!("Failed to stop bridged process {:?}: {}", command, e);
    }
}

/// Starts `command` so that it serves its stdio on TCP `port` of the loopback
/// interface
pub trait ProcessLauncher {
    fn launch(&self, port: u16, command: &str) -> io::Result<Box<dyn SpawnedPeer>>;
}

/// Launches through an inetd-style runner program, invoked as
/// `<program> system=<command> listen=<port>`
#[derive(Debug, Clone)]
pub struct RunnerLauncher {
    program: PathBuf,
}

impl RunnerLauncher {
    pub const DEFAULT_PROGRAM: &'static str = "rarun2";

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl Default for RunnerLauncher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PROGRAM)
    }
}

impl ProcessLauncher for RunnerLauncher {
    fn launch(&self, port: u16, command: &str) -> io::Result<Box<dyn SpawnedPeer>> {
        tracing::debug!("Launching {:?} for {:?} on port {}", self.program, command, port);
        let child = Command::new(&self.program)
            .arg(format!("system={command}"))
            .arg(format!("listen={port}"))
            .stdin(Stdio::null())
            .spawn()?;
        Ok(Box::new(child))
    }
}

impl SocketHandle {
    /// Spawns `command` through `launcher` and connects to it over loopback.
    ///
    /// Waits a fixed settle delay between launch and connect; a slow child
    /// can still lose that race and the connect then fails. `timeout` bounds
    /// the connect itself. On unix the child gets `bridge_exit_probe` to fail
    /// before it is checked. A child whose connection is not handed out is
    /// killed.
    pub fn spawn_process_bridge(
        &mut self,
        launcher: &dyn ProcessLauncher,
        command: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_role(Role::Unconnected)?;
        if self.policy.is_restricted() {
            tracing::warn!("Sandbox policy denies spawning {:?}", command);
            return Err(SocketError::PolicyDenied);
        }

        let port = fastrand::u16(BRIDGE_PORT_RANGE);
        let mut child = launcher.launch(port, command).map_err(|e| {
            tracing::error!("Failed to launch {:?}: {}", command, e);
            SocketError::Spawn(e)
        })?;

        let settle = self.config.bridge_settle + Duration::from_nanos(timeout.subsec_nanos().into());
        thread::sleep(settle);
        if let Err(e) = self.connect("127.0.0.1", &port.to_string(), Protocol::Tcp, timeout) {
            abandon(child.as_mut(), command);
            return Err(e);
        }

        #[cfg(unix)]
        {
            thread::sleep(self.config.bridge_exit_probe);
            match child.has_exited() {
                Ok(false) => {}
                Ok(true) => {
                    tracing::warn!("Bridged process {:?} exited right after connecting", command);
                    let _ = self.close();
                    return Err(SocketError::ChildExited);
                }
                Err(e) => {
                    let _ = self.close();
                    abandon(child.as_mut(), command);
                    return Err(SocketError::Spawn(e));
                }
            }
        }

        tracing::info!("Bridged {:?} on port {}", command, port);
        self.bridged = Some(child);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::{config::TransportConfig, policy::Restricted};

    struct FailingLauncher;

    impl ProcessLauncher for FailingLauncher {
        fn launch(&self, _port: u16, _command: &str) -> io::Result<Box<dyn SpawnedPeer>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no runner"))
        }
    }

    /// Records the port it was asked for and never listens on it
    struct RecordingLauncher(Arc<Mutex<Vec<u16>>>);

    impl ProcessLauncher for RecordingLauncher {
        fn launch(&self, port: u16, _command: &str) -> io::Result<Box<dyn SpawnedPeer>> {
            self.0.lock().unwrap().push(port);
            Err(io::Error::other("recorded"))
        }
    }

    /// Starts nothing on the port, so the connect is refused
    struct SilentLauncher(Arc<AtomicBool>);

    struct TrackedPeer(Arc<AtomicBool>);

    impl SpawnedPeer for TrackedPeer {
        fn has_exited(&mut self) -> io::Result<bool> {
            Ok(false)
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ProcessLauncher for SilentLauncher {
        fn launch(&self, _port: u16, _command: &str) -> io::Result<Box<dyn SpawnedPeer>> {
            Ok(Box::new(TrackedPeer(Arc::clone(&self.0))))
        }
    }

    fn quick_handle() -> SocketHandle {
        SocketHandle::with_config(
            false,
            TransportConfig::new()
                .with_bridge_settle(Duration::ZERO)
                .with_bridge_exit_probe(Duration::ZERO),
        )
    }

    #[test]
    fn restricted_policy_denies_spawn() {
        let mut handle = quick_handle();
        handle.set_policy(Arc::new(Restricted));
        let err = handle
            .spawn_process_bridge(&FailingLauncher, "ls", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SocketError::PolicyDenied));
    }

    #[test]
    fn launch_failure_is_a_spawn_error() {
        let mut handle = quick_handle();
        let err = handle
            .spawn_process_bridge(&FailingLauncher, "ls", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SocketError::Spawn(_)));
        assert_eq!(handle.role(), Role::Unconnected);
    }

    #[test]
    fn bridge_ports_stay_in_range() {
        let ports = Arc::new(Mutex::new(Vec::new()));
        let launcher = RecordingLauncher(Arc::clone(&ports));
        for _ in 0..32 {
            let _ = quick_handle().spawn_process_bridge(&launcher, "x", Duration::ZERO);
        }
        let ports = ports.lock().unwrap();
        assert_eq!(ports.len(), 32);
        assert!(ports.iter().all(|port| BRIDGE_PORT_RANGE.contains(port)));
    }

    #[test]
    fn missing_runner_program_fails_to_launch() {
        let launcher = RunnerLauncher::new("/nonexistent/runner-binary");
        assert!(launcher.launch(2000, "true").is_err());
        assert_eq!(RunnerLauncher::default().program().to_str(), Some("rarun2"));
    }

    #[test]
    fn bridge_needs_unconnected_handle() {
        let mut listener = quick_handle();
        listener.set_local_only(true);
        listener.listen("0", None).unwrap();
        let err = listener
            .spawn_process_bridge(&FailingLauncher, "ls", Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SocketError::InvalidState(Role::Listening)));
    }

    #[test]
    fn failed_connect_stops_the_child() {
        let terminated = Arc::new(AtomicBool::new(false));
        let launcher = SilentLauncher(Arc::clone(&terminated));

        let mut handle = quick_handle();
        let err = handle
            .spawn_process_bridge(&launcher, "ls", Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SocketError::Connect { .. }));
        assert!(terminated.load(Ordering::SeqCst));
        assert_eq!(handle.role(), Role::Unconnected);
    }

    #[cfg(unix)]
    #[test]
    fn terminate_kills_and_reaps_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        assert!(!child.has_exited().unwrap());

        child.terminate().unwrap();
        assert!(child.has_exited().unwrap());
        // Already reaped
        child.terminate().unwrap();
    }
}

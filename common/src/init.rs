use std::sync::Once;

static INIT: Once = Once::new();

/// Process-wide one-time setup for TLS use.
///
/// Installs the aws-lc-rs crypto provider as the rustls default and, on unix,
/// ignores SIGPIPE so a write to a vanished peer reports `EPIPE` instead of
/// killing the process. Safe to call any number of times.
pub fn ensure() {
    INIT.call_once(|| {
        // Another component may have installed a provider already
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }

        #[cfg(unix)]
        ignore_sigpipe();

        tracing::debug!("TLS layer initialized");
    });
}

#[cfg(unix)]
fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: SIG_IGN installs no handler code, so there is nothing that could
    // run in signal context.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        tracing::warn!("Failed to ignore SIGPIPE: {}", e);
    }
}

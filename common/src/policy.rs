use std::{env, fmt};

const SANDBOX_ENV: &str = "WIRESOCK_SANDBOX";

/// Capability check consulted before a handle listens or spawns a bridged
/// process. A restricted answer denies the operation before any socket is
/// created.
pub trait SandboxPolicy: fmt::Debug + Send + Sync {
    fn is_restricted(&self) -> bool;
}

/// Never restricts; the default for new handles
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl SandboxPolicy for Unrestricted {
    fn is_restricted(&self) -> bool {
        false
    }
}

/// Always restricts
#[derive(Debug, Clone, Copy, Default)]
pub struct Restricted;

impl SandboxPolicy for Restricted {
    fn is_restricted(&self) -> bool {
        true
    }
}

/// Restricted while `WIRESOCK_SANDBOX` is `1` or `true`, read on every check
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSandbox;

impl SandboxPolicy for EnvSandbox {
    fn is_restricted(&self) -> bool {
        env::var(SANDBOX_ENV)
            .map(|value| flag_enabled(&value))
            .unwrap_or(false)
    }
}

fn flag_enabled(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policies() {
        assert!(!Unrestricted.is_restricted());
        assert!(Restricted.is_restricted());
    }

    #[test]
    fn env_flag_values() {
        assert!(flag_enabled("1"));
        assert!(flag_enabled(" TRUE "));
        assert!(!flag_enabled("0"));
        assert!(!flag_enabled("yes"));
    }
}

// Errors from the host primitives: netlink, iptables, dnsmasq, /proc and sysfs.

use std::fmt;

/// Error type for every primitive network and host operation
#[derive(Debug)]
pub enum NetworkError {
    Netlink(rtnetlink::Error),
    Io(std::io::Error),
    /// Host tool exited non-zero
    Command { cmd: String, stderr: String },
    /// Rejected input, or a config dnsmasq refused with `--test`
    Validation(String),
    Timeout(String),
    /// Link, bridge or pid file is not there
    NotFound(String),
    /// Daemon process could not be started, signalled or located
    Process(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Netlink(e) => write!(f, "netlink error: {}", e),
            NetworkError::Io(e) => write!(f, "io error: {}", e),
            NetworkError::Command { cmd, stderr } if stderr.is_empty() => {
                write!(f, "command '{}' failed", cmd)
            }
            NetworkError::Command { cmd, stderr } => {
                write!(f, "command '{}' failed: {}", cmd, stderr)
            }
            NetworkError::Validation(msg) => write!(f, "invalid: {}", msg),
            NetworkError::Timeout(msg) => write!(f, "timed out: {}", msg),
            NetworkError::NotFound(msg) => write!(f, "not found: {}", msg),
            NetworkError::Process(msg) => write!(f, "process error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Netlink(e) => Some(e),
            NetworkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rtnetlink::Error> for NetworkError {
    fn from(e: rtnetlink::Error) -> Self {
        NetworkError::Netlink(e)
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

impl NetworkError {
    /// True for errors that mean the resource is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            NetworkError::NotFound(_) => true,
            NetworkError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

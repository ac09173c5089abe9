use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Where a duplex stream lives.
///
/// Parsed from `unix:<path>` or `tcp:<host>:<port>`. A bare `host:port` is
/// treated as TCP and a string containing a `/` as a Unix socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Filesystem-path Unix domain socket.
    Unix(PathBuf),
    /// TCP socket address (`host:port`).
    Tcp(String),
}

impl Address {
    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Address::Unix(_) => "unix-domain-socket",
            Address::Tcp(_) => "tcp",
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return parse_tcp(addr).ok_or_else(|| TransportError::InvalidAddress(s.to_string()));
        }
        if s.contains('/') {
            return Ok(Address::Unix(PathBuf::from(s)));
        }
        parse_tcp(s).ok_or_else(|| TransportError::InvalidAddress(s.to_string()))
    }
}

fn parse_tcp(addr: &str) -> Option<Address> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(Address::Tcp(addr.to_string()))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
            Address::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

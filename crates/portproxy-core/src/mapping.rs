//! Mapping identities, protocol selectors and the runtime mapping record.

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process-unique mapping identity. Issued monotonically, never reused.
pub type MappingId = u64;

/// Host used when a mapping does not name an internal address.
pub const DEFAULT_INTERNAL_HOST: &str = "127.0.0.1";

/// Which transport(s) a mapping forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// TCP and UDP on the same external port, started independently.
    Both,
}

impl Protocol {
    pub fn includes_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Both)
    }

    pub fn includes_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            other => Err(ProxyError::InvalidProtocol(other.to_string())),
        }
    }
}

/// The internally addressed service a mapping relays to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Build a target, defaulting the host to loopback when absent.
    pub fn new(host: Option<&str>, port: u16) -> Self {
        Self {
            host: host.unwrap_or(DEFAULT_INTERNAL_HOST).to_string(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A request to open a mapping, before an identity is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub protocol: Protocol,
    /// External port to listen on. `0` lets the OS pick.
    pub external_port: u16,
    pub target: Target,
}

/// A mapping that is currently forwarding, as shown by the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMapping {
    pub id: MappingId,
    pub protocol: Protocol,
    pub external_port: u16,
    pub target: Target,
}

impl ActiveMapping {
    pub fn internal_port(&self) -> u16 {
        self.target.port
    }
}

impl fmt::Display for ActiveMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > proxy {} from {} to port {}",
            self.id, self.protocol, self.target, self.external_port
        )
    }
}

//! Source-IP access control.
//!
//! Split into two types, like the rest of the configuration layer:
//!
//! - [`AccessPolicy`]: the plain rules as they appear in configuration.
//! - [`AccessController`]: the runtime counterpart, built once with the
//!   host's own public IP, that answers [`AccessController::is_allowed`].
//!
//! # Decision order
//!
//! First match wins:
//!
//! | Step | Condition                         | Result                     |
//! |------|-----------------------------------|----------------------------|
//! | 1    | source in denylist                | reject                     |
//! | 2    | `allow_unless_denied`             | accept                     |
//! | 3    | source in allowlist               | accept                     |
//! | 4    | source is the host's own IP       | `allow_own_ip`             |
//! | 5    | source is loopback                | `allow_loopback`           |
//! | 6    | otherwise                         | reject                     |
//!
//! The denylist is an absolute veto: it overrides every later rule.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Static access-control rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Addresses that are always rejected.
    pub denylist: Vec<String>,
    /// Addresses that are accepted unless denied.
    pub allowlist: Vec<String>,
    /// Accept everything that is not on the denylist.
    pub allow_unless_denied: bool,
    /// Accept connections originating from the host's own public IP.
    pub allow_own_ip: bool,
    /// Accept connections from loopback addresses.
    pub allow_loopback: bool,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            denylist: Vec::new(),
            allowlist: Vec::new(),
            allow_unless_denied: false,
            allow_own_ip: true,
            allow_loopback: false,
        }
    }
}

/// Runtime access controller. Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct AccessController {
    deny: HashSet<IpAddr>,
    allow: HashSet<IpAddr>,
    allow_unless_denied: bool,
    allow_own_ip: bool,
    allow_loopback: bool,
    own_ip: Option<IpAddr>,
}

impl AccessController {
    /// Build a controller from the policy and the host's discovered public IP.
    ///
    /// List entries that do not parse as IP addresses are logged and dropped;
    /// they could never match a source address anyway.
    pub fn new(policy: &AccessPolicy, own_ip: Option<IpAddr>) -> Self {
        Self {
            deny: parse_list("denylist", &policy.denylist),
            allow: parse_list("allowlist", &policy.allowlist),
            allow_unless_denied: policy.allow_unless_denied,
            allow_own_ip: policy.allow_own_ip,
            allow_loopback: policy.allow_loopback,
            own_ip: own_ip.map(|ip| ip.to_canonical()),
        }
    }

    /// Decide whether traffic from `source` may be relayed.
    pub fn is_allowed(&self, source: SocketAddr) -> bool {
        self.is_ip_allowed(source.ip())
    }

    /// Same decision as [`is_allowed`](Self::is_allowed), on a bare address.
    pub fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();

        if self.deny.contains(&ip) {
            return false;
        }
        if self.allow_unless_denied {
            return true;
        }
        if self.allow.contains(&ip) {
            return true;
        }
        if self.own_ip == Some(ip) {
            return self.allow_own_ip;
        }
        if ip.is_loopback() {
            return self.allow_loopback;
        }
        false
    }

    pub fn own_ip(&self) -> Option<IpAddr> {
        self.own_ip
    }
}

fn parse_list(name: &str, entries: &[String]) -> HashSet<IpAddr> {
    entries
        .iter()
        .filter_map(|entry| match entry.trim().parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_canonical()),
            Err(_) => {
                warn!(list = name, entry = %entry, "ignoring unparseable address");
                None
            }
        })
        .collect()
}

//! Forwarder configuration: JSON file, defaults, and startup port planning.

use crate::access::AccessPolicy;
use crate::error::{ProxyError, ProxyResult};
use crate::mapping::{MappingRequest, Protocol, Target};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name searched for in the working directory, then the home directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Top-level config file structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default)]
    pub port_range: PortRange,
    /// Assign external ports sequentially instead of by `portOffset`.
    #[serde(default)]
    pub auto_port: bool,
    /// Local address every listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    #[serde(default)]
    pub mappings: Vec<MappingDecl>,
    #[serde(default)]
    pub allow_localhost_connections: bool,
    #[serde(default = "default_true")]
    pub allow_external_connections_from_own_ip: bool,
    #[serde(default)]
    pub allow_not_explicit_denied: bool,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            auto_port: false,
            listen_address: default_listen_address(),
            mappings: Vec::new(),
            allow_localhost_connections: false,
            allow_external_connections_from_own_ip: true,
            allow_not_explicit_denied: false,
            allowlist: Vec::new(),
            denylist: Vec::new(),
        }
    }
}

/// `portRange` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 54000,
            end: 54099,
        }
    }
}

/// One entry of the `mappings` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDecl {
    #[serde(default)]
    pub disabled: bool,
    pub protocol: Protocol,
    /// Internal host; loopback when absent.
    #[serde(default)]
    pub internal_ip: Option<String>,
    pub internal_port: u16,
    /// Offset from `portRange.start`; ignored in auto-port mode.
    #[serde(default)]
    pub port_offset: u16,
}

/// A startup mapping with its external port decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMapping {
    /// Position of the declaration in the `mappings` array.
    pub index: usize,
    pub request: MappingRequest,
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_true() -> bool {
    true
}

impl Configuration {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, `./config.json` is tried,
    /// then `~/config.json`; if neither exists the defaults are used (no
    /// mappings). Returns the config and the file it came from, if any.
    pub fn load(explicit: Option<&Path>) -> ProxyResult<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        for candidate in Self::search_paths() {
            if candidate.exists() {
                let config = Self::from_file(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }

        info!("no {CONFIG_FILE_NAME} found, starting with defaults and no mappings");
        Ok((Self::default(), None))
    }

    /// Candidate config locations in lookup order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Parse a config file.
    pub fn from_file(path: &Path) -> ProxyResult<Self> {
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
            .map_err(|e| ProxyError::Config(format!("{} is not valid: {e}", path.display())))
    }

    pub fn from_json(content: &str) -> ProxyResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// The access-control half of the configuration.
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            denylist: self.denylist.clone(),
            allowlist: self.allowlist.clone(),
            allow_unless_denied: self.allow_not_explicit_denied,
            allow_own_ip: self.allow_external_connections_from_own_ip,
            allow_loopback: self.allow_localhost_connections,
        }
    }

    /// Decide the external port of every enabled startup mapping.
    ///
    /// Disabled declarations are skipped and consume no port. In auto-port
    /// mode the n-th enabled mapping gets `start + n`; otherwise each gets
    /// `start + portOffset`. No collision checks are made.
    pub fn plan_mappings(&self) -> ProxyResult<Vec<PlannedMapping>> {
        let mut planned = Vec::new();
        let mut auto_assigned: u32 = 0;

        for (index, decl) in self.mappings.iter().enumerate() {
            if decl.disabled {
                info!(
                    index,
                    protocol = %decl.protocol,
                    internal_port = decl.internal_port,
                    "skipping disabled mapping"
                );
                continue;
            }

            let offset = if self.auto_port {
                let n = auto_assigned;
                auto_assigned += 1;
                n
            } else {
                u32::from(decl.port_offset)
            };

            let port = u32::from(self.port_range.start) + offset;
            let external_port = u16::try_from(port).map_err(|_| {
                ProxyError::InvalidPort(format!("mapping {index} resolves to port {port}"))
            })?;
            if external_port > self.port_range.end {
                warn!(
                    index,
                    port = external_port,
                    end = self.port_range.end,
                    "mapping port lies outside the configured range"
                );
            }

            planned.push(PlannedMapping {
                index,
                request: MappingRequest {
                    protocol: decl.protocol,
                    external_port,
                    target: Target::new(decl.internal_ip.as_deref(), decl.internal_port),
                },
            });
        }

        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn decl(protocol: Protocol, internal_port: u16, disabled: bool, offset: u16) -> MappingDecl {
        MappingDecl {
            disabled,
            protocol,
            internal_ip: None,
            internal_port,
            port_offset: offset,
        }
    }

    #[test]
    fn default_config_values() {
        let cfg = Configuration::default();
        assert_eq!(cfg.port_range, PortRange { start: 54000, end: 54099 });
        assert!(cfg.allow_external_connections_from_own_ip);
        assert!(!cfg.allow_localhost_connections);
        assert!(!cfg.allow_not_explicit_denied);
        assert!(cfg.mappings.is_empty());
        assert_eq!(cfg.listen_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn parse_json_config() {
        let json = r#"{
            "portRange": { "start": 60000, "end": 60010 },
            "autoPort": true,
            "mappings": [
                { "protocol": "tcp", "internalPort": 8080 },
                { "disabled": true, "protocol": "udp", "internalIp": "10.0.0.2", "internalPort": 53 }
            ],
            "allowLocalhostConnections": true,
            "allowlist": ["198.51.100.7"],
            "denylist": ["192.0.2.1"]
        }"#;
        let cfg = Configuration::from_json(json).unwrap();
        assert!(cfg.auto_port);
        assert_eq!(cfg.port_range.start, 60000);
        assert_eq!(cfg.mappings.len(), 2);
        assert_eq!(cfg.mappings[0].internal_ip, None);
        assert_eq!(cfg.mappings[1].internal_ip.as_deref(), Some("10.0.0.2"));
        // Omitted field keeps its default.
        assert!(cfg.allow_external_connections_from_own_ip);

        let policy = cfg.access_policy();
        assert!(policy.allow_loopback);
        assert_eq!(policy.denylist, vec!["192.0.2.1".to_string()]);
    }

    #[test]
    fn parse_invalid_protocol_fails() {
        let json = r#"{ "mappings": [ { "protocol": "icmp", "internalPort": 1 } ] }"#;
        assert!(matches!(
            Configuration::from_json(json),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn auto_port_skips_disabled() {
        let cfg = Configuration {
            auto_port: true,
            mappings: vec![
                decl(Protocol::Tcp, 8080, false, 0),
                decl(Protocol::Udp, 9090, true, 0),
                decl(Protocol::Both, 7000, false, 0),
                decl(Protocol::Tcp, 22, false, 0),
            ],
            ..Default::default()
        };
        let planned = cfg.plan_mappings().unwrap();
        let ports: Vec<u16> = planned.iter().map(|p| p.request.external_port).collect();
        assert_eq!(ports, vec![54000, 54001, 54002]);
        let internal: Vec<u16> = planned.iter().map(|p| p.request.target.port).collect();
        assert_eq!(internal, vec![8080, 7000, 22]);
        let indices: Vec<usize> = planned.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
    }

    #[test]
    fn explicit_offsets() {
        let cfg = Configuration {
            mappings: vec![
                decl(Protocol::Tcp, 8080, false, 5),
                decl(Protocol::Tcp, 8081, true, 6),
                decl(Protocol::Udp, 8082, false, 0),
            ],
            ..Default::default()
        };
        let ports: Vec<u16> = cfg
            .plan_mappings()
            .unwrap()
            .iter()
            .map(|p| p.request.external_port)
            .collect();
        assert_eq!(ports, vec![54005, 54000]);
    }

    #[test]
    fn port_overflow_is_rejected() {
        let cfg = Configuration {
            port_range: PortRange { start: 65535, end: 65535 },
            mappings: vec![decl(Protocol::Tcp, 1, false, 1)],
            ..Default::default()
        };
        assert!(matches!(cfg.plan_mappings(), Err(ProxyError::InvalidPort(_))));
    }

    #[test]
    fn load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "autoPort": true, "denylist": ["10.9.9.9"] }}"#).unwrap();
        let (cfg, source) = Configuration::load(Some(file.path())).unwrap();
        assert!(cfg.auto_port);
        assert_eq!(cfg.denylist, vec!["10.9.9.9".to_string()]);
        assert_eq!(source.as_deref(), Some(file.path()));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(Configuration::load(Some(&missing)).is_err());
    }

    #[test]
    fn load_malformed_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            Configuration::from_file(file.path()),
            Err(ProxyError::Config(_))
        ));
    }
}

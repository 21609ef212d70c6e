//! portproxy-core: shared library for the portproxy forwarder.
//!
//! Provides the configuration schema and startup port planning, the
//! source-IP access controller, mapping identities and records, and the
//! error taxonomy used by the forwarding engines.

pub mod access;
pub mod config;
pub mod error;
pub mod mapping;

// Re-export commonly used items at crate root.
pub use access::{AccessController, AccessPolicy};
pub use config::{Configuration, MappingDecl, PlannedMapping, PortRange};
pub use error::{ProxyError, ProxyResult};
pub use mapping::{ActiveMapping, MappingId, MappingRequest, Protocol, Target};

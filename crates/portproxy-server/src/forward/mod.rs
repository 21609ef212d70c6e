//! Forwarding core: per-protocol engines, termination and the mapping registry.
//!
//! # Submodule Architecture
//!
//! - **[`terminator`]**: The [`Terminator`] coordinator task. Every engine
//!   registers its listener and session sockets under the mapping's
//!   identity; unmap and shutdown requests flow through it.
//!
//! - **[`tcp`]**: Binds one listener per mapping, applies access control to
//!   each accepted connection, dials the internal target, and runs two
//!   independent relay loops per connection.
//!
//! - **[`udp`]**: Binds one socket per mapping and multiplexes client
//!   addresses onto dedicated upstream sockets, piping replies back.
//!
//! - **[`registry`]**: The [`MappingRegistry`], which assigns identities and
//!   owns engine startup and removal.
//!
//! - **[`framing`]**: Chunked read reassembly shared by both engines.
//!
//! # Data Flow
//!
//! ```text
//! MappingRegistry::add
//!   → tcp::start / udp::start
//!       → bind, Terminator::guard(id)
//!       → spawn accept / datagram loop
//!           → AccessController::is_allowed
//!           → dial internal target, Terminator::guard(id)
//!           → spawn relay / reply tasks
//! MappingRegistry::remove → Terminator::close(id) → loops observe CloseSignal
//! ```

pub mod framing;
pub mod registry;
pub mod tcp;
pub mod terminator;
pub mod udp;

#[cfg(test)]
pub(crate) mod test_support;

pub use registry::MappingRegistry;
pub use terminator::{CloseSignal, Terminator};

use portproxy_core::AccessController;
use std::net::IpAddr;
use std::sync::Arc;

/// Immutable context handed to every engine at construction.
#[derive(Clone)]
pub struct ForwardContext {
    /// Source-IP access decisions.
    pub access: Arc<AccessController>,
    /// Termination coordinator handle.
    pub terminator: Terminator,
    /// Local address listeners bind to.
    pub listen_address: IpAddr,
}

impl ForwardContext {
    pub fn new(access: AccessController, terminator: Terminator, listen_address: IpAddr) -> Self {
        Self {
            access: Arc::new(access),
            terminator,
            listen_address,
        }
    }
}

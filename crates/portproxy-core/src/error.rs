use std::net::SocketAddr;
use thiserror::Error;

use crate::mapping::MappingId;

/// Errors produced by the forwarding core and its configuration layer.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidCommand(String),

    #[error("invalid protocol: {0} (expected tcp, udp or both)")]
    InvalidProtocol(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("mapping not found: {0}")]
    MappingNotFound(MappingId),

    #[error("mapping identities exhausted")]
    IdentitiesExhausted,

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve {target}: {reason}")]
    Resolve { target: String, reason: String },

    #[error("termination coordinator is gone")]
    CoordinatorGone,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Config(e.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

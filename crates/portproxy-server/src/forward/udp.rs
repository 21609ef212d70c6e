//! UDP forwarding: NAT-like sessions keyed by client address.
//!
//! One external socket per mapping. The first datagram from a client
//! address is vetted by access control; if accepted, a dedicated upstream
//! socket is connected to the internal target and a reply task pipes its
//! datagrams back to that client through the external socket. Sessions live
//! until the mapping is closed; there is no idle expiry.

use super::framing::{recv_message, recv_message_from, CHUNK_SIZE};
use super::{CloseSignal, ForwardContext};
use portproxy_core::{MappingId, ProxyError, ProxyResult, Target};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

/// Resolve the target, bind the mapping's socket, and spawn its loop.
///
/// Returns the port actually bound.
///
/// # Errors
///
/// [`ProxyError::Resolve`] if the internal target has no address,
/// [`ProxyError::Bind`] if the external socket cannot be bound.
pub async fn start(
    ctx: ForwardContext,
    id: MappingId,
    port: u16,
    target: Target,
) -> ProxyResult<u16> {
    let upstream_addr = resolve(&target).await?;

    let addr = SocketAddr::new(ctx.listen_address, port);
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })?;
    let actual_port = socket.local_addr().map(|a| a.port()).unwrap_or(port);

    let close = ctx.terminator.guard(id);
    info!(mapping_id = id, addr = %addr, actual_port, target = %target, "udp listener started");

    let engine = UdpEngine {
        id,
        ctx,
        upstream_addr,
        external: Arc::new(socket),
        sessions: HashMap::new(),
    };
    tokio::spawn(async move {
        engine.run(close).await;
        debug!(mapping_id = id, "udp datagram loop ended");
    });

    Ok(actual_port)
}

async fn resolve(target: &Target) -> ProxyResult<SocketAddr> {
    let authority = target.authority();
    let mut addrs = lookup_host(&authority).await.map_err(|e| ProxyError::Resolve {
        target: authority.clone(),
        reason: e.to_string(),
    })?;
    addrs.next().ok_or_else(|| ProxyError::Resolve {
        target: authority.clone(),
        reason: "no addresses".to_string(),
    })
}

/// Per-mapping state, owned by the datagram loop.
struct UdpEngine {
    id: MappingId,
    ctx: ForwardContext,
    upstream_addr: SocketAddr,
    external: Arc<UdpSocket>,
    /// Client address to its dedicated upstream socket.
    sessions: HashMap<SocketAddr, Arc<UdpSocket>>,
}

impl UdpEngine {
    async fn run(mut self, mut close: CloseSignal) {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let (message, client) =
                match close.or_closed(recv_message_from(&self.external, &mut buf)).await {
                    None => {
                        debug!(mapping_id = self.id, "udp listener closed");
                        break;
                    }
                    Some(Ok(received)) => received,
                    Some(Err(e)) => {
                        warn!(mapping_id = self.id, error = %e, "udp listener read error");
                        break;
                    }
                };

            let upstream = match self.sessions.get(&client) {
                Some(upstream) => upstream.clone(),
                None => match self.open_session(client).await {
                    Some(upstream) => upstream,
                    None => continue,
                },
            };

            if let Err(e) = upstream.send(&message).await {
                debug!(mapping_id = self.id, client = %client, error = %e, "udp upstream send failed");
            }
        }
    }

    /// Vet a new client and dial its upstream socket. `None` drops the datagram.
    async fn open_session(&mut self, client: SocketAddr) -> Option<Arc<UdpSocket>> {
        if !self.ctx.access.is_allowed(client) {
            debug!(mapping_id = self.id, client = %client, "udp datagram rejected by access control");
            return None;
        }

        let local = if self.upstream_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = match UdpSocket::bind(local).await {
            Ok(s) => s,
            Err(e) => {
                warn!(mapping_id = self.id, error = %e, "udp session bind failed");
                return None;
            }
        };
        if let Err(e) = socket.connect(self.upstream_addr).await {
            warn!(
                mapping_id = self.id,
                target = %self.upstream_addr,
                error = %e,
                "udp dial to internal target failed"
            );
            return None;
        }

        let upstream = Arc::new(socket);
        let close = self.ctx.terminator.guard(self.id);
        tokio::spawn(reply_loop(
            upstream.clone(),
            self.external.clone(),
            client,
            close,
            self.id,
        ));
        self.sessions.insert(client, upstream.clone());
        info!(
            mapping_id = self.id,
            client = %client,
            sessions = self.sessions.len(),
            "udp session opened"
        );
        Some(upstream)
    }
}

/// Pipe datagrams from one session's upstream socket back to its client.
///
/// Read errors other than close are logged and the loop keeps going.
async fn reply_loop(
    upstream: Arc<UdpSocket>,
    external: Arc<UdpSocket>,
    client: SocketAddr,
    mut close: CloseSignal,
    id: MappingId,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let message = match close.or_closed(recv_message(&upstream, &mut buf)).await {
            None => break,
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(mapping_id = id, client = %client, error = %e, "udp reply read error");
                continue;
            }
        };
        if let Err(e) = external.send_to(&message, client).await {
            debug!(mapping_id = id, client = %client, error = %e, "udp reply send failed");
        }
    }
    debug!(mapping_id = id, client = %client, "udp session closed");
}

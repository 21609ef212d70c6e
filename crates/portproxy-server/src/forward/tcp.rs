//! TCP forwarding: one listener per mapping, two relay loops per connection.
//!
//! The listener and every outbound dial are registered with the
//! [`Terminator`](super::Terminator) under the mapping's identity, so an
//! unmap closes accepted connections as well as the listener.

use super::framing::{read_message, CHUNK_SIZE};
use super::{CloseSignal, ForwardContext};
use portproxy_core::{MappingId, ProxyError, ProxyResult, Target};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bind the mapping's listener and spawn its accept loop.
///
/// Returns the port actually bound (differs from `port` when `port` is 0).
///
/// # Errors
///
/// Returns [`ProxyError::Bind`] if the listener cannot be bound. Nothing is
/// registered or spawned in that case.
pub async fn start(
    ctx: ForwardContext,
    id: MappingId,
    port: u16,
    target: Target,
) -> ProxyResult<u16> {
    let addr = SocketAddr::new(ctx.listen_address, port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })?;
    let actual_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

    let close = ctx.terminator.guard(id);
    info!(mapping_id = id, addr = %addr, actual_port, target = %target, "tcp listener started");

    tokio::spawn(async move {
        accept_loop(listener, close, ctx, id, Arc::new(target)).await;
        debug!(mapping_id = id, "tcp accept loop ended");
    });

    Ok(actual_port)
}

async fn accept_loop(
    listener: TcpListener,
    mut close: CloseSignal,
    ctx: ForwardContext,
    id: MappingId,
    target: Arc<Target>,
) {
    loop {
        match close.or_closed(listener.accept()).await {
            None => {
                debug!(mapping_id = id, "tcp listener closed");
                break;
            }
            Some(Ok((stream, peer))) => {
                tokio::spawn(handle_connection(stream, peer, ctx.clone(), id, target.clone()));
            }
            Some(Err(e)) => {
                warn!(mapping_id = id, error = %e, "tcp accept failed");
                break;
            }
        }
    }
}

/// Vet, dial, and relay one accepted connection.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ForwardContext,
    id: MappingId,
    target: Arc<Target>,
) {
    if !ctx.access.is_allowed(peer) {
        debug!(mapping_id = id, peer = %peer, "tcp connection rejected by access control");
        return;
    }

    info!(mapping_id = id, peer = %peer, target = %target, "handling tcp connection");
    let upstream = match TcpStream::connect(target.authority()).await {
        Ok(s) => s,
        Err(e) => {
            warn!(mapping_id = id, target = %target, error = %e, "tcp dial to internal target failed");
            return;
        }
    };

    let close = ctx.terminator.guard(id);
    let (client_read, client_write) = stream.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    tokio::spawn(relay(client_read, upstream_write, close.clone(), id, "client->internal"));
    tokio::spawn(relay(upstream_read, client_write, close, id, "internal->client"));
}

/// One direction of a connection. Ends on close, end-of-stream, or error;
/// the other direction keeps running.
async fn relay(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    mut close: CloseSignal,
    id: MappingId,
    direction: &'static str,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let message = match close.or_closed(read_message(&mut from, &mut buf)).await {
            None => {
                debug!(mapping_id = id, direction, "relay closed");
                return;
            }
            Some(Ok(Some(message))) => message,
            Some(Ok(None)) => {
                debug!(mapping_id = id, direction, "end of stream");
                break;
            }
            Some(Err(e)) => {
                warn!(mapping_id = id, direction, error = %e, "tcp read error");
                break;
            }
        };

        match close.or_closed(to.write_all(&message)).await {
            None => return,
            Some(Ok(())) => {}
            Some(Err(e)) => {
                debug!(mapping_id = id, direction, error = %e, "tcp write error");
                break;
            }
        }
    }

    // Propagate the half-close; the opposite direction is unaffected.
    let _ = to.shutdown().await;
}

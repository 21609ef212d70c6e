//! Loopback fixtures shared by the engine and registry tests.

use super::{ForwardContext, Terminator};
use portproxy_core::{AccessController, AccessPolicy};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};

pub(crate) fn context_with(policy: AccessPolicy) -> ForwardContext {
    ForwardContext::new(
        AccessController::new(&policy, None),
        Terminator::spawn(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
}

pub(crate) fn context(allow_loopback: bool) -> ForwardContext {
    context_with(AccessPolicy {
        allow_loopback,
        ..Default::default()
    })
}

pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// TCP echo server on an ephemeral loopback port.
pub(crate) async fn tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// UDP echo server that also records every distinct peer it has seen.
pub(crate) async fn udp_echo() -> (u16, Arc<Mutex<HashSet<SocketAddr>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let peers = Arc::new(Mutex::new(HashSet::new()));
    let seen = peers.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            seen.lock().unwrap().insert(from);
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    (port, peers)
}

/// A loopback port that nothing listens on (at the time of the call).
pub(crate) async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

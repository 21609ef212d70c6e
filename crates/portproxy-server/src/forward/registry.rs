//! The set of active mappings: identity assignment, engine startup, removal.

use super::{tcp, udp, ForwardContext};
use portproxy_core::{
    ActiveMapping, MappingId, MappingRequest, PlannedMapping, ProxyError, ProxyResult,
};
use tracing::{error, info, warn};

/// Active mappings, owned by the console task.
///
/// Identities start at 0, increase by one per [`add`](Self::add) call, and
/// are never reused within a process, even after removal or a failed start.
pub struct MappingRegistry {
    ctx: ForwardContext,
    next_id: MappingId,
    mappings: Vec<ActiveMapping>,
}

impl MappingRegistry {
    pub fn new(ctx: ForwardContext) -> Self {
        Self {
            ctx,
            next_id: 0,
            mappings: Vec::new(),
        }
    }

    /// Assign an identity and start the engine(s) for `request`.
    ///
    /// For [`Protocol::Both`](portproxy_core::Protocol::Both) the TCP and UDP
    /// engines start independently; UDP binds the port TCP obtained. The
    /// mapping is recorded if at least one engine started.
    ///
    /// # Errors
    ///
    /// Returns the startup error when no engine could start (the identity is
    /// still consumed), or [`ProxyError::IdentitiesExhausted`].
    pub async fn add(&mut self, request: MappingRequest) -> ProxyResult<ActiveMapping> {
        let id = self.allocate_id()?;
        let external_port = self.start_engines(id, &request).await?;

        let mapping = ActiveMapping {
            id,
            protocol: request.protocol,
            external_port,
            target: request.target,
        };
        info!(
            mapping_id = id,
            protocol = %mapping.protocol,
            port = external_port,
            target = %mapping.target,
            "mapping started"
        );
        self.mappings.push(mapping.clone());
        Ok(mapping)
    }

    /// Start every planned startup mapping, logging the ones that fail.
    ///
    /// Returns the number that started.
    pub async fn add_planned(&mut self, planned: Vec<PlannedMapping>) -> usize {
        let mut started = 0;
        for PlannedMapping { index, request } in planned {
            match self.add(request).await {
                Ok(_) => started += 1,
                Err(e) => error!(index, error = %e, "failed to start configured mapping"),
            }
        }
        started
    }

    /// Remove a mapping and close everything registered under it.
    ///
    /// The record disappears from [`list`](Self::list) immediately; the
    /// sockets close as their owners observe the signal.
    ///
    /// # Errors
    ///
    /// [`ProxyError::MappingNotFound`] if `id` is not active (including a
    /// second removal of the same identity).
    pub async fn remove(&mut self, id: MappingId) -> ProxyResult<ActiveMapping> {
        let position = self
            .mappings
            .iter()
            .position(|m| m.id == id)
            .ok_or(ProxyError::MappingNotFound(id))?;
        let mapping = self.mappings.remove(position);

        let signaled = self.ctx.terminator.close(id).await?;
        info!(mapping_id = id, signaled, "mapping removed");
        Ok(mapping)
    }

    /// Snapshot of the active mappings, in creation order.
    pub fn list(&self) -> Vec<ActiveMapping> {
        self.mappings.clone()
    }

    /// Close every mapping (process shutdown).
    pub async fn close_all(&mut self) -> ProxyResult<usize> {
        self.mappings.clear();
        let signaled = self.ctx.terminator.close_all().await?;
        info!(signaled, "all mappings closed");
        Ok(signaled)
    }

    fn allocate_id(&mut self) -> ProxyResult<MappingId> {
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or(ProxyError::IdentitiesExhausted)?;
        Ok(id)
    }

    async fn start_engines(&self, id: MappingId, request: &MappingRequest) -> ProxyResult<u16> {
        let mut port = request.external_port;
        let mut started = false;
        let mut first_error = None;

        if request.protocol.includes_tcp() {
            match tcp::start(self.ctx.clone(), id, port, request.target.clone()).await {
                Ok(actual) => {
                    port = actual;
                    started = true;
                }
                Err(e) => {
                    warn!(mapping_id = id, error = %e, "tcp engine failed to start");
                    first_error = Some(e);
                }
            }
        }

        if request.protocol.includes_udp() {
            match udp::start(self.ctx.clone(), id, port, request.target.clone()).await {
                Ok(actual) => {
                    port = actual;
                    started = true;
                }
                Err(e) => {
                    warn!(mapping_id = id, error = %e, "udp engine failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !started => Err(e),
            _ => Ok(port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::test_support::{context, tcp_echo, udp_echo};
    use portproxy_core::{Configuration, MappingDecl, PortRange, Protocol, Target};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn request(protocol: Protocol, target_port: u16) -> MappingRequest {
        MappingRequest {
            protocol,
            external_port: 0,
            target: Target::new(None, target_port),
        }
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let mut registry = MappingRegistry::new(context(true));
        let echo = tcp_echo().await;

        let a = registry.add(request(Protocol::Tcp, echo)).await.unwrap();
        let b = registry.add(request(Protocol::Tcp, echo)).await.unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(registry.list(), vec![a.clone(), b.clone()]);

        let removed = registry.remove(a.id).await.unwrap();
        assert_eq!(removed, a);
        assert_eq!(registry.list(), vec![b]);

        assert!(matches!(
            registry.remove(a.id).await,
            Err(ProxyError::MappingNotFound(0))
        ));
    }

    #[tokio::test]
    async fn test_identities_never_reused() {
        let mut registry = MappingRegistry::new(context(true));
        let echo = tcp_echo().await;

        let mut last = None;
        for _ in 0..4 {
            let m = registry.add(request(Protocol::Tcp, echo)).await.unwrap();
            if let Some(prev) = last {
                assert!(m.id > prev);
            }
            registry.remove(m.id).await.unwrap();
            last = Some(m.id);
        }

        // A failed start still consumes its identity.
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = MappingRequest {
            external_port: taken.local_addr().unwrap().port(),
            ..request(Protocol::Tcp, echo)
        };
        assert!(registry.add(busy).await.is_err());
        let next = registry.add(request(Protocol::Tcp, echo)).await.unwrap();
        assert_eq!(next.id, 5);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_closes_listener() {
        let mut registry = MappingRegistry::new(context(true));
        let echo = tcp_echo().await;
        let m = registry.add(request(Protocol::Tcp, echo)).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", m.external_port)).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();

        registry.remove(m.id).await.unwrap();
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_both_shares_external_port() {
        let mut registry = MappingRegistry::new(context(true));
        // TCP and UDP echo on different internal ports cannot share one
        // target, so point both at the UDP echo port and only exercise UDP.
        let (udp_port, _) = udp_echo().await;
        let m = registry.add(request(Protocol::Both, udp_port)).await.unwrap();
        assert_eq!(m.protocol, Protocol::Both);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", m.external_port)).await.unwrap();
        client.send(b"dual").await.unwrap();
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, client.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dual");

        // And the TCP listener accepts on the same port.
        assert!(TcpStream::connect(("127.0.0.1", m.external_port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_all_clears() {
        let mut registry = MappingRegistry::new(context(true));
        let echo = tcp_echo().await;
        registry.add(request(Protocol::Tcp, echo)).await.unwrap();
        registry.add(request(Protocol::Tcp, echo)).await.unwrap();
        assert_eq!(registry.close_all().await.unwrap(), 2);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_add_planned_from_config() {
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let start = free.local_addr().unwrap().port();
        drop(free);

        let echo = tcp_echo().await;
        let decl = |disabled| MappingDecl {
            disabled,
            protocol: Protocol::Tcp,
            internal_ip: None,
            internal_port: echo,
            port_offset: 0,
        };
        let cfg = Configuration {
            port_range: PortRange { start, end: start },
            auto_port: true,
            mappings: vec![decl(false), decl(true)],
            ..Default::default()
        };

        let mut registry = MappingRegistry::new(context(true));
        let started = registry.add_planned(cfg.plan_mappings().unwrap()).await;
        assert_eq!(started, 1);
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 0);
        assert_eq!(listed[0].external_port, start);
    }
}

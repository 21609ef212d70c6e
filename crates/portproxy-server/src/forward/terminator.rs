//! Rendezvous-based termination of mapping resources.
//!
//! A single coordinator task owns a table of `mapping_id` to pending close
//! notifications. Every task that owns a closable resource (a listener, an
//! outbound dial, a UDP session socket) registers under its mapping's
//! identity and receives a [`CloseHandle`]. [`Terminator::close`] signals
//! every handle registered under one identity; [`Terminator::close_all`]
//! signals everything.
//!
//! Resource owners normally use [`Terminator::guard`], which spawns a waiter
//! task that awaits the handle and then trips a [`CloseSignal`] latch. The
//! owner's loops observe the latch, drop their socket, and exit. The only
//! cross-task communication is the signal itself.

use portproxy_core::{MappingId, ProxyError, ProxyResult};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Commands accepted by the coordinator task.
enum Command {
    Register {
        id: MappingId,
        notify: oneshot::Sender<()>,
    },
    Close {
        id: MappingId,
        ack: oneshot::Sender<usize>,
    },
    CloseAll {
        ack: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the termination coordinator.
#[derive(Clone)]
pub struct Terminator {
    tx: mpsc::UnboundedSender<Command>,
}

impl Terminator {
    /// Spawn the coordinator task and return a handle to it.
    ///
    /// The coordinator runs until every `Terminator` clone is dropped, at
    /// which point all outstanding handles resolve as closed.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Coordinator::default().run(rx));
        Self { tx }
    }

    /// Register a closable resource under `id`.
    ///
    /// May be called any number of times per identity. If the coordinator
    /// is gone the returned handle resolves immediately.
    pub fn register(&self, id: MappingId) -> CloseHandle {
        let (notify, rx) = oneshot::channel();
        // A failed send drops `notify`, which resolves the handle.
        let _ = self.tx.send(Command::Register { id, notify });
        CloseHandle { rx }
    }

    /// Register under `id` and spawn the waiter that trips the returned latch.
    ///
    /// The waiter exits early, without signaling, once every clone of the
    /// latch has been dropped (the resource finished on its own).
    pub fn guard(&self, id: MappingId) -> CloseSignal {
        let handle = self.register(id);
        let (latch, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.wait() => {
                    debug!(mapping_id = id, "close signal delivered");
                    let _ = latch.send(true);
                }
                _ = latch.closed() => {}
            }
        });
        CloseSignal { rx }
    }

    /// Signal every resource registered under `id`.
    ///
    /// Returns how many live resources were signaled. Closing an identity
    /// with nothing registered is a no-op that returns `0`. The identity is
    /// retired: later registrations under it are signaled immediately.
    pub async fn close(&self, id: MappingId) -> ProxyResult<usize> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Close { id, ack })
            .map_err(|_| ProxyError::CoordinatorGone)?;
        rx.await.map_err(|_| ProxyError::CoordinatorGone)
    }

    /// Signal every registered resource across all identities.
    pub async fn close_all(&self) -> ProxyResult<usize> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::CloseAll { ack })
            .map_err(|_| ProxyError::CoordinatorGone)?;
        rx.await.map_err(|_| ProxyError::CoordinatorGone)
    }
}

/// Single-use notification that the registered resource must close.
pub struct CloseHandle {
    rx: oneshot::Receiver<()>,
}

impl CloseHandle {
    /// Wait for the close signal. A vanished coordinator counts as one.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Close latch shared by the loops that use one resource.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once the resource has been told to close.
    pub async fn closed(&mut self) {
        // An error means the waiter is gone, which only happens after it
        // has sent the signal or the coordinator shut down.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    /// Drive `fut` unless the resource is closed first. `None` means closed.
    pub async fn or_closed<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.closed() => None,
            out = fut => Some(out),
        }
    }
}

/// State owned exclusively by the coordinator task.
#[derive(Default)]
struct Coordinator {
    table: HashMap<MappingId, Vec<oneshot::Sender<()>>>,
    retired: HashSet<MappingId>,
    shutting_down: bool,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register { id, notify } => self.register(id, notify),
                Command::Close { id, ack } => {
                    let signaled = self.close(id);
                    let _ = ack.send(signaled);
                }
                Command::CloseAll { ack } => {
                    let signaled = self.close_all();
                    let _ = ack.send(signaled);
                }
            }
        }
        debug!("termination coordinator stopped");
    }

    fn register(&mut self, id: MappingId, notify: oneshot::Sender<()>) {
        if self.shutting_down || self.retired.contains(&id) {
            let _ = notify.send(());
            return;
        }
        let pending = self.table.entry(id).or_default();
        // Owners that finished on their own have dropped their receivers.
        pending.retain(|n| !n.is_closed());
        pending.push(notify);
    }

    fn close(&mut self, id: MappingId) -> usize {
        self.retired.insert(id);
        let signaled = self.table.remove(&id).map(signal).unwrap_or(0);
        debug!(mapping_id = id, signaled, "mapping closed");
        signaled
    }

    fn close_all(&mut self) -> usize {
        self.shutting_down = true;
        let signaled = self.table.drain().map(|(_, pending)| signal(pending)).sum();
        debug!(signaled, "all mappings closed");
        signaled
    }
}

fn signal(pending: Vec<oneshot::Sender<()>>) -> usize {
    pending
        .into_iter()
        .map(|notify| notify.send(()))
        .filter(Result::is_ok)
        .count()
}

//! The socket owner: one receive loop, one egress writer, and the
//! registry of per-peer factories.
//!
//! All socket reads happen on a single spawned task that decodes each
//! datagram and routes it by source address. All writes funnel through a
//! single mpsc-fed writer task, so factories and transports never touch
//! the socket directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use peermux_protocol::Frame;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::factory::Factory;

/// Largest datagram the receive loop will accept.
const MAX_DATAGRAM: usize = 65_535;

/// Construction parameters for [`Manager`].
///
/// The socket must already be bound. The queue fields bound the internal
/// hand-off channels; on overflow a frame or notification is dropped with
/// a warning rather than stalling the receive loop.
pub struct ManagerConfig {
    pub socket: UdpSocket,
    /// New-factory notifications held for [`Manager::next_factory`].
    pub factory_queue: usize,
    /// New-transport notifications per factory.
    pub transport_queue: usize,
    /// Inbound data payloads per transport.
    pub data_queue: usize,
    /// Inbound track events per transport.
    pub track_event_queue: usize,
    /// Outbound frames awaiting the socket writer.
    pub egress_queue: usize,
}

impl ManagerConfig {
    pub fn new(socket: UdpSocket) -> ManagerConfig {
        ManagerConfig {
            socket,
            factory_queue: 16,
            transport_queue: 16,
            data_queue: 256,
            track_event_queue: 64,
            egress_queue: 256,
        }
    }
}

/// Per-factory queue sizes, carried from the config into each factory.
#[derive(Clone, Copy)]
pub(crate) struct QueueSizes {
    pub(crate) transports: usize,
    pub(crate) data: usize,
    pub(crate) track_events: usize,
}

/// Shared capability to enqueue outbound frames for the socket writer.
#[derive(Clone, Debug)]
pub(crate) struct Egress {
    tx: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl Egress {
    /// Best-effort enqueue; a full or closed queue drops the frame.
    pub(crate) fn send(&self, addr: SocketAddr, frame: &Frame) {
        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("failed to encode outbound frame for {}: {}", addr, e);
                return;
            }
        };
        match self.tx.try_send((addr, encoded)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("egress queue full, dropping frame for {}", addr);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("egress stopped, dropping frame for {}", addr);
            }
        }
    }
}

pub(crate) struct ManagerInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pub(crate) factories: RwLock<HashMap<SocketAddr, Arc<Factory>>>,
    factories_tx: RwLock<Option<mpsc::Sender<Arc<Factory>>>>,
    egress: Egress,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    queues: QueueSizes,
}

/// Owns the shared UDP socket and the per-remote-address factory
/// registry. Everything beneath it is closed when the manager closes.
pub struct Manager {
    inner: Arc<ManagerInner>,
    factories_rx: Mutex<mpsc::Receiver<Arc<Factory>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Take ownership of an already-bound socket and start the receive
    /// loop and egress writer.
    pub fn new(config: ManagerConfig) -> Result<Manager> {
        let local_addr = config.socket.local_addr()?;
        let socket = Arc::new(config.socket);
        let (factories_tx, factories_rx) = mpsc::channel(config.factory_queue.max(1));
        let (egress_tx, egress_rx) = mpsc::channel(config.egress_queue.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ManagerInner {
            socket: socket.clone(),
            local_addr,
            factories: RwLock::new(HashMap::new()),
            factories_tx: RwLock::new(Some(factories_tx)),
            egress: Egress { tx: egress_tx },
            closed: AtomicBool::new(false),
            shutdown_tx,
            queues: QueueSizes {
                transports: config.transport_queue.max(1),
                data: config.data_queue.max(1),
                track_events: config.track_event_queue.max(1),
            },
        });

        tracing::debug!("transport manager listening on {}", local_addr);

        let recv_task = tokio::spawn(recv_loop(inner.clone(), shutdown_rx.clone()));
        let egress_task = tokio::spawn(egress_loop(socket, egress_rx, shutdown_rx, inner.clone()));

        Ok(Manager {
            inner,
            factories_rx: Mutex::new(factories_rx),
            tasks: Mutex::new(vec![recv_task, egress_task]),
        })
    }

    /// Address of the owned socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Await the next newly created factory — one per distinct remote
    /// address first observed, whether by a local [`Manager::get_factory`]
    /// call or by an inbound datagram from an unknown peer. Returns `None`
    /// once the manager is closed and the queue is drained.
    pub async fn next_factory(&self) -> Option<Arc<Factory>> {
        self.factories_rx.lock().await.recv().await
    }

    /// Return the factory for `addr`, creating it if absent.
    ///
    /// Never blocks on network I/O; fails only once the manager is
    /// closed.
    pub async fn get_factory(&self, addr: SocketAddr) -> Result<Arc<Factory>> {
        self.inner.lookup_or_create(addr).await
    }

    /// Close the manager and everything beneath it.
    ///
    /// Idempotent. Stops the receive loop, closes every factory
    /// (cascading to their transports), closes the factory queue exactly
    /// once, and waits for both background tasks to finish.
    pub async fn close(&self) {
        self.inner.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl ManagerInner {
    async fn lookup_or_create(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Factory>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        if let Some(factory) = self.factories.read().await.get(&addr) {
            return Ok(factory.clone());
        }

        let mut factories = self.factories.write().await;
        // Re-check both ways under the write lock: another caller may have
        // created the factory, or shutdown may have drained the registry.
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(factory) = factories.get(&addr) {
            return Ok(factory.clone());
        }

        let factory = Factory::new(addr, self.egress.clone(), Arc::downgrade(self), self.queues);
        factories.insert(addr, factory.clone());
        let total = factories.len();
        drop(factories);

        tracing::debug!("created factory for {} ({} active)", addr, total);

        if let Some(tx) = &*self.factories_tx.read().await {
            match tx.try_send(factory.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("factory queue full, dropping notification for {}", addr);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        Ok(factory)
    }

    /// Idempotent cascade: mark closed, signal both tasks, close every
    /// factory, close the notification queue.
    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("transport manager on {} closing", self.local_addr);
        self.shutdown_tx.send_replace(true);

        let factories: Vec<Arc<Factory>> = self
            .factories
            .write()
            .await
            .drain()
            .map(|(_, factory)| factory)
            .collect();
        for factory in factories {
            factory.shutdown().await;
        }

        self.factories_tx.write().await.take();
    }
}

/// Reads datagrams off the shared socket and routes each to the factory
/// for its source address. A read error is fatal and starts the shutdown
/// cascade; a malformed datagram is dropped and logged.
async fn recv_loop(inner: Arc<ManagerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            received = inner.socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("socket read failed, shutting down: {}", e);
                    inner.shutdown().await;
                    break;
                }
            },
        };

        let frame = match Frame::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping malformed datagram from {}: {}", addr, e);
                continue;
            }
        };

        let factory = match inner.lookup_or_create(addr).await {
            Ok(factory) => factory,
            // Closed while the datagram was in flight.
            Err(_) => break,
        };
        factory.handle_frame(frame).await;
    }

    tracing::debug!("receive loop stopped");
}

/// Drains the egress queue onto the socket. A write error is fatal, like
/// a read error on the receive side.
async fn egress_loop(
    socket: Arc<UdpSocket>,
    mut egress_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    mut shutdown: watch::Receiver<bool>,
    inner: Arc<ManagerInner>,
) {
    loop {
        let (addr, datagram) = tokio::select! {
            _ = shutdown.changed() => break,
            item = egress_rx.recv() => match item {
                Some(pair) => pair,
                None => break,
            },
        };

        if let Err(e) = socket.send_to(&datagram, addr).await {
            tracing::error!("socket write to {} failed, shutting down: {}", addr, e);
            inner.shutdown().await;
            break;
        }
    }

    tracing::debug!("egress writer stopped");
}

//! One remote peer: the per-stream transport registry and inbound frame
//! routing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use peermux_protocol::{Frame, FrameKind, TrackEvent};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::error::{Result, TransportError};
use crate::manager::{Egress, ManagerInner, QueueSizes};
use crate::transport::Transport;

/// Represents one remote peer. Owns every transport multiplexed onto that
/// peer's address, routes the peer's inbound frames to them, and
/// announces newly created transports on its notification queue.
pub struct Factory {
    peer_addr: SocketAddr,
    pub(crate) transports: RwLock<HashMap<String, Arc<Transport>>>,
    transports_tx: RwLock<Option<mpsc::Sender<Arc<Transport>>>>,
    transports_rx: Mutex<mpsc::Receiver<Arc<Transport>>>,
    egress: Egress,
    manager: Weak<ManagerInner>,
    queues: QueueSizes,
    closed: AtomicBool,
}

impl Factory {
    pub(crate) fn new(
        peer_addr: SocketAddr,
        egress: Egress,
        manager: Weak<ManagerInner>,
        queues: QueueSizes,
    ) -> Arc<Factory> {
        let (transports_tx, transports_rx) = mpsc::channel(queues.transports);
        Arc::new(Factory {
            peer_addr,
            transports: RwLock::new(HashMap::new()),
            transports_tx: RwLock::new(Some(transports_tx)),
            transports_rx: Mutex::new(transports_rx),
            egress,
            manager,
            queues,
            closed: AtomicBool::new(false),
        })
    }

    /// Remote peer address this factory serves.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Originate a logical stream toward the peer.
    ///
    /// Registers a transport under `stream_id` and announces it with a
    /// stream-open frame. Returns immediately — the peer-side transport
    /// appears once the peer processes the announcement; there is no
    /// acknowledgment wait, and a lost announcement is not retried.
    /// Concurrent calls with the same id converge on the single
    /// registered transport.
    pub async fn new_transport(self: &Arc<Self>, stream_id: &str) -> Result<Arc<Transport>> {
        self.lookup_or_create(stream_id, true).await
    }

    /// Await the next transport created on this factory, whether locally
    /// originated or announced by the peer. Each transport appears
    /// exactly once; `None` once the factory is closed and the queue is
    /// drained.
    pub async fn next_transport(&self) -> Option<Arc<Transport>> {
        self.transports_rx.lock().await.recv().await
    }

    /// Close every owned transport, remove this factory from the
    /// manager's registry, and stop accepting frames. Idempotent.
    pub async fn close(&self) {
        self.shutdown().await
    }

    pub(crate) async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("factory for {} closing", self.peer_addr);

        let transports: Vec<Arc<Transport>> = self
            .transports
            .write()
            .await
            .drain()
            .map(|(_, transport)| transport)
            .collect();
        for transport in transports {
            transport.shutdown(true).await;
        }

        self.transports_tx.write().await.take();

        if let Some(manager) = self.manager.upgrade() {
            manager.factories.write().await.remove(&self.peer_addr);
        }
    }

    async fn lookup_or_create(self: &Arc<Self>, stream_id: &str, announce: bool) -> Result<Arc<Transport>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        if let Some(transport) = self.transports.read().await.get(stream_id) {
            return Ok(transport.clone());
        }

        let mut transports = self.transports.write().await;
        // Re-check under the write lock: a concurrent caller may have
        // registered the stream, or shutdown may have drained the map.
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(transport) = transports.get(stream_id) {
            return Ok(transport.clone());
        }

        let transport = Transport::new(
            stream_id.to_string(),
            self.peer_addr,
            self.egress.clone(),
            Arc::downgrade(self),
            self.queues,
        );
        transports.insert(stream_id.to_string(), transport.clone());
        if announce {
            // Enqueued before the lock drops so no data frame for this
            // stream can get ahead of the announcement.
            self.egress.send(self.peer_addr, &Frame::open(stream_id));
        }
        drop(transports);

        tracing::debug!("stream {} registered for {}", stream_id, self.peer_addr);

        if let Some(tx) = &*self.transports_tx.read().await {
            match tx.try_send(transport.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        "transport queue full, dropping notification for stream {}",
                        stream_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        Ok(transport)
    }

    /// Route one inbound frame to its stream.
    ///
    /// A stream-open for an unknown id creates the transport; any other
    /// kind for an unknown id is a late or stray frame and is dropped.
    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        if self.is_closed() {
            tracing::debug!("factory for {} closed, dropping frame", self.peer_addr);
            return;
        }

        if frame.kind == FrameKind::StreamOpen {
            // Duplicate opens converge on the already-registered stream.
            let _ = self.lookup_or_create(&frame.stream_id, false).await;
            return;
        }

        let transport = if frame.kind == FrameKind::StreamClose {
            self.transports.write().await.remove(&frame.stream_id)
        } else {
            self.transports.read().await.get(&frame.stream_id).cloned()
        };

        let Some(transport) = transport else {
            tracing::debug!(
                "dropping frame from {} for unknown stream {}",
                self.peer_addr,
                frame.stream_id
            );
            return;
        };

        match frame.kind {
            FrameKind::Data => transport.deliver_data(frame.payload).await,
            FrameKind::TrackEvent => match TrackEvent::decode(&frame.payload) {
                Ok(event) => transport.deliver_track_event(event).await,
                Err(e) => {
                    tracing::warn!(
                        "dropping malformed track event from {} for stream {}: {}",
                        self.peer_addr,
                        frame.stream_id,
                        e
                    );
                }
            },
            // The peer already tore its side down, so no close frame back.
            FrameKind::StreamClose => transport.shutdown(false).await,
            FrameKind::StreamOpen => {}
        }
    }
}

//! One logical bidirectional stream: media payloads in both directions
//! plus track lifecycle events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use peermux_protocol::{Frame, Track, TrackEvent, TrackEventKind, TrackInfo};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::error::{Result, TransportError};
use crate::factory::Factory;
use crate::manager::{Egress, QueueSizes};

/// One logical stream multiplexed onto the shared socket, identified by
/// the pair (remote address, stream id).
///
/// Consumers read inbound media payloads with [`Transport::recv`] and
/// track lifecycle events with [`Transport::next_track_event`]; both
/// return `None` once the transport has closed and the queue is drained.
#[derive(Debug)]
pub struct Transport {
    stream_id: String,
    peer_addr: SocketAddr,
    tracks: RwLock<HashMap<u32, TrackInfo>>,
    data_tx: RwLock<Option<mpsc::Sender<Bytes>>>,
    data_rx: Mutex<mpsc::Receiver<Bytes>>,
    events_tx: RwLock<Option<mpsc::Sender<TrackEvent>>>,
    events_rx: Mutex<mpsc::Receiver<TrackEvent>>,
    egress: Egress,
    factory: Weak<Factory>,
    closed: AtomicBool,
}

impl Transport {
    pub(crate) fn new(
        stream_id: String,
        peer_addr: SocketAddr,
        egress: Egress,
        factory: Weak<Factory>,
        queues: QueueSizes,
    ) -> Arc<Transport> {
        let (data_tx, data_rx) = mpsc::channel(queues.data);
        let (events_tx, events_rx) = mpsc::channel(queues.track_events);
        Arc::new(Transport {
            stream_id,
            peer_addr,
            tracks: RwLock::new(HashMap::new()),
            data_tx: RwLock::new(Some(data_tx)),
            data_rx: Mutex::new(data_rx),
            events_tx: RwLock::new(Some(events_tx)),
            events_rx: Mutex::new(events_rx),
            egress,
            factory,
            closed: AtomicBool::new(false),
        })
    }

    /// Stream identifier, doubling as the caller-visible label.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Announce a track to the peer and record it locally.
    pub async fn add_track(&self, track: &dyn Track) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let info = TrackInfo::from_track(track);
        let frame = Frame::track_event(self.stream_id.as_str(), &TrackEvent::add(info.clone()))?;
        self.egress.send(self.peer_addr, &frame);
        self.tracks.write().await.insert(info.ssrc, info);
        Ok(())
    }

    /// Tell the peer a track left the stream and drop the local record.
    ///
    /// Removing an SSRC that was never added is a logged no-op, keeping
    /// removal idempotent.
    pub async fn remove_track(&self, ssrc: u32) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let Some(info) = self.tracks.write().await.remove(&ssrc) else {
            tracing::debug!(
                "remove_track for unknown ssrc {} on stream {}",
                ssrc,
                self.stream_id
            );
            return Ok(());
        };
        let frame = Frame::track_event(self.stream_id.as_str(), &TrackEvent::remove(info))?;
        self.egress.send(self.peer_addr, &frame);
        Ok(())
    }

    /// Snapshot of the tracks currently associated with the stream.
    pub async fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.read().await.values().cloned().collect()
    }

    /// Await the next track lifecycle event observed from the peer.
    pub async fn next_track_event(&self) -> Option<TrackEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Await the next inbound media payload.
    pub async fn recv(&self) -> Option<Bytes> {
        self.data_rx.lock().await.recv().await
    }

    /// Send an opaque media payload to the peer. Best-effort, like every
    /// outbound frame: no delivery guarantee, no retransmission.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.egress
            .send(self.peer_addr, &Frame::data(self.stream_id.as_str(), payload));
        Ok(())
    }

    /// Close the stream: best-effort stream-close frame to the peer,
    /// unregister from the owning factory, close both inbound queues.
    /// Idempotent.
    pub async fn close(&self) {
        self.shutdown(true).await
    }

    /// One-shot teardown. `announce` is false when the close originated
    /// with the peer, so no close frame is echoed back.
    pub(crate) async fn shutdown(&self, announce: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("stream {} to {} closing", self.stream_id, self.peer_addr);

        if announce {
            self.egress
                .send(self.peer_addr, &Frame::close(self.stream_id.as_str()));
        }

        self.data_tx.write().await.take();
        self.events_tx.write().await.take();

        if let Some(factory) = self.factory.upgrade() {
            factory.transports.write().await.remove(&self.stream_id);
        }
    }

    /// Queue an inbound media payload for the consumer.
    pub(crate) async fn deliver_data(&self, payload: Bytes) {
        if let Some(tx) = &*self.data_tx.read().await {
            match tx.try_send(payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("data queue full, dropping payload for stream {}", self.stream_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Record the track change and queue the event for the consumer.
    pub(crate) async fn deliver_track_event(&self, event: TrackEvent) {
        match event.kind {
            TrackEventKind::Add => {
                self.tracks
                    .write()
                    .await
                    .insert(event.track.ssrc, event.track.clone());
            }
            TrackEventKind::Remove => {
                self.tracks.write().await.remove(&event.track.ssrc);
            }
        }

        if let Some(tx) = &*self.events_tx.read().await {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        "track event queue full, dropping event for stream {}",
                        self.stream_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

//! Peermux Transport
//!
//! A multiplexing transport layer that lets many independent logical media
//! streams share a single UDP socket between two endpoints of a media
//! relay. Inbound datagrams are demultiplexed first by remote address into
//! a per-peer [`Factory`], then by stream id into a per-stream
//! [`Transport`]. Either side can originate a stream; the other side
//! observes it on the factory's transport queue.
//!
//! Datagram semantics throughout: no delivery or ordering guarantees
//! across streams, no retransmission. A drained notification queue means
//! the component above it shut down. Diagnostics for dropped, malformed,
//! or stray datagrams go to whatever `tracing` subscriber the embedding
//! application installs.

mod error;
mod factory;
mod manager;
mod transport;

pub use error::{Result, TransportError};
pub use factory::Factory;
pub use manager::{Manager, ManagerConfig};
pub use transport::Transport;

pub use peermux_protocol::{
    Frame, FrameKind, ProtocolError, SimpleTrack, Track, TrackEvent, TrackEventKind, TrackInfo,
};

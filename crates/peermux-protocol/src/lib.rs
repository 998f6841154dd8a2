//! Peermux Wire Protocol
//!
//! Shared definitions for the frame format spoken on the multiplexed UDP
//! socket, and the track metadata exchanged over it. This crate is pure
//! data: no sockets, no async.

mod frame;
mod track;

pub use frame::{Frame, FrameKind, ProtocolError};
pub use track::{SimpleTrack, Track, TrackEvent, TrackEventKind, TrackInfo};

//! Track metadata exchanged between peers.
//!
//! A track event is the control message telling the remote side that a
//! media track joined or left a stream. Events travel as JSON inside a
//! track-event frame; the routing metadata is deliberately thin (payload
//! type, SSRC, stream label) — everything richer stays in the embedding
//! application's track model.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::ProtocolError;

/// Routing metadata for one media track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub payload_type: u8,
    pub ssrc: u32,
    pub label: String,
}

impl TrackInfo {
    pub fn from_track(track: &dyn Track) -> TrackInfo {
        TrackInfo {
            payload_type: track.payload_type(),
            ssrc: track.ssrc(),
            label: track.label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEventKind {
    Add,
    Remove,
}

/// A track lifecycle event as observed from (or announced to) the peer.
///
/// Wire form: `{"type":"add","payload_type":8,"ssrc":1,"label":"aa"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEvent {
    #[serde(rename = "type")]
    pub kind: TrackEventKind,
    #[serde(flatten)]
    pub track: TrackInfo,
}

impl TrackEvent {
    pub fn add(track: TrackInfo) -> TrackEvent {
        TrackEvent {
            kind: TrackEventKind::Add,
            track,
        }
    }

    pub fn remove(track: TrackInfo) -> TrackEvent {
        TrackEvent {
            kind: TrackEventKind::Remove,
            track,
        }
    }

    /// Serialize into a track-event frame payload.
    pub fn to_payload(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a received track-event frame payload.
    pub fn decode(payload: &[u8]) -> Result<TrackEvent, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// The view of a media track this transport layer needs.
///
/// Callers hand any implementor to `add_track`; the core only reads the
/// three routing fields.
pub trait Track {
    fn payload_type(&self) -> u8;
    fn ssrc(&self) -> u32;
    fn label(&self) -> &str;
}

/// Minimal owned [`Track`] implementation for embedders and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleTrack {
    payload_type: u8,
    ssrc: u32,
    label: String,
}

impl SimpleTrack {
    pub fn new(payload_type: u8, ssrc: u32, label: impl Into<String>) -> SimpleTrack {
        SimpleTrack {
            payload_type,
            ssrc,
            label: label.into(),
        }
    }
}

impl Track for SimpleTrack {
    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn label(&self) -> &str {
        &self.label
    }
}

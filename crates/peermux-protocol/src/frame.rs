//! Frame encoding and decoding for the multiplexed UDP socket.
//!
//! Every datagram carries exactly one frame:
//!
//! ```text
//! [kind:1][sid_len:2 BE][stream id][payload_len:2 BE][payload]
//! ```
//!
//! The stream id is the UTF-8 label naming the logical stream within one
//! peer pair. Decoding never panics on hostile input; malformed datagrams
//! come back as [`ProtocolError`] so the receive loop can drop and log them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::track::TrackEvent;

/// Fixed bytes before the stream id: kind plus the stream id length.
const HEADER_LEN: usize = 3;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("datagram too short for frame header ({0} bytes)")]
    HeaderTooShort(usize),

    #[error("unrecognized frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("frame truncated")]
    Truncated,

    #[error("stream id is not valid UTF-8")]
    InvalidStreamId,

    #[error("stream id too long ({0} bytes)")]
    StreamIdTooLong(usize),

    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),

    #[error("malformed control payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Discriminator selecting the frame semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Handshake announcing a new logical stream.
    StreamOpen = 1,
    /// The peer tore the stream down.
    StreamClose = 2,
    /// Opaque media payload.
    Data = 3,
    /// A track was added to or removed from the stream.
    TrackEvent = 4,
}

impl FrameKind {
    fn from_byte(value: u8) -> Option<FrameKind> {
        match value {
            1 => Some(FrameKind::StreamOpen),
            2 => Some(FrameKind::StreamClose),
            3 => Some(FrameKind::Data),
            4 => Some(FrameKind::TrackEvent),
            _ => None,
        }
    }
}

/// One wire frame: kind, owning stream id, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: String,
    pub payload: Bytes,
}

impl Frame {
    /// Stream-open handshake frame; the stream id carries the label.
    pub fn open(stream_id: impl Into<String>) -> Frame {
        Frame {
            kind: FrameKind::StreamOpen,
            stream_id: stream_id.into(),
            payload: Bytes::new(),
        }
    }

    /// Stream-close frame.
    pub fn close(stream_id: impl Into<String>) -> Frame {
        Frame {
            kind: FrameKind::StreamClose,
            stream_id: stream_id.into(),
            payload: Bytes::new(),
        }
    }

    /// Data frame wrapping an opaque media payload.
    pub fn data(stream_id: impl Into<String>, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Data,
            stream_id: stream_id.into(),
            payload,
        }
    }

    /// Track-event frame carrying a serialized [`TrackEvent`].
    pub fn track_event(
        stream_id: impl Into<String>,
        event: &TrackEvent,
    ) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            kind: FrameKind::TrackEvent,
            stream_id: stream_id.into(),
            payload: event.to_payload()?,
        })
    }

    /// Serialize the frame into a single datagram-sized buffer.
    ///
    /// Round-trips byte-for-byte with [`Frame::decode`] for all defined
    /// kinds. Stream ids and payloads longer than a u16 length field are
    /// encode-time errors.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let sid = self.stream_id.as_bytes();
        if sid.len() > u16::MAX as usize {
            return Err(ProtocolError::StreamIdTooLong(sid.len()));
        }
        if self.payload.len() > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + sid.len() + 2 + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u16(sid.len() as u16);
        buf.put_slice(sid);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse one frame out of a received datagram.
    ///
    /// Trailing bytes beyond the declared payload length are ignored.
    pub fn decode(mut buf: &[u8]) -> Result<Frame, ProtocolError> {
        if buf.remaining() < HEADER_LEN {
            return Err(ProtocolError::HeaderTooShort(buf.remaining()));
        }

        let kind_byte = buf.get_u8();
        let kind = FrameKind::from_byte(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;

        let sid_len = buf.get_u16() as usize;
        if buf.remaining() < sid_len + 2 {
            return Err(ProtocolError::Truncated);
        }
        let stream_id = std::str::from_utf8(&buf[..sid_len])
            .map_err(|_| ProtocolError::InvalidStreamId)?
            .to_string();
        buf.advance(sid_len);

        let payload_len = buf.get_u16() as usize;
        if buf.remaining() < payload_len {
            return Err(ProtocolError::Truncated);
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);

        Ok(Frame {
            kind,
            stream_id,
            payload,
        })
    }
}

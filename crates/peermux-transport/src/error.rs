use peermux_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation attempted on a closed manager, factory, or transport.
    #[error("transport is closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

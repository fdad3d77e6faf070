use thiserror::Error;

use crate::rtmp::amf0::AmfError;
use crate::rtmp::chunk::ChunkError;

/// Top-level error for one proxied session. Every variant is terminal: on any
/// of these the session driver closes both sockets and returns.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk stream error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("amf0 error: {0}")]
    Amf(#[from] AmfError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("chunk for csid {got} arrived mid-message for csid {expected}")]
    MultiStreamInterleave { expected: u32, got: u32 },

    #[error("failed to dial upstream {0}: {1}")]
    DialFailed(String, #[source] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

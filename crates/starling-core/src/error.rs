//! Error types for the mesh core.
//!
//! Errors are non-fatal to the node: callers log them or convert them to
//! broadcast error reports, then tear down only the affected connection,
//! listener or circuit.

use thiserror::Error;

use crate::id::StreamId;
use crate::message::MessageType;

/// Errors that can occur in mesh operations
#[derive(Debug, Error)]
pub enum Error {
    // ============ Codec Errors ============
    /// Envelope or payload failed to encode
    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),

    /// Envelope failed to decode
    #[error("envelope decode failed: {0}")]
    Decode(#[source] bincode::Error),

    /// Payload failed to decode for the given message type
    #[error("payload decode failed for {kind:?}: {source}")]
    PayloadDecode {
        /// Type of the message carrying the payload
        kind: MessageType,
        /// Underlying codec error
        #[source]
        source: bincode::Error,
    },

    /// Payload requested with the wrong type
    #[error("payload type mismatch: message is {actual:?}, expected {expected:?}")]
    PayloadMismatch {
        /// Type the caller asked for
        expected: MessageType,
        /// Type carried by the message
        actual: MessageType,
    },

    // ============ Connection Errors ============
    /// Connection outbound queue is full
    #[error("outbound queue full")]
    QueueFull,

    /// Connection has been closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] starling_transport::TransportError),

    /// Connector type not supported by this node
    #[error("unsupported connector: {0}")]
    UnsupportedConnector(String),

    // ============ Stream Errors ============
    /// Stream is closed or was never open
    #[error("stream {0} closed")]
    StreamClosed(StreamId),

    /// Stream could not bind its local resource
    #[error("stream bind failed: {0}")]
    StreamBind(String),

    // ============ Node Errors ============
    /// Terminate index does not name a live entry
    #[error("invalid termination index {0}")]
    InvalidIndex(u32),

    /// Node has shut down
    #[error("node is shut down")]
    Shutdown,

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueFull => true,
            Self::Transport(e) => e.is_transient(),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Result type for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

//! # Starling Transport
//!
//! Byte-level transport plumbing for the Starling mesh.
//!
//! This crate provides:
//! - Length-prefixed framing over any `AsyncRead`/`AsyncWrite` pair
//! - Optional `XChaCha20-Poly1305` sealing of every frame
//! - TCP dial/listen helpers with tuned sockets
//! - In-memory duplex links for tests and embedded meshes
//!
//! Envelope encoding lives one layer up; this crate only moves frames.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod framing;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use framing::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use transport::{
    BoxedReader, BoxedWriter, TransportError, TransportResult, TransportStats, TransportStatsSnapshot,
};

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
    /// TCP keepalive idle time in seconds (0 disables keepalive)
    pub keepalive_secs: u64,
    /// Listen backlog
    pub backlog: i32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            keepalive_secs: 30,
            backlog: 1024,
        }
    }
}

//! Transport error types and shared statistics.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use starling_crypto::CryptoError;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer announced a frame larger than allowed
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced size
        size: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// Frame failed to open (wrong key or tampering)
    #[error("Frame rejected: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                ) || is_resource_exhaustion(e)
            }
            Self::ConnectionFailed(_) => true,
            Self::Closed
            | Self::BindFailed(_)
            | Self::FrameTooLarge { .. }
            | Self::Crypto(_)
            | Self::InvalidConfig(_) => false,
        }
    }
}

/// Out of file descriptors or memory; an accept loop can back off and retry.
#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE
    matches!(e.raw_os_error(), Some(12 | 23 | 24))
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Type-erased read half of a byte channel
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a byte channel
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport statistics, shareable between the read and write halves.
#[derive(Debug, Default)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters
    #[must_use]
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let stats = TransportStats::new();
        assert_eq!(stats.snapshot(), TransportStatsSnapshot::default());

        stats.record_send(100);
        stats.record_recv(200);
        stats.record_send_error();
        stats.record_recv_error();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.bytes_received, 200);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.send_errors, 1);
        assert_eq!(snap.recv_errors, 1);
    }

    #[test]
    fn test_transient_classification() {
        let refused = TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_transient());
        let aborted = TransportError::Io(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(aborted.is_transient());
        #[cfg(unix)]
        assert!(TransportError::Io(io::Error::from_raw_os_error(24)).is_transient());
        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient());
        assert!(!TransportError::Closed.is_transient());
        assert!(
            !TransportError::FrameTooLarge { size: 10, max: 1 }.is_transient()
        );
    }
}

//! Length-prefixed frame codec.
//!
//! Each frame on the wire is a big-endian `u32` length followed by that many
//! body bytes. When a [`FrameKey`] is configured the body is a sealed
//! `nonce || ciphertext || tag` blob; otherwise it is the raw payload.
//!
//! ```text
//! +-----------+------------------------------------+
//! | len (u32) | body (len bytes)                   |
//! +-----------+------------------------------------+
//! ```

use std::io;
use std::sync::Arc;

use starling_crypto::FrameKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::{TransportError, TransportResult, TransportStats};

/// Largest body accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Associated data bound into every sealed frame.
const FRAME_AAD: &[u8] = b"starling/frame/v1";

/// Reads frames from an async byte source.
pub struct FrameReader<R> {
    inner: R,
    key: Option<FrameKey>,
    stats: Arc<TransportStats>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader. Frames are opened with `key` when present.
    pub fn new(inner: R, key: Option<FrameKey>) -> Self {
        Self {
            inner,
            key,
            stats: Arc::new(TransportStats::new()),
        }
    }

    /// Share a statistics block with another half.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<TransportStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, oversized frames, or frames that
    /// fail authentication.
    pub async fn read_frame(&mut self) -> TransportResult<Option<Vec<u8>>> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                self.stats.record_recv_error();
                return Err(e.into());
            }
        };

        if len > MAX_FRAME_SIZE {
            self.stats.record_recv_error();
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; len];
        if let Err(e) = self.inner.read_exact(&mut body).await {
            self.stats.record_recv_error();
            return Err(e.into());
        }
        self.stats.record_recv(len + 4);

        match &self.key {
            Some(key) => key.open(&body, FRAME_AAD).map(Some).map_err(|e| {
                self.stats.record_recv_error();
                e.into()
            }),
            None => Ok(Some(body)),
        }
    }
}

/// Writes frames to an async byte sink.
pub struct FrameWriter<W> {
    inner: W,
    key: Option<FrameKey>,
    stats: Arc<TransportStats>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer. Frames are sealed with `key` when present.
    pub fn new(inner: W, key: Option<FrameKey>) -> Self {
        Self {
            inner,
            key,
            stats: Arc::new(TransportStats::new()),
        }
    }

    /// Share a statistics block with another half.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<TransportStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Write one frame and flush it.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing fails, the frame exceeds
    /// [`MAX_FRAME_SIZE`], or the underlying write fails.
    pub async fn write_frame(&mut self, payload: &[u8]) -> TransportResult<()> {
        let body = match &self.key {
            Some(key) => key.seal(payload, FRAME_AAD)?,
            None => payload.to_vec(),
        };

        if body.len() > MAX_FRAME_SIZE {
            self.stats.record_send_error();
            return Err(TransportError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let result = async {
            self.inner.write_u32(body.len() as u32).await?;
            self.inner.write_all(&body).await?;
            self.inner.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.stats.record_send(body.len() + 4);
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }

    /// Shut down the write direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying shutdown fails.
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_frames_in_order() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a, None);
        let mut reader = FrameReader::new(b, None);

        writer.write_frame(b"first").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(b"third").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"first");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"third");
    }

    #[tokio::test]
    async fn test_sealed_frames() {
        let key = FrameKey::generate().unwrap();
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a, Some(key.clone()));
        let mut reader = FrameReader::new(b, Some(key));

        writer.write_frame(b"secret").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"secret");
    }

    #[tokio::test]
    async fn test_key_mismatch_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a, Some(FrameKey::generate().unwrap()));
        let mut reader = FrameReader::new(b, Some(FrameKey::generate().unwrap()));

        writer.write_frame(b"secret").await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(a, None);
        let mut reader = FrameReader::new(b, None);

        writer.write_frame(b"last").await.unwrap();
        drop(writer);

        assert!(reader.read_frame().await.unwrap().is_some());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b, None);

        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_stats() {
        let stats = Arc::new(TransportStats::new());
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a, None).with_stats(stats.clone());
        let mut reader = FrameReader::new(b, None).with_stats(stats.clone());

        writer.write_frame(b"abcd").await.unwrap();
        reader.read_frame().await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_sent, 8);
    }
}

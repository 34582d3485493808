//! Envelope connection over any framed byte channel.
//!
//! Outbound envelopes go through a bounded queue drained by a writer task,
//! so [`Connection::send`] never blocks the router. The inbound pump reads
//! frames, decodes envelopes and hands them to the node's dispatch pool.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use starling_crypto::FrameKey;
use starling_transport::{
    BoxedReader, BoxedWriter, FrameReader, FrameWriter, TransportStats, TransportStatsSnapshot,
};

use super::{Connection, Shutdown};
use crate::error::{Error, Result};
use crate::id::ConnectId;
use crate::message::{ConnectorType, ErrorKind, Message};
use crate::node::{Node, NodeConfig};

/// Length-prefixed, optionally sealed envelope channel
pub struct FramedConnection {
    connector: ConnectorType,
    address: String,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: Mutex<Option<FrameReader<BoxedReader>>>,
    shutdown: Shutdown,
    message_duration: Duration,
    chunk_size: usize,
    stats: Arc<TransportStats>,
}

impl FramedConnection {
    /// Wrap a byte channel and start its writer task.
    ///
    /// With `key` set every frame is sealed; both ends must use the same key.
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        key: Option<FrameKey>,
        connector: ConnectorType,
        address: impl Into<String>,
        config: &NodeConfig,
    ) -> Arc<Self> {
        let stats = Arc::new(TransportStats::new());
        let shutdown = Shutdown::new();
        let (outbound, rx) = mpsc::channel(config.outbound_queue_depth.max(1));

        let frame_writer = FrameWriter::new(writer, key.clone()).with_stats(Arc::clone(&stats));
        tokio::spawn(write_loop(frame_writer, rx, shutdown.clone()));

        Arc::new(Self {
            connector,
            address: address.into(),
            outbound,
            reader: Mutex::new(Some(
                FrameReader::new(reader, key).with_stats(Arc::clone(&stats)),
            )),
            shutdown,
            message_duration: config.message_duration,
            chunk_size: config.effective_chunk_size(),
            stats,
        })
    }

    /// Whether the connection has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

async fn write_loop(
    mut writer: FrameWriter<BoxedWriter>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    shutdown: Shutdown,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shutdown.wait() => break,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_frame(&frame).await {
            tracing::debug!("Frame write failed: {}", e);
            shutdown.trigger();
            return;
        }
    }

    // Drain what was queued before the close
    while let Ok(frame) = rx.try_recv() {
        if writer.write_frame(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Runs connection teardown when the pump exits, including by panic.
struct Teardown {
    node: Node,
    id: ConnectId,
    shutdown: Shutdown,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.shutdown.trigger();
        self.node.connection_lost(self.id);
    }
}

#[async_trait]
impl Connection for FramedConnection {
    async fn handle(self: Arc<Self>, node: Node, id: ConnectId) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut reader) = reader else {
            tracing::warn!("Connection {} pump already running", id);
            return;
        };
        let _teardown = Teardown {
            node: node.clone(),
            id,
            shutdown: self.shutdown.clone(),
        };

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.wait() => break,
                frame = reader.read_frame() => frame,
            };
            match frame {
                Ok(Some(bytes)) => match Message::decode(&bytes) {
                    Ok(msg) => node.dispatch_inbound(msg, id).await,
                    Err(e) => {
                        tracing::warn!("Undecodable envelope on {}: {}", id, e);
                        node.report(ErrorKind::DecodeError, format!("{}: {e}", self.address));
                    }
                },
                Ok(None) => {
                    tracing::debug!("Connection {} closed by peer", id);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Connection {} read failed: {}", id, e);
                    break;
                }
            }
        }
    }

    fn send(&self, msg: &Message) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(Error::ConnectionClosed);
        }
        let bytes = msg.encode()?;
        self.outbound.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    fn message_duration(&self) -> Duration {
        self.message_duration
    }

    fn stream_chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn connector_type(&self) -> ConnectorType {
        self.connector
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn stats(&self) -> Option<TransportStatsSnapshot> {
        Some(self.stats.snapshot())
    }

    fn close(&self) {
        self.shutdown.trigger();
    }
}

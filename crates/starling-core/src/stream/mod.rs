//! Multiplexed byte circuits.
//!
//! A circuit is a bidirectional byte channel carried over four message
//! types: create, data, ack and close. Both endpoints hold their own
//! [`StreamMeta`] under the same [`StreamId`]; each binds its own local
//! resource.
//!
//! Flow control is lock-step: an endpoint never has more than one create or
//! data message awaiting acknowledgement. A writer claims the [`AckGate`]
//! before each send and the matching ack releases it, so chunk N+1 is never
//! sent before chunk N is acknowledged.
//!
//! ```text
//!  opener                                 receiver
//!    │ claim ── StreamCreate ───────────────▶ │ register mirror, bind
//!    │ ◀──────────────────────── StreamAck ── │
//!    │ claim ── StreamData(1) ──────────────▶ │ deliver
//!    │ ◀──────────────────────── StreamAck ── │
//!    │ claim ── StreamData(2) ──────────────▶ │ deliver
//!    │             ...                        │
//!    │ ◀─────────────────────── StreamClose ─ │ resource ended
//! ```

pub mod binding;

pub use binding::{LocalDriver, LogSink, PipeBinding, StreamBinding, StreamSink};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::id::{NodeId, StreamId};
use crate::message::{StreamClose, StreamData};
use crate::node::Node;

/// Behaviour requested at the receiving end of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum StreamKind {
    /// Run the context as a process; data is its stdin and output
    Command,
    /// Interactive shell bytes for display
    Shell,
    /// Send the file named by the context
    FileDownload,
    /// Write inbound data to the file named by the context
    FileUpload,
    /// Dial the TCP address in the context and splice it in
    PortForward,
    /// SOCKS5 proxy; recognised on the wire but not served
    Socks5,
    /// A value this build does not know
    Unsupported(u8),
}

impl From<u8> for StreamKind {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Command,
            2 => Self::Shell,
            3 => Self::FileDownload,
            4 => Self::FileUpload,
            5 => Self::PortForward,
            6 => Self::Socks5,
            other => Self::Unsupported(other),
        }
    }
}

impl From<StreamKind> for u8 {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Command => 1,
            StreamKind::Shell => 2,
            StreamKind::FileDownload => 3,
            StreamKind::FileUpload => 4,
            StreamKind::PortForward => 5,
            StreamKind::Socks5 => 6,
            StreamKind::Unsupported(other) => other,
        }
    }
}

/// Single-outstanding-message gate.
///
/// Holds one permit. A send claims it and forgets it; an ack puts it back.
/// Closing the gate fails current and future claims.
#[derive(Debug)]
pub struct AckGate {
    permits: Semaphore,
    outstanding: AtomicBool,
}

impl AckGate {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
            outstanding: AtomicBool::new(false),
        }
    }

    /// Wait for the previous message to be acknowledged, then mark a new
    /// one outstanding.
    async fn claim(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.outstanding.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait until nothing is outstanding, without claiming.
    async fn settled(&self) -> bool {
        self.permits.acquire().await.is_ok()
    }

    /// Acknowledge the outstanding message. Spurious acks are ignored.
    fn release(&self) -> bool {
        if self
            .outstanding
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.permits.add_permits(1);
            true
        } else {
            false
        }
    }

    fn close(&self) {
        self.permits.close();
    }

    /// Whether a message is awaiting acknowledgement.
    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Who initiated a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    /// This endpoint; the peer is sent a close message
    Local,
    /// The peer's close message; nothing is sent back
    Remote,
}

/// Per-endpoint circuit state
pub struct StreamMeta {
    id: StreamId,
    remote: NodeId,
    kind: StreamKind,
    context: String,
    gate: AckGate,
    binding: StreamBinding,
    closed: AtomicBool,
}

impl StreamMeta {
    pub(crate) fn new(
        id: StreamId,
        remote: NodeId,
        kind: StreamKind,
        context: String,
        binding: StreamBinding,
    ) -> Self {
        Self {
            id,
            remote,
            kind,
            context,
            gate: AckGate::new(),
            binding,
            closed: AtomicBool::new(false),
        }
    }

    /// Circuit identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Node at the other end
    #[must_use]
    pub fn remote(&self) -> NodeId {
        self.remote
    }

    /// Circuit type
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Context string from the create message
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Local binding
    #[must_use]
    pub fn binding(&self) -> &StreamBinding {
        &self.binding
    }

    /// Flow-control gate
    #[must_use]
    pub fn gate(&self) -> &AckGate {
        &self.gate
    }

    /// Whether the circuit has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the gate for the next outbound message.
    pub(crate) async fn claim(&self) -> Result<()> {
        if self.is_closed() || !self.gate.claim().await {
            return Err(Error::StreamClosed(self.id));
        }
        Ok(())
    }

    /// Record an inbound ack.
    pub(crate) fn acknowledge(&self) -> bool {
        self.gate.release()
    }

    /// Send `data` as lock-step chunks of at most `chunk_size` bytes.
    pub(crate) async fn write(&self, node: &Node, data: &[u8], chunk_size: usize) -> Result<()> {
        for chunk in data.chunks(chunk_size.max(1)) {
            self.claim().await?;
            node.send_payload(
                self.remote,
                &StreamData {
                    stream: self.id,
                    data: chunk.to_vec(),
                },
            )?;
        }
        Ok(())
    }

    /// Wait until the last outbound message has been acknowledged.
    pub(crate) async fn flush(&self) -> Result<()> {
        if self.is_closed() || !self.gate.settled().await {
            return Err(Error::StreamClosed(self.id));
        }
        Ok(())
    }

    /// Tear the circuit down. Only the first call has any effect.
    ///
    /// Releases the local resource, sends a close to the peer when the close
    /// originates here, then drops the circuit from the node's registries.
    /// Returns `true` for the call that performed the teardown.
    pub(crate) fn close(&self, node: &Node, origin: CloseOrigin) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.gate.close();
        self.binding.release(self);

        if origin == CloseOrigin::Local {
            if let Err(e) = node.send_payload(self.remote, &StreamClose { stream: self.id }) {
                tracing::warn!("Failed to send close for stream {}: {}", self.id, e);
            }
        }

        node.forget_stream(self.id);
        tracing::info!(
            "Stream {} ({:?} {:?}) closed ({:?})",
            self.id,
            self.kind,
            self.context,
            origin
        );
        true
    }
}

impl std::fmt::Debug for StreamMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMeta")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Registry of open circuits on one node
#[derive(Default)]
pub struct ActiveStreams {
    streams: DashMap<StreamId, Arc<StreamMeta>>,
}

impl ActiveStreams {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a circuit. Returns `false` if the id is already taken.
    pub fn insert(&self, meta: Arc<StreamMeta>) -> bool {
        match self.streams.entry(meta.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(meta);
                true
            }
        }
    }

    /// Look up a circuit.
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<Arc<StreamMeta>> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a circuit.
    pub fn remove(&self, id: StreamId) -> Option<Arc<StreamMeta>> {
        self.streams.remove(&id).map(|(_, meta)| meta)
    }

    /// Snapshot of every open circuit.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<StreamMeta>> {
        self.streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of open circuits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no circuit is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// A circuit together with the node that owns it.
///
/// This is the handle local producers (process output pumps, socket readers,
/// callers of [`Node::open_stream`]) use to push bytes into a circuit.
#[derive(Clone)]
pub struct StreamHandle {
    node: Node,
    meta: Arc<StreamMeta>,
}

impl StreamHandle {
    pub(crate) fn new(node: Node, meta: Arc<StreamMeta>) -> Self {
        Self { node, meta }
    }

    /// Circuit identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.meta.id
    }

    /// Circuit state
    #[must_use]
    pub fn meta(&self) -> &Arc<StreamMeta> {
        &self.meta
    }

    /// Owning node
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Chunk size for this circuit's current route.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.node.chunk_size_for(self.meta.remote)
    }

    /// Write bytes, suspending once per chunk until it is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if the circuit closes first.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.meta.write(&self.node, data, self.chunk_size()).await
    }

    /// Wait for the last written chunk to be acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if the circuit closes first.
    pub async fn flush(&self) -> Result<()> {
        self.meta.flush().await
    }

    /// Close the circuit from this end once the last written chunk has been
    /// acknowledged, so the peer never sees the close overtake data.
    ///
    /// Returns `true` for the call that performed the teardown; `false` if
    /// the circuit was already closed, from either end.
    pub async fn close(&self) -> bool {
        if self.meta.is_closed() {
            return false;
        }
        let _ = self.meta.flush().await;
        self.meta.close(&self.node, CloseOrigin::Local)
    }

    /// Close the circuit from this end right away, abandoning any chunk
    /// still awaiting acknowledgement.
    pub fn abort(&self) -> bool {
        self.meta.close(&self.node, CloseOrigin::Local)
    }

    /// Whether the circuit has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.meta.is_closed()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StreamHandle").field(&self.meta).finish()
    }
}

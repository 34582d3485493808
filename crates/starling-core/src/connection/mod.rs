//! Transport contracts.
//!
//! Every transport provides a [`Connection`] for an established channel and
//! a [`Connector`] that dials or accepts such channels. The core never looks
//! past these traits: routing only needs to push envelopes into a connection
//! and learn which connection an envelope arrived on.
//!
//! Implementations shipped here:
//! - [`framed::FramedConnection`]: any byte channel carrying length-prefixed,
//!   optionally sealed envelopes
//! - [`tcp::TcpConnector`]: framed connections over TCP
//! - [`memory::MemoryLink`]: framed connections over in-process pipes
//! - [`shell::ShellConnector`]: raw shell sockets bridged into circuits

pub mod framed;
pub mod memory;
pub mod shell;
pub mod tcp;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use starling_transport::TransportStatsSnapshot;

use crate::error::Result;
use crate::id::ConnectId;
use crate::message::{ConnectorType, Message};
use crate::node::Node;
use crate::{DEFAULT_MESSAGE_DURATION, MAX_STREAM_CHUNK};

/// Pause after a transient accept failure before accepting again.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// An established channel to one peer node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run the inbound pump.
    ///
    /// Decodes successive envelopes and hands each to [`Node::handle`]
    /// tagged with `id` as the arrival connection. When the loop ends for
    /// any reason the connection is unregistered and a connection-lost
    /// report is broadcast, exactly once.
    async fn handle(self: Arc<Self>, node: Node, id: ConnectId);

    /// Queue one envelope for delivery.
    ///
    /// Never blocks. Failure means this connection cannot take the message
    /// now; the caller decides whether to fall back to a flood.
    fn send(&self, msg: &Message) -> Result<()>;

    /// Dedup retention window suited to this transport.
    fn message_duration(&self) -> Duration {
        DEFAULT_MESSAGE_DURATION
    }

    /// Largest stream chunk this transport wants per data message.
    fn stream_chunk_size(&self) -> usize {
        MAX_STREAM_CHUNK
    }

    /// Transport type, for node-info reporting.
    fn connector_type(&self) -> ConnectorType;

    /// Peer address, for node-info reporting.
    fn address(&self) -> String;

    /// Byte and frame counters, if the transport keeps them.
    fn stats(&self) -> Option<TransportStatsSnapshot> {
        None
    }

    /// Stop the pump. Teardown runs from the pump's exit path.
    fn close(&self);
}

/// A bound listener accepting new connections.
pub trait Listener: Send + Sync {
    /// Transport type, for node-info reporting.
    fn connector_type(&self) -> ConnectorType;

    /// Bound address.
    fn address(&self) -> String;

    /// Stop accepting. Cleanup runs from the accept loop's exit path.
    fn close(&self);
}

/// Establishes connections of one transport type.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport type produced by this connector.
    fn connector_type(&self) -> ConnectorType;

    /// Dial once and hand the resulting channel to `node`.
    async fn connect(&self, node: &Node) -> Result<()>;

    /// Bind, register the listener, announce it, then accept until closed.
    async fn listen(&self, node: &Node) -> Result<()>;
}

/// Clonable one-shot stop signal shared by a pump or accept loop and the
/// handle that closes it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Later calls are no-ops.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs listener cleanup when the accept loop exits, however it exits.
///
/// Unregisters the listener, drops its node-info entry and broadcasts a
/// bind-dropped report.
pub struct ListenerGuard {
    node: Node,
    id: ConnectId,
    address: String,
}

impl ListenerGuard {
    /// Register `listener` with `node`, announce it, and arm the guard.
    pub fn register(node: &Node, listener: Arc<dyn Listener>) -> Self {
        let address = listener.address();
        let id = node.register_listener(listener);
        Self {
            node: node.clone(),
            id,
            address,
        }
    }

    /// Registry id of the guarded listener.
    #[must_use]
    pub fn id(&self) -> ConnectId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.node.listener_dropped(self.id, &self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_wait_after_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiter() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

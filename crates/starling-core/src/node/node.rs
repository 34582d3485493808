//! Node implementation - owner of a mesh participant's state.
//!
//! The node ties the registries together: live connections and listeners,
//! learned routes, the dedup tracker, open circuits and the info tables.
//! Routing lives in `router.rs`, the circuit sub-protocol in `streams.rs`.
//!
//! # Example
//!
//! ```no_run
//! use starling_core::message::NodeKind;
//! use starling_core::node::Node;
//! use starling_core::connection::tcp::TcpConnector;
//!
//! #[tokio::main]
//! async fn main() -> starling_core::Result<()> {
//!     let node = Node::new(NodeKind::Agent);
//!     node.connect(&TcpConnector::new("10.0.0.1:4444", None)).await?;
//!     node.wait_shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::config::NodeConfig;
use super::info::{NodeInfo, NodeInfoSnapshot, TrafficStats};
use super::processor::{MessageProcessor, NullProcessor};
use super::routing::{DestinationCache, RoutingStats};
use crate::connection::{Connection, Connector, Listener, Shutdown};
use crate::dedup::{DedupStats, DedupTracker};
use crate::error::{Error, Result};
use crate::id::{ConnectId, NodeId, StreamId};
use crate::message::{
    ErrorKind, ErrorReport, Hello, Message, NewBind, NewConnection, NodeDescriptor, NodeKind,
    Payload, TerminateKind,
};
use crate::registry::ConnectionRegistry;
use crate::stream::{ActiveStreams, CloseOrigin, LogSink, StreamSink};

/// Node inner state
pub(crate) struct NodeInner {
    /// Node identity and role
    pub(crate) descriptor: NodeDescriptor,
    /// Node configuration
    pub(crate) config: NodeConfig,
    /// Live connections and listeners
    pub(crate) registry: ConnectionRegistry,
    /// Learned routes (node -> connection)
    pub(crate) routes: DestinationCache,
    /// Recently seen message ids
    pub(crate) dedup: DedupTracker,
    /// Open circuits
    pub(crate) streams: ActiveStreams,
    /// Operator-facing bookkeeping
    pub(crate) info: NodeInfo,
    /// Handler for non-circuit messages
    pub(crate) processor: Arc<dyn MessageProcessor>,
    /// Receiver for shell circuits ending here
    pub(crate) sink: Arc<dyn StreamSink>,
    /// Bounds concurrent inbound dispatch
    pub(crate) dispatch: Arc<Semaphore>,
    /// Node-wide stop signal
    pub(crate) shutdown: Shutdown,
}

/// A mesh participant.
///
/// Cheap to clone; every clone refers to the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

/// Builder for nodes with a custom identity, configuration or hooks
pub struct NodeBuilder {
    kind: NodeKind,
    id: Option<NodeId>,
    config: NodeConfig,
    processor: Arc<dyn MessageProcessor>,
    sink: Arc<dyn StreamSink>,
}

impl NodeBuilder {
    /// Use a fixed node id instead of a random one.
    #[must_use]
    pub fn id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    /// Replace the default configuration.
    #[must_use]
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the handler for non-circuit messages.
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Install the receiver for shell circuits ending on this node.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Build the node. Starts the dedup sweeper when called inside a
    /// Tokio runtime.
    #[must_use]
    pub fn build(self) -> Node {
        let dispatch = Arc::new(Semaphore::new(self.config.max_inflight_dispatch.max(1)));
        let inner = NodeInner {
            descriptor: NodeDescriptor {
                id: self.id.unwrap_or_else(NodeId::random),
                kind: self.kind,
            },
            config: self.config,
            registry: ConnectionRegistry::new(),
            routes: DestinationCache::new(),
            dedup: DedupTracker::new(),
            streams: ActiveStreams::new(),
            info: NodeInfo::new(),
            processor: self.processor,
            sink: self.sink,
            dispatch,
            shutdown: Shutdown::new(),
        };
        let node = Node {
            inner: Arc::new(inner),
        };
        node.spawn_sweeper();
        tracing::info!("Node {} ({:?}) created", node.id(), node.kind());
        node
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Create a node with a random id, default configuration and no
    /// application processor.
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self::builder(kind).build()
    }

    /// Start building a node.
    #[must_use]
    pub fn builder(kind: NodeKind) -> NodeBuilder {
        NodeBuilder {
            kind,
            id: None,
            config: NodeConfig::default(),
            processor: Arc::new(NullProcessor),
            sink: Arc::new(LogSink),
        }
    }

    fn spawn_sweeper(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime; dedup sweeper not started");
            return;
        };
        let weak: Weak<NodeInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.dedup_sweep_interval.max(Duration::from_millis(10));
        let shutdown = self.inner.shutdown.clone();

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.dedup.prune();
                if removed > 0 {
                    tracing::trace!("Dedup sweep dropped {} ids", removed);
                }
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity and State
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// This node's id
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.inner.descriptor.id
    }

    /// This node's role
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.inner.descriptor.kind
    }

    /// Id and role as announced to peers
    #[must_use]
    pub fn descriptor(&self) -> NodeDescriptor {
        self.inner.descriptor
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Operator-facing bookkeeping
    #[must_use]
    pub fn info(&self) -> &NodeInfo {
        &self.inner.info
    }

    /// Status snapshot with live traffic counters, as sent in hellos and
    /// sync responses.
    #[must_use]
    pub fn status(&self) -> NodeInfoSnapshot {
        self.inner.info.snapshot_with(|id| {
            self.inner
                .registry
                .connection(id)
                .and_then(|conn| conn.stats())
                .map(TrafficStats::from)
        })
    }

    /// Destination cache statistics
    #[must_use]
    pub fn routing_stats(&self) -> RoutingStats {
        self.inner.routes.stats()
    }

    /// Dedup tracker statistics
    #[must_use]
    pub fn dedup_stats(&self) -> DedupStats {
        self.inner.dedup.stats()
    }

    /// Cached route to `node`, if one has been learned
    #[must_use]
    pub fn route_to(&self, node: NodeId) -> Option<ConnectId> {
        self.inner.routes.route(node)
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    /// Number of live listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.registry.listener_count()
    }

    /// Number of open circuits
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    /// Whether [`Node::shutdown`] has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Resolve once the node shuts down.
    pub async fn wait_shutdown(&self) {
        self.inner.shutdown.wait().await;
    }

    /// Node-wide stop signal, for accept loops and pumps.
    #[must_use]
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    /// Dedup retention for messages arriving on `arrival`.
    pub(crate) fn retention_for(&self, arrival: ConnectId) -> Duration {
        self.inner
            .registry
            .connection(arrival)
            .map_or(self.inner.config.message_duration, |conn| {
                conn.message_duration()
            })
    }

    /// Chunk size for circuit data toward `remote`.
    pub(crate) fn chunk_size_for(&self, remote: NodeId) -> usize {
        let configured = self.inner.config.effective_chunk_size();
        self.inner
            .routes
            .route(remote)
            .and_then(|via| self.inner.registry.connection(via))
            .map_or(configured, |conn| {
                conn.stream_chunk_size().clamp(1, configured)
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Messaging
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Build a message from this node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if the payload cannot be serialized.
    pub fn message<P: Payload>(&self, destination: NodeId, payload: &P) -> Result<Message> {
        Message::new(self.id(), destination, payload)
    }

    /// Build and send a message from this node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if the payload cannot be serialized.
    /// Delivery itself is best effort and never fails here.
    pub fn send_payload<P: Payload>(&self, destination: NodeId, payload: &P) -> Result<()> {
        let msg = self.message(destination, payload)?;
        self.send(&msg);
        Ok(())
    }

    /// Broadcast an error report.
    pub fn report(&self, kind: ErrorKind, context: impl Into<String>) {
        self.report_to(NodeId::BROADCAST, kind, context);
    }

    /// Send an error report to one node.
    pub fn report_to(&self, destination: NodeId, kind: ErrorKind, context: impl Into<String>) {
        let report = ErrorReport::new(kind, context);
        tracing::debug!("Reporting {:?}: {}", report.kind, report.context);
        if let Err(e) = self.send_payload(destination, &report) {
            tracing::warn!("Failed to send {:?} report: {}", kind, e);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Connections and Listeners
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Dial through `connector`.
    ///
    /// Transient failures are retried up to `dial_attempts` times with a
    /// doubling delay. The final failure is also broadcast as a generic
    /// error report.
    ///
    /// # Errors
    ///
    /// Returns the connector's last error, or [`Error::Shutdown`] if the
    /// node stops while waiting to retry.
    pub async fn connect(&self, connector: &dyn Connector) -> Result<()> {
        let attempts = self.inner.config.dial_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            match connector.connect(self).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.inner.config.dial_delay(attempt);
                    tracing::debug!(
                        "{:?} connect attempt {} failed, retrying in {:?}: {}",
                        connector.connector_type(),
                        attempt,
                        delay,
                        e
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.inner.shutdown.wait() => break Err(Error::Shutdown),
                    }
                    attempt += 1;
                }
                result => break result,
            }
        };
        result.inspect_err(|e| {
            tracing::warn!("{:?} connect failed: {}", connector.connector_type(), e);
            self.report(ErrorKind::Generic, e.to_string());
        })
    }

    /// Listen through `connector` until the listener closes.
    ///
    /// Failures are also broadcast as generic error reports.
    ///
    /// # Errors
    ///
    /// Returns the connector's error.
    pub async fn listen(&self, connector: &dyn Connector) -> Result<()> {
        connector.listen(self).await.inspect_err(|e| {
            tracing::warn!("{:?} listen failed: {}", connector.connector_type(), e);
            self.report(ErrorKind::Generic, e.to_string());
        })
    }

    /// Take ownership of an established connection.
    ///
    /// Registers it, starts its inbound pump, greets the peer and announces
    /// the connection to the mesh.
    pub fn attach(&self, connection: Arc<dyn Connection>) -> ConnectId {
        let connector = connection.connector_type();
        let address = connection.address();

        let id = self.inner.registry.register_connection(Arc::clone(&connection));
        self.inner.info.add_connection(id, connector, address.clone());
        tokio::spawn(Arc::clone(&connection).handle(self.clone(), id));

        match self.message(
            NodeId::BROADCAST,
            &Hello {
                node: self.descriptor(),
                info: self.status(),
            },
        ) {
            Ok(hello) => {
                self.inner.dedup.observe(hello.id, self.inner.config.message_duration);
                if let Err(e) = connection.send(&hello) {
                    tracing::debug!("Hello on {} failed: {}", id, e);
                }
            }
            Err(e) => tracing::warn!("Failed to build hello: {}", e),
        }

        let notice = NewConnection {
            connector,
            address: address.clone(),
        };
        if let Err(e) = self.send_payload(NodeId::BROADCAST, &notice) {
            tracing::warn!("Failed to announce connection {}: {}", id, e);
        }
        tracing::info!("Connection {} ({:?} {}) attached", id, connector, address);
        id
    }

    /// Pump exit path: drop the connection and everything depending on it.
    ///
    /// Runs at most once per connection; later calls find nothing registered.
    pub fn connection_lost(&self, id: ConnectId) {
        let Some(connection) = self.inner.registry.unregister_connection(id) else {
            return;
        };
        self.inner.info.remove_connection(id);

        let unreachable = self.inner.routes.evict_connection(id);
        for stream in self.inner.streams.all() {
            if unreachable.contains(&stream.remote()) {
                stream.close(self, CloseOrigin::Local);
            }
        }

        let address = connection.address();
        tracing::info!("Connection {} ({}) lost", id, address);
        if !self.is_shut_down() {
            self.report(ErrorKind::ConnectionLost, address);
        }
    }

    pub(crate) fn register_listener(&self, listener: Arc<dyn Listener>) -> ConnectId {
        let connector = listener.connector_type();
        let address = listener.address();
        let id = self.inner.registry.register_listener(listener);
        self.inner.info.add_listener(id, connector, address.clone());

        let notice = NewBind {
            connector,
            address: address.clone(),
        };
        if let Err(e) = self.send_payload(NodeId::BROADCAST, &notice) {
            tracing::warn!("Failed to announce listener {}: {}", id, e);
        }
        tracing::info!("Listener {} ({:?} {}) registered", id, connector, address);
        id
    }

    pub(crate) fn listener_dropped(&self, id: ConnectId, address: &str) {
        if self.inner.registry.unregister_listener(id).is_none() {
            return;
        }
        self.inner.info.remove_listener(id);
        tracing::info!("Listener {} ({}) dropped", id, address);
        if !self.is_shut_down() {
            self.report(ErrorKind::BindDropped, address);
        }
    }

    pub(crate) fn forget_stream(&self, id: StreamId) {
        self.inner.streams.remove(id);
        self.inner.info.remove_stream(id);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Termination
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Close the entry tracked under `index`, or the whole node.
    ///
    /// Terminating the node broadcasts an exit signal first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIndex`] if `index` names no live entry.
    pub fn terminate(&self, kind: TerminateKind, index: u32) -> Result<()> {
        let info = &self.inner.info;
        match kind {
            TerminateKind::Connection => {
                let conn = info
                    .connection_at(index)
                    .and_then(|id| self.inner.registry.connection(id))
                    .ok_or(Error::InvalidIndex(index))?;
                conn.close();
            }
            TerminateKind::Listener => {
                let listener = info
                    .listener_at(index)
                    .and_then(|id| self.inner.registry.listener(id))
                    .ok_or(Error::InvalidIndex(index))?;
                listener.close();
            }
            TerminateKind::Stream => {
                let stream = info
                    .stream_at(index)
                    .and_then(|id| self.inner.streams.get(id))
                    .ok_or(Error::InvalidIndex(index))?;
                stream.close(self, CloseOrigin::Local);
            }
            TerminateKind::Agent => {
                self.report(ErrorKind::AgentExitSignal, self.id().to_string());
                self.shutdown();
            }
        }
        Ok(())
    }

    /// Close every circuit, listener and connection, then stop.
    ///
    /// Circuit closes are sent before the connections go down. Idempotent.
    pub fn shutdown(&self) {
        if self.is_shut_down() {
            return;
        }
        tracing::info!("Node {} shutting down", self.id());

        for stream in self.inner.streams.all() {
            stream.close(self, CloseOrigin::Local);
        }
        self.inner.shutdown.trigger();

        for id in self.inner.registry.listener_ids() {
            if let Some(listener) = self.inner.registry.listener(id) {
                listener.close();
            }
        }
        for id in self.inner.registry.connection_ids() {
            if let Some(conn) = self.inner.registry.connection(id) {
                conn.close();
            }
        }
        self.inner.dispatch.close();
        self.inner.routes.clear();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("connections", &self.connection_count())
            .field("streams", &self.stream_count())
            .finish()
    }
}

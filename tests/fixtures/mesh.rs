//! Mesh fixture for integration testing
//!
//! Builds any number of nodes, each with a [`Recorder`] processor, and wires
//! them together over in-memory links.
//!
//! # Example
//!
//! ```no_run
//! use starling_core::message::NodeKind;
//! use starling_integration_tests::fixtures::MeshFixture;
//!
//! # async fn demo() {
//! let mesh = MeshFixture::line(&[NodeKind::Terminal, NodeKind::Agent, NodeKind::Agent]);
//! mesh.wait_for_routes().await;
//! # }
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use starling_core::connection::memory::MemoryLink;
use starling_core::message::{ErrorKind, ErrorReport, NodeKind};
use starling_core::stream::StreamMeta;
use starling_core::{
    ConnectId, Message, MessageProcessor, MessageType, Node, NodeConfig, NodeId, StreamSink,
};

use crate::test_helpers::eventually;

/// Processor that keeps every message handed to it
#[derive(Default)]
pub struct Recorder {
    messages: Mutex<Vec<Message>>,
}

impl Recorder {
    /// Everything received so far
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages of one kind
    pub fn of_kind(&self, kind: MessageType) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|msg| msg.kind == kind)
            .collect()
    }

    /// Count of messages of one kind
    pub fn count(&self, kind: MessageType) -> usize {
        self.of_kind(kind).len()
    }

    /// Error reports with their sources
    pub fn reports(&self) -> Vec<(NodeId, ErrorReport)> {
        self.of_kind(MessageType::Error)
            .into_iter()
            .filter_map(|msg| msg.payload().ok().map(|report| (msg.source, report)))
            .collect()
    }

    /// Whether a report of `kind` has arrived
    pub fn has_report(&self, kind: ErrorKind) -> bool {
        self.reports().iter().any(|(_, report)| report.kind == kind)
    }
}

#[async_trait]
impl MessageProcessor for Recorder {
    async fn process(&self, _node: &Node, msg: Message) {
        self.messages.lock().unwrap().push(msg);
    }
}

/// Sink collecting circuit bytes
#[derive(Default)]
pub struct CaptureSink {
    bytes: Mutex<Vec<u8>>,
    closed: AtomicUsize,
}

impl CaptureSink {
    /// Bytes received so far
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    /// How many times the circuit reported closing
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl StreamSink for CaptureSink {
    fn deliver(&self, _stream: &StreamMeta, data: &[u8]) {
        self.bytes.lock().unwrap().extend_from_slice(data);
    }

    fn closed(&self, _stream: &StreamMeta) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A set of nodes and the links between them
pub struct MeshFixture {
    pub nodes: Vec<Node>,
    recorders: Vec<Arc<Recorder>>,
    links: Mutex<Vec<(usize, usize)>>,
}

impl MeshFixture {
    /// Unlinked nodes with default configuration
    pub fn new(kinds: &[NodeKind]) -> Self {
        Self::with_config(kinds, NodeConfig::default())
    }

    /// Unlinked nodes sharing `config`
    pub fn with_config(kinds: &[NodeKind], config: NodeConfig) -> Self {
        let (nodes, recorders) = kinds
            .iter()
            .map(|kind| {
                let recorder = Arc::new(Recorder::default());
                let node = Node::builder(*kind)
                    .config(config.clone())
                    .processor(recorder.clone())
                    .build();
                (node, recorder)
            })
            .unzip();
        Self {
            nodes,
            recorders,
            links: Mutex::new(Vec::new()),
        }
    }

    /// Nodes linked in a chain, first to last
    pub fn line(kinds: &[NodeKind]) -> Self {
        let mesh = Self::new(kinds);
        for i in 1..kinds.len() {
            mesh.link(i - 1, i);
        }
        mesh
    }

    /// Nodes linked in a cycle
    pub fn ring(kinds: &[NodeKind]) -> Self {
        let mesh = Self::line(kinds);
        if kinds.len() > 2 {
            mesh.link(kinds.len() - 1, 0);
        }
        mesh
    }

    /// Link node `a` to node `b`; returns the connection ids on each side
    pub fn link(&self, a: usize, b: usize) -> (ConnectId, ConnectId) {
        self.links.lock().unwrap().push((a, b));
        MemoryLink::connect(&self.nodes[a], &self.nodes[b])
    }

    /// Node `i`
    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    /// Recorder of node `i`
    pub fn recorder(&self, i: usize) -> &Recorder {
        &self.recorders[i]
    }

    /// Id of node `i`
    pub fn id(&self, i: usize) -> NodeId {
        self.nodes[i].id()
    }

    /// Wait until every linked pair has learned a route to each other
    pub async fn wait_for_routes(&self) {
        let links = self.links.lock().unwrap().clone();
        let learned = eventually(|| {
            links.iter().all(|&(a, b)| {
                self.nodes[a].route_to(self.id(b)).is_some()
                    && self.nodes[b].route_to(self.id(a)).is_some()
            })
        })
        .await;
        assert!(learned, "links never exchanged hellos");
    }

    /// Wait until node `from` has a route to every other node
    pub async fn wait_for_full_routes(&self, from: usize) {
        let learned = eventually(|| {
            (0..self.nodes.len())
                .filter(|&i| i != from)
                .all(|i| self.nodes[from].route_to(self.id(i)).is_some())
        })
        .await;
        assert!(learned, "node {from} never learned every route");
    }

    /// Node-info index of the connection node `i` holds under `id`
    pub fn connection_index(&self, i: usize, id: ConnectId) -> Option<u32> {
        let node = &self.nodes[i];
        (0..64).find(|&index| node.info().connection_at(index) == Some(id))
    }

    /// Shut every node down
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for MeshFixture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

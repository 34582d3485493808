//! In-process links between nodes.

use async_trait::async_trait;

use starling_transport::memory::{DEFAULT_LINK_CAPACITY, link};

use super::Connector;
use super::framed::FramedConnection;
use crate::error::{Error, Result};
use crate::id::ConnectId;
use crate::message::ConnectorType;
use crate::node::Node;

/// Links two nodes in the same process.
pub struct MemoryLink;

impl MemoryLink {
    /// Connect `a` and `b` with a fresh duplex link.
    ///
    /// Returns the connection ids on `a` and on `b`.
    pub fn connect(a: &Node, b: &Node) -> (ConnectId, ConnectId) {
        let (end_a, end_b) = link(DEFAULT_LINK_CAPACITY);
        let conn_a = FramedConnection::new(
            end_a.reader,
            end_a.writer,
            None,
            ConnectorType::Memory,
            format!("memory:{}", b.id()),
            a.config(),
        );
        let conn_b = FramedConnection::new(
            end_b.reader,
            end_b.writer,
            None,
            ConnectorType::Memory,
            format!("memory:{}", a.id()),
            b.config(),
        );
        (a.attach(conn_a), b.attach(conn_b))
    }
}

/// Connector dialing a fixed in-process peer
pub struct MemoryConnector {
    peer: Node,
}

impl MemoryConnector {
    /// Connector whose `connect` links to `peer`.
    #[must_use]
    pub fn new(peer: Node) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Memory
    }

    async fn connect(&self, node: &Node) -> Result<()> {
        MemoryLink::connect(node, &self.peer);
        Ok(())
    }

    async fn listen(&self, _node: &Node) -> Result<()> {
        Err(Error::UnsupportedConnector(
            "memory links are created by connect".into(),
        ))
    }
}

//! Sealed framed connections over TCP.
//!
//! Both ends derive the same [`FrameKey`] from a shared passphrase; frames
//! that fail to open end the connection.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use starling_crypto::FrameKey;
use starling_transport::{TransportError, tcp};

use super::framed::FramedConnection;
use super::{Connector, Listener, ListenerGuard, Shutdown};
use crate::error::Result;
use crate::id::ConnectId;
use crate::message::ConnectorType;
use crate::node::Node;

/// Mesh connector over TCP
pub struct TcpConnector {
    address: String,
    key: Option<FrameKey>,
}

impl TcpConnector {
    /// Connector for `address` (dial target or bind address).
    ///
    /// Without a key frames travel unsealed.
    pub fn new(address: impl Into<String>, key: Option<FrameKey>) -> Self {
        Self {
            address: address.into(),
            key,
        }
    }

    /// Configured address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial and attach one connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the dial fails.
    pub async fn dial(&self, node: &Node) -> Result<ConnectId> {
        let stream = tcp::dial(&self.address, &node.config().transport).await?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| self.address.clone(), |addr| addr.to_string());
        Ok(self.attach(node, stream, peer))
    }

    fn attach(&self, node: &Node, stream: TcpStream, peer: String) -> ConnectId {
        let (reader, writer) = tcp::split(stream);
        let conn = FramedConnection::new(
            reader,
            writer,
            self.key.clone(),
            ConnectorType::Tcp,
            peer,
            node.config(),
        );
        node.attach(conn)
    }

    /// Bind and register the listener without accepting yet.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for an unparsable address or
    /// [`TransportError::BindFailed`] if the socket cannot be bound.
    pub fn bind(&self, node: &Node) -> Result<TcpBinding> {
        let addr: SocketAddr = self
            .address
            .parse()
            .map_err(|e| TransportError::InvalidConfig(format!("{}: {e}", self.address)))?;
        let listener = tcp::bind(addr, &node.config().transport)?;
        let local = listener.local_addr().map_err(TransportError::from)?;

        let handle = TcpListenerHandle::new(ConnectorType::Tcp, local);
        let guard = ListenerGuard::register(node, handle.clone());
        Ok(TcpBinding {
            connector: Self {
                address: self.address.clone(),
                key: self.key.clone(),
            },
            node: node.clone(),
            listener,
            local,
            handle,
            guard,
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Tcp
    }

    async fn connect(&self, node: &Node) -> Result<()> {
        self.dial(node).await.map(|_| ())
    }

    async fn listen(&self, node: &Node) -> Result<()> {
        self.bind(node)?.serve().await
    }
}

/// Registry entry for a TCP accept loop
pub(super) struct TcpListenerHandle {
    connector: ConnectorType,
    address: String,
    pub(super) shutdown: Shutdown,
}

impl TcpListenerHandle {
    pub(super) fn new(connector: ConnectorType, local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            connector,
            address: local.to_string(),
            shutdown: Shutdown::new(),
        })
    }
}

impl Listener for TcpListenerHandle {
    fn connector_type(&self) -> ConnectorType {
        self.connector
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn close(&self) {
        self.shutdown.trigger();
    }
}

/// A bound, registered TCP listener
pub struct TcpBinding {
    connector: TcpConnector,
    node: Node,
    listener: TcpListener,
    local: SocketAddr,
    handle: Arc<TcpListenerHandle>,
    guard: ListenerGuard,
}

impl TcpBinding {
    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Registry id of the listener
    #[must_use]
    pub fn id(&self) -> ConnectId {
        self.guard.id()
    }

    /// Accept and attach connections until the listener or node closes.
    ///
    /// Transient accept failures are logged and the loop carries on.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient accept failure.
    pub async fn serve(self) -> Result<()> {
        let Self {
            connector,
            node,
            listener,
            local,
            handle,
            guard,
        } = self;
        tracing::info!("Accepting mesh connections on {}", local);

        let result = loop {
            let accepted = tokio::select! {
                _ = handle.shutdown.wait() => break Ok(()),
                _ = node.shutdown_signal().wait() => break Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = tcp::tune(&stream, &node.config().transport) {
                        tracing::debug!("Socket tuning failed for {}: {}", peer, e);
                    }
                    connector.attach(&node, stream, peer.to_string());
                }
                Err(e) => {
                    let err = TransportError::from(e);
                    if !err.is_transient() {
                        break Err(err.into());
                    }
                    tracing::warn!("Accept on {} failed, continuing: {}", local, err);
                    tokio::time::sleep(super::ACCEPT_BACKOFF).await;
                }
            }
        };

        drop(guard);
        result
    }
}

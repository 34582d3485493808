//! Raw shell sockets bridged into shell circuits.
//!
//! A shell socket is a plain TCP connection carrying an interactive shell,
//! not a mesh peer. Each socket becomes one [`StreamKind::Shell`] circuit to
//! the requesting node; the socket's end is reported as a lost shell.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;

use starling_transport::{TransportError, tcp};

use super::tcp::TcpListenerHandle;
use super::{Connector, ListenerGuard};
use crate::error::Result;
use crate::id::NodeId;
use crate::message::{ConnectorType, ErrorKind};
use crate::node::Node;
use crate::stream::{StreamHandle, StreamKind, binding};

const SOCKET_WRITER_DEPTH: usize = 8;

/// Dials or accepts shell sockets on behalf of `requester`
pub struct ShellConnector {
    address: String,
    requester: NodeId,
}

impl ShellConnector {
    /// Connector whose circuits go to `requester`.
    pub fn new(address: impl Into<String>, requester: NodeId) -> Self {
        Self {
            address: address.into(),
            requester,
        }
    }
}

/// Open a shell circuit to `requester` carrying `socket`.
///
/// # Errors
///
/// Fails if the requester closes the circuit before acknowledging it.
pub async fn bridge(node: &Node, socket: TcpStream, requester: NodeId) -> Result<StreamHandle> {
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (binding, driver) = binding::socket(socket, SOCKET_WRITER_DEPTH);
    let handle = node
        .open_stream(requester, StreamKind::Shell, peer.clone(), binding)
        .await?;
    tracing::info!("Shell {} bridged to {} on stream {}", peer, requester, handle.id());
    driver
        .report_on_end(ErrorKind::ShellConnectionLost)
        .start(handle.clone());
    Ok(handle)
}

#[async_trait]
impl Connector for ShellConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::ShellTcp
    }

    async fn connect(&self, node: &Node) -> Result<()> {
        let socket = tcp::dial(&self.address, &node.config().transport).await?;
        bridge(node, socket, self.requester).await.map(|_| ())
    }

    async fn listen(&self, node: &Node) -> Result<()> {
        let addr: SocketAddr = self
            .address
            .parse()
            .map_err(|e| TransportError::InvalidConfig(format!("{}: {e}", self.address)))?;
        let listener = tcp::bind(addr, &node.config().transport)?;
        let local = listener.local_addr().map_err(TransportError::from)?;
        let handle = TcpListenerHandle::new(ConnectorType::ShellTcp, local);
        let _guard = ListenerGuard::register(node, handle.clone());
        tracing::info!("Accepting shells on {} for {}", local, self.requester);

        loop {
            let accepted = tokio::select! {
                _ = handle.shutdown.wait() => return Ok(()),
                _ = node.shutdown_signal().wait() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = match accepted.map_err(TransportError::from) {
                Ok(accepted) => accepted,
                Err(e) if e.is_transient() => {
                    tracing::warn!("Shell accept on {} failed, continuing: {}", local, e);
                    tokio::time::sleep(super::ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let node = node.clone();
            let requester = self.requester;
            tokio::spawn(async move {
                if let Err(e) = bridge(&node, socket, requester).await {
                    tracing::warn!("Shell {} not bridged: {}", peer, e);
                }
            });
        }
    }
}

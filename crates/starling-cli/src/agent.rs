//! Agent role: answers status requests and carries out operator requests.

use async_trait::async_trait;

use starling_core::connection::shell::ShellConnector;
use starling_core::connection::tcp::TcpConnector;
use starling_core::message::{
    BindRequest, ConnectRequest, ConnectorType, ErrorKind, ErrorReport, KillSwitch,
    RemoteCdRequest, RemoteLsRequest, RemoteMkDirRequest, RemotePwdResponse, ShellBindRequest,
    ShellConnectRequest, SyncResponse, TerminateKind, TerminateRequest,
};
use starling_core::{Error, Message, MessageProcessor, MessageType, Node, NodeId, Payload};
use starling_crypto::FrameKey;

use crate::remote::{self, Refusal, WorkingDir};

/// Processor for agent nodes
pub struct AgentProcessor {
    key: Option<FrameKey>,
    cwd: WorkingDir,
}

impl AgentProcessor {
    /// Agent that seals the mesh connections it opens with `key`.
    #[must_use]
    pub fn new(key: Option<FrameKey>) -> Self {
        Self {
            key,
            cwd: WorkingDir::default(),
        }
    }

    fn on_bind(&self, node: &Node, source: NodeId, req: BindRequest) {
        if req.connector != ConnectorType::Tcp {
            node.report_to(
                source,
                ErrorKind::UnsupportedConnectorType,
                format!("{:?} bind", req.connector),
            );
            return;
        }
        let connector = TcpConnector::new(req.address, self.key.clone());
        let node = node.clone();
        tokio::spawn(async move {
            // Failures are already reported by the node
            let _ = node.listen(&connector).await;
        });
    }

    fn on_connect(&self, node: &Node, source: NodeId, req: ConnectRequest) {
        if req.connector != ConnectorType::Tcp {
            node.report_to(
                source,
                ErrorKind::UnsupportedConnectorType,
                format!("{:?} connect", req.connector),
            );
            return;
        }
        let connector = TcpConnector::new(req.address, self.key.clone());
        let node = node.clone();
        tokio::spawn(async move {
            let _ = node.connect(&connector).await;
        });
    }

    fn on_shell(&self, node: &Node, source: NodeId, shell: ShellRequest) {
        if shell.connector != ConnectorType::ShellTcp {
            node.report_to(
                source,
                ErrorKind::UnsupportedConnectorType,
                format!("{:?} shell", shell.connector),
            );
            return;
        }
        let connector = ShellConnector::new(shell.address, shell.requester);
        let node = node.clone();
        tokio::spawn(async move {
            let _ = if shell.listen {
                node.listen(&connector).await
            } else {
                node.connect(&connector).await
            };
        });
    }

    fn on_terminate(&self, node: &Node, source: NodeId, req: TerminateRequest) {
        match node.terminate(req.kind, req.index) {
            Ok(()) => tracing::info!("Terminated {:?} {}", req.kind, req.index),
            Err(Error::InvalidIndex(index)) => node.report_to(
                source,
                ErrorKind::InvalidTerminationIndex,
                format!("{:?} {}", req.kind, index),
            ),
            Err(e) => node.report_to(source, ErrorKind::Generic, e.to_string()),
        }
    }
}

/// Send `outcome` back to `source` as a response or an error report.
fn answer<P: Payload>(node: &Node, source: NodeId, outcome: Result<P, Refusal>) {
    match outcome {
        Ok(response) => {
            if let Err(e) = node.send_payload(source, &response) {
                tracing::warn!("Failed to answer {:?} to {}: {}", P::KIND, source, e);
            }
        }
        Err((kind, context)) => node.report_to(source, kind, context),
    }
}

struct ShellRequest {
    connector: ConnectorType,
    address: String,
    requester: NodeId,
    listen: bool,
}

fn decode<P: Payload>(node: &Node, msg: &Message) -> Option<P> {
    match msg.payload::<P>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!("Bad {:?} from {}: {}", msg.kind, msg.source, e);
            node.report_to(msg.source, ErrorKind::DecodeError, format!("{:?}", msg.kind));
            None
        }
    }
}

#[async_trait]
impl MessageProcessor for AgentProcessor {
    async fn process(&self, node: &Node, msg: Message) {
        let source = msg.source;
        match msg.kind {
            MessageType::SyncRequest => {
                let response = SyncResponse {
                    node: node.descriptor(),
                    info: node.status(),
                };
                if let Err(e) = node.send_payload(source, &response) {
                    tracing::warn!("Failed to answer sync from {}: {}", source, e);
                }
            }
            MessageType::KillSwitch => {
                if let Some(kill) = decode::<KillSwitch>(node, &msg) {
                    tracing::warn!("Kill switch from {}: {}", source, kill.reason);
                    // Agent termination never names an index
                    let _ = node.terminate(TerminateKind::Agent, 0);
                }
            }
            MessageType::BindRequest => {
                if let Some(req) = decode::<BindRequest>(node, &msg) {
                    self.on_bind(node, source, req);
                }
            }
            MessageType::ConnectRequest => {
                if let Some(req) = decode::<ConnectRequest>(node, &msg) {
                    self.on_connect(node, source, req);
                }
            }
            MessageType::ShellBindRequest => {
                if let Some(req) = decode::<ShellBindRequest>(node, &msg) {
                    let shell = ShellRequest {
                        connector: req.connector,
                        address: req.address,
                        requester: req.requester,
                        listen: true,
                    };
                    self.on_shell(node, source, shell);
                }
            }
            MessageType::ShellConnectRequest => {
                if let Some(req) = decode::<ShellConnectRequest>(node, &msg) {
                    let shell = ShellRequest {
                        connector: req.connector,
                        address: req.address,
                        requester: req.requester,
                        listen: false,
                    };
                    self.on_shell(node, source, shell);
                }
            }
            MessageType::TerminateRequest => {
                if let Some(req) = decode::<TerminateRequest>(node, &msg) {
                    self.on_terminate(node, source, req);
                }
            }
            MessageType::RemoteCdRequest => {
                if let Some(req) = decode::<RemoteCdRequest>(node, &msg) {
                    answer(node, source, self.cwd.change(&req.directory));
                }
            }
            MessageType::RemoteLsRequest => {
                if let Some(req) = decode::<RemoteLsRequest>(node, &msg) {
                    answer(node, source, remote::list(&req.directory).await);
                }
            }
            MessageType::RemoteMkDirRequest => {
                if let Some(req) = decode::<RemoteMkDirRequest>(node, &msg) {
                    answer(node, source, self.cwd.make(&req.directory).await);
                }
            }
            MessageType::RemotePwdRequest => {
                let pwd = self
                    .cwd
                    .current()
                    .map(|directory| RemotePwdResponse { directory });
                answer(node, source, pwd);
            }
            MessageType::RemoteTmpDirRequest => {
                answer(node, source, self.cwd.make_temporary());
            }
            MessageType::Error => {
                if let Ok(report) = msg.payload::<ErrorReport>() {
                    tracing::debug!("{} reported {:?}: {}", source, report.kind, report.context);
                }
            }
            other => tracing::trace!("Agent ignoring {:?} from {}", other, source),
        }
    }
}

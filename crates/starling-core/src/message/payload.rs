//! Kind-specific payloads carried in [`Message::data`](super::Message).

use serde::{Deserialize, Serialize};

use super::{MessageType, Payload};
use crate::id::{NodeId, StreamId};
use crate::node::info::NodeInfoSnapshot;
use crate::stream::StreamKind;

/// Role of a node in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Operator-facing node
    Terminal,
    /// Node that executes requests
    Agent,
    /// Pseudo-node standing for a raw shell socket
    Shell,
}

/// Identity of a node as announced to peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node identifier
    pub id: NodeId,
    /// Node role
    pub kind: NodeKind,
}

/// Kind of transport a connection or listener uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorType {
    /// Sealed framed TCP between mesh nodes
    Tcp,
    /// Raw TCP socket carrying an interactive shell
    ShellTcp,
    /// In-process link
    Memory,
}

/// Classification of an error report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unclassified failure, such as a dial or bind error
    Generic,
    /// A mesh connection ended
    ConnectionLost,
    /// A listener stopped
    BindDropped,
    /// An envelope or payload failed to decode
    DecodeError,
    /// A command circuit's process exited
    CommandEnded,
    /// A connector type was requested that this node cannot provide
    UnsupportedConnectorType,
    /// A terminate request named no live entry
    InvalidTerminationIndex,
    /// A shell socket ended
    ShellConnectionLost,
    /// The node is exiting on request
    AgentExitSignal,
    /// A circuit type was requested that this node cannot provide
    UnsupportedStreamType,
    /// A file download finished
    FileDownloadCompleted,
    /// A file upload finished
    FileUploadCompleted,
    /// A file circuit could not open its file
    FileOpenFailed,
    /// A circuit could not bind its local resource
    StreamBindFailed,
    /// A working directory change failed
    DirectoryChangeFailed,
    /// A directory could not be read
    DirectoryListFailed,
    /// A directory could not be created
    DirectoryCreationFailed,
}

/// Error report, normally addressed to broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Classification
    pub kind: ErrorKind,
    /// Human-readable detail
    pub context: String,
}

impl ErrorReport {
    /// Build a report.
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }
}

impl Payload for ErrorReport {
    const KIND: MessageType = MessageType::Error;
}

/// Status request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest;

impl Payload for SyncRequest {
    const KIND: MessageType = MessageType::SyncRequest;
}

/// Status answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Responding node
    pub node: NodeDescriptor,
    /// Its connections, listeners and circuits
    pub info: NodeInfoSnapshot,
}

impl Payload for SyncResponse {
    const KIND: MessageType = MessageType::SyncResponse;
}

/// Request for agents to stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitch {
    /// Operator-supplied reason
    pub reason: String,
}

impl Payload for KillSwitch {
    const KIND: MessageType = MessageType::KillSwitch;
}

/// Request to open a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    /// Transport to listen with
    pub connector: ConnectorType,
    /// Local address to bind
    pub address: String,
}

impl Payload for BindRequest {
    const KIND: MessageType = MessageType::BindRequest;
}

/// Request to dial a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Transport to dial with
    pub connector: ConnectorType,
    /// Remote address
    pub address: String,
}

impl Payload for ConnectRequest {
    const KIND: MessageType = MessageType::ConnectRequest;
}

/// Announcement sent over every fresh connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Announcing node
    pub node: NodeDescriptor,
    /// Its connections, listeners and circuits
    pub info: NodeInfoSnapshot,
}

impl Payload for Hello {
    const KIND: MessageType = MessageType::Hello;
}

/// A listener came up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBind {
    /// Listener transport
    pub connector: ConnectorType,
    /// Bound address
    pub address: String,
}

impl Payload for NewBind {
    const KIND: MessageType = MessageType::NewBind;
}

/// A connection came up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnection {
    /// Connection transport
    pub connector: ConnectorType,
    /// Peer address
    pub address: String,
}

impl Payload for NewConnection {
    const KIND: MessageType = MessageType::NewConnection;
}

/// What a terminate request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminateKind {
    /// A connection by node-info index
    Connection,
    /// A listener by node-info index
    Listener,
    /// A circuit by node-info index
    Stream,
    /// The node itself; the index is ignored
    Agent,
}

/// Request to close one tracked entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest {
    /// Entry category
    pub kind: TerminateKind,
    /// Node-info index within the category
    pub index: u32,
}

impl Payload for TerminateRequest {
    const KIND: MessageType = MessageType::TerminateRequest;
}

/// Open a circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCreate {
    /// Circuit identifier chosen by the opener
    pub stream: StreamId,
    /// Behaviour requested at the receiving end
    pub kind: StreamKind,
    /// Kind-specific context: command line, path or address
    pub context: String,
}

impl Payload for StreamCreate {
    const KIND: MessageType = MessageType::StreamCreate;
}

/// One chunk of circuit data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamData {
    /// Circuit identifier
    pub stream: StreamId,
    /// Chunk bytes
    pub data: Vec<u8>,
}

impl Payload for StreamData {
    const KIND: MessageType = MessageType::StreamData;
}

/// Acknowledge one create or data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAck {
    /// Circuit identifier
    pub stream: StreamId,
}

impl Payload for StreamAck {
    const KIND: MessageType = MessageType::StreamAck;
}

/// Tear a circuit down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClose {
    /// Circuit identifier
    pub stream: StreamId,
}

impl Payload for StreamClose {
    const KIND: MessageType = MessageType::StreamClose;
}

/// Request to listen for raw shell sockets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellBindRequest {
    /// Listener transport, normally [`ConnectorType::ShellTcp`]
    pub connector: ConnectorType,
    /// Local address to bind
    pub address: String,
    /// Node that receives the shell circuits
    pub requester: NodeId,
}

impl Payload for ShellBindRequest {
    const KIND: MessageType = MessageType::ShellBindRequest;
}

/// Request to dial a raw shell socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConnectRequest {
    /// Dial transport, normally [`ConnectorType::ShellTcp`]
    pub connector: ConnectorType,
    /// Remote address
    pub address: String,
    /// Node that receives the shell circuit
    pub requester: NodeId,
}

impl Payload for ShellConnectRequest {
    const KIND: MessageType = MessageType::ShellConnectRequest;
}

/// Change the agent's working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCdRequest {
    /// Target, absolute or relative to the current directory
    pub directory: String,
}

impl Payload for RemoteCdRequest {
    const KIND: MessageType = MessageType::RemoteCdRequest;
}

/// Working directory after a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCdResponse {
    /// New working directory
    pub directory: String,
    /// Working directory before the change
    pub previous: String,
}

impl Payload for RemoteCdResponse {
    const KIND: MessageType = MessageType::RemoteCdResponse;
}

/// List one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLsRequest {
    /// Directory to list; empty for the working directory
    pub directory: String,
}

impl Payload for RemoteLsRequest {
    const KIND: MessageType = MessageType::RemoteLsRequest;
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Size in bytes
    pub size: u64,
    /// Unix permission bits, 0 where unavailable
    pub mode: u32,
    /// Last modification, in seconds since the Unix epoch
    pub modified: Option<u64>,
}

/// Directory listing, sorted by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLsResponse {
    /// Directory that was listed
    pub directory: String,
    /// Its entries
    pub entries: Vec<DirEntry>,
}

impl Payload for RemoteLsResponse {
    const KIND: MessageType = MessageType::RemoteLsResponse;
}

/// Create a directory (and its parents), then move into it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMkDirRequest {
    /// Directory to create
    pub directory: String,
}

impl Payload for RemoteMkDirRequest {
    const KIND: MessageType = MessageType::RemoteMkDirRequest;
}

/// Directory created and entered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMkDirResponse {
    /// New working directory
    pub directory: String,
}

impl Payload for RemoteMkDirResponse {
    const KIND: MessageType = MessageType::RemoteMkDirResponse;
}

/// Ask for the working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePwdRequest;

impl Payload for RemotePwdRequest {
    const KIND: MessageType = MessageType::RemotePwdRequest;
}

/// Current working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePwdResponse {
    /// Working directory
    pub directory: String,
}

impl Payload for RemotePwdResponse {
    const KIND: MessageType = MessageType::RemotePwdResponse;
}

/// Create a fresh temporary directory, then move into it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTmpDirRequest;

impl Payload for RemoteTmpDirRequest {
    const KIND: MessageType = MessageType::RemoteTmpDirRequest;
}

/// Temporary directory created and entered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTmpDirResponse {
    /// New working directory
    pub directory: String,
}

impl Payload for RemoteTmpDirResponse {
    const KIND: MessageType = MessageType::RemoteTmpDirResponse;
}

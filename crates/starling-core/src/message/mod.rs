//! The routed message envelope.
//!
//! A [`Message`] is `{id, source, destination, kind, data}`. `data` holds a
//! bincode-encoded payload whose Rust type is tied to `kind` through the
//! [`Payload`] trait, so construction and decoding cannot disagree about
//! which structure a message carries.

pub mod payload;

pub use payload::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{MessageId, NodeId};

/// Type tag of a message envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Error report for operators
    Error = 1,
    /// Request for node status
    SyncRequest = 2,
    /// Node status answer
    SyncResponse = 3,
    /// Ask agents to stop
    KillSwitch = 4,
    /// Ask a node to open a listener
    BindRequest = 5,
    /// Ask a node to dial a peer
    ConnectRequest = 6,
    /// Announce a node after a connection comes up
    Hello = 7,
    /// A listener was bound
    NewBind = 8,
    /// A connection was established
    NewConnection = 9,
    /// Ask a node to close a connection, listener, circuit or itself
    TerminateRequest = 10,
    /// Open a circuit
    StreamCreate = 11,
    /// One circuit data chunk
    StreamData = 12,
    /// Acknowledge one circuit create or data message
    StreamAck = 13,
    /// Tear a circuit down
    StreamClose = 14,
    /// Ask a node to listen for raw shell sockets
    ShellBindRequest = 15,
    /// Ask a node to dial a raw shell socket
    ShellConnectRequest = 16,
    /// Change an agent's working directory
    RemoteCdRequest = 17,
    /// Working directory after a change
    RemoteCdResponse = 18,
    /// List a directory on an agent
    RemoteLsRequest = 19,
    /// Directory listing
    RemoteLsResponse = 20,
    /// Create a directory on an agent and move into it
    RemoteMkDirRequest = 21,
    /// Directory created
    RemoteMkDirResponse = 22,
    /// Ask for an agent's working directory
    RemotePwdRequest = 23,
    /// Current working directory
    RemotePwdResponse = 24,
    /// Create a fresh temporary directory on an agent and move into it
    RemoteTmpDirRequest = 25,
    /// Temporary directory created
    RemoteTmpDirResponse = 26,
}

impl MessageType {
    /// Whether this type belongs to the circuit sub-protocol.
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::StreamCreate | Self::StreamData | Self::StreamAck | Self::StreamClose
        )
    }
}

/// A structure carried in a message's `data` field.
pub trait Payload: Serialize + DeserializeOwned {
    /// Message type that carries this payload
    const KIND: MessageType;
}

/// The routed envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Dedup identity, fresh for every constructed message
    pub id: MessageId,
    /// Originating node, set once at construction
    pub source: NodeId,
    /// Target node, or [`NodeId::BROADCAST`]
    pub destination: NodeId,
    /// Payload type tag
    pub kind: MessageType,
    /// Encoded payload
    pub data: Vec<u8>,
}

impl Message {
    /// Build a message carrying `payload` with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if the payload cannot be serialized.
    pub fn new<P: Payload>(source: NodeId, destination: NodeId, payload: &P) -> Result<Self> {
        Ok(Self {
            id: MessageId::random(),
            source,
            destination,
            kind: P::KIND,
            data: bincode::serialize(payload).map_err(Error::Encode)?,
        })
    }

    /// Whether the destination is broadcast.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Decode the payload as `P`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadMismatch`] if `P` does not match the message
    /// type, or [`Error::PayloadDecode`] if the bytes are malformed.
    pub fn payload<P: Payload>(&self) -> Result<P> {
        if self.kind != P::KIND {
            return Err(Error::PayloadMismatch {
                expected: P::KIND,
                actual: self.kind,
            });
        }
        bincode::deserialize(&self.data).map_err(|source| Error::PayloadDecode {
            kind: self.kind,
            source,
        })
    }

    /// Serialize the whole envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] on serializer failure.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::Encode)
    }

    /// Parse an envelope from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::Decode)
    }
}

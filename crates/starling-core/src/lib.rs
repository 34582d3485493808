//! # Starling Core
//!
//! Core mesh implementation for Starling.
//!
//! This crate provides:
//! - Fixed-width identifiers with an all-zero broadcast sentinel
//! - The typed message envelope and its payloads
//! - Flood routing with dedup and opportunistic route learning
//! - Registries for connections, listeners and learned routes
//! - Lock-step multiplexed byte circuits bound to local processes,
//!   sockets, files or display sinks
//! - Node info bookkeeping for operator status reports
//!
//! ## Data Flow
//!
//! ```text
//!  transport pump ──decode──▶ Node::handle ──dedup/learn──┬──▶ flood / targeted send
//!                                                         └──▶ local dispatch
//!                                                                ├─ stream messages ─▶ multiplexer
//!                                                                └─ everything else ─▶ MessageProcessor
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod dedup;
pub mod error;
pub mod id;
pub mod message;
pub mod node;
pub mod registry;
pub mod stream;

pub use connection::{Connection, Connector, Listener};
pub use error::{Error, Result};
pub use id::{ConnectId, FileId, MessageId, NodeId, StreamId};
pub use message::{Message, MessageType, Payload};
pub use node::{MessageProcessor, Node, NodeConfig, NodeInfo, StreamDedupPolicy};
pub use stream::{StreamBinding, StreamHandle, StreamKind, StreamSink};

use std::time::Duration;

/// Largest payload carried by one stream data message
pub const MAX_STREAM_CHUNK: usize = 65535;

/// Default dedup retention window for a connection
pub const DEFAULT_MESSAGE_DURATION: Duration = Duration::from_secs(60);

//! Node orchestration layer.
//!
//! A [`Node`] is one mesh participant. It owns every registry the routing
//! engine needs and exposes the operations applications build on:
//! sending, circuit opening, connecting, listening and termination.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Node API                          │
//! │   send · open_stream · connect · listen · terminate      │
//! ├─────────────────────────────────────────────────────────┤
//! │   Router (dedup, learn, flood/forward)  │  Streams       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Connections │ Routes │ Dedup │ Active streams │ Info    │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod info;
#[allow(clippy::module_inception)]
pub mod node;
pub mod processor;
mod router;
pub mod routing;
mod streams;

pub use config::{NodeConfig, StreamDedupPolicy};
pub use info::{ConnectionInfo, NodeInfo, NodeInfoSnapshot, StreamInfo, TrafficStats};
pub use node::{Node, NodeBuilder};
pub use processor::{MessageProcessor, NullProcessor};
pub use routing::{DestinationCache, RoutingStats};

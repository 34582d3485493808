//! Application hook for non-circuit messages.

use async_trait::async_trait;

use super::Node;
use crate::message::Message;

/// Handles every non-circuit message delivered to this node.
///
/// Called from the bounded dispatch pool. Implementations must not wait on
/// circuit acknowledgements inline; spawn a task for that instead, or the
/// pool can starve.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process one message addressed to this node or to broadcast.
    async fn process(&self, node: &Node, msg: Message);
}

/// Processor that only logs what it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProcessor;

#[async_trait]
impl MessageProcessor for NullProcessor {
    async fn process(&self, _node: &Node, msg: Message) {
        tracing::debug!("Unprocessed {:?} from {}", msg.kind, msg.source);
    }
}

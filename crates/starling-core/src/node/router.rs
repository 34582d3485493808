//! Flood routing with dedup and opportunistic route learning.
//!
//! Inbound handling per message:
//!
//! 1. drop it if its id was already seen (circuit messages are exempt
//!    unless [`StreamDedupPolicy::RelayOnly`] is set and they are only
//!    passing through)
//! 2. learn `source -> arrival`
//! 3. broadcast: flood to every other connection and dispatch locally;
//!    addressed here: dispatch locally; otherwise forward
//!
//! Forwarding uses the learned route when it is live, and falls back to one
//! flood when it is not. A failed targeted send evicts its route.

use super::Node;
use super::config::StreamDedupPolicy;
use crate::id::ConnectId;
use crate::message::Message;

impl Node {
    /// Route one inbound message that arrived on `arrival`.
    ///
    /// Use [`ConnectId::NONE`] for messages injected locally.
    pub async fn handle(&self, msg: Message, arrival: ConnectId) {
        if self.deduplicates(&msg) {
            let retention = self.retention_for(arrival);
            if !self.inner.dedup.observe(msg.id, retention) {
                tracing::trace!("Dropping duplicate {:?} {}", msg.kind, msg.id);
                return;
            }
        }

        if !arrival.is_none() && !msg.source.is_broadcast() && msg.source != self.id() {
            self.inner.routes.learn(msg.source, arrival);
        }

        if msg.is_broadcast() {
            self.send_excluding(&msg, arrival);
            self.dispatch_local(msg).await;
        } else if msg.destination == self.id() {
            self.dispatch_local(msg).await;
        } else {
            self.send_excluding(&msg, arrival);
        }
    }

    fn deduplicates(&self, msg: &Message) -> bool {
        if !msg.kind.is_stream() {
            return true;
        }
        match self.inner.config.stream_dedup {
            StreamDedupPolicy::Bypass => false,
            StreamDedupPolicy::RelayOnly => msg.destination != self.id(),
        }
    }

    /// Inbound pump entry: run [`Node::handle`] on the bounded dispatch pool.
    ///
    /// Waits for a free slot, so a saturated pool applies backpressure to the
    /// calling pump. Messages arriving after shutdown are dropped.
    pub async fn dispatch_inbound(&self, msg: Message, arrival: ConnectId) {
        let Ok(permit) = self.inner.dispatch.clone().acquire_owned().await else {
            tracing::trace!("Dispatch pool closed; dropping {:?}", msg.kind);
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            node.handle(msg, arrival).await;
        });
    }

    async fn dispatch_local(&self, msg: Message) {
        if msg.kind.is_stream() {
            self.handle_stream_message(msg).await;
        } else {
            let processor = std::sync::Arc::clone(&self.inner.processor);
            processor.process(self, msg).await;
        }
    }

    /// Send a message originated or relayed by this node.
    ///
    /// Messages originated here have their ids recorded so their own copies
    /// are dropped if the mesh floods them back.
    pub fn send(&self, msg: &Message) {
        if msg.source == self.id() && !msg.kind.is_stream() {
            self.inner
                .dedup
                .observe(msg.id, self.inner.config.message_duration);
        }
        self.send_excluding(msg, ConnectId::NONE);
    }

    /// Deliver toward the destination without using `exclude`.
    ///
    /// Broadcasts flood. Other messages try the cached route once, then
    /// evict it and flood once if it is gone or its send fails.
    pub fn send_excluding(&self, msg: &Message, exclude: ConnectId) {
        if msg.is_broadcast() {
            self.flood(msg, exclude);
            return;
        }

        if let Some(via) = self.inner.routes.route(msg.destination) {
            if via != exclude {
                match self.inner.registry.connection(via) {
                    Some(conn) => match conn.send(msg) {
                        Ok(()) => return,
                        Err(e) => {
                            tracing::debug!("Send to {} via {} failed: {}", msg.destination, via, e);
                        }
                    },
                    None => tracing::debug!("Route {} via {} is gone", msg.destination, via),
                }
                self.inner.routes.evict(msg.destination, via);
            }
        }

        self.flood(msg, exclude);
    }

    fn flood(&self, msg: &Message, exclude: ConnectId) {
        for (id, conn) in self.inner.registry.connections_except(exclude) {
            if let Err(e) = conn.send(msg) {
                tracing::debug!("Flood of {:?} on {} failed: {}", msg.kind, id, e);
            }
        }
    }
}

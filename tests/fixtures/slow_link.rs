//! Links with per-chunk latency and a shared log of circuit traffic.
//!
//! Each direction runs through a forwarder task that holds every chunk it
//! reads for a fixed delay. Both ends record the circuit messages they send
//! into one log, so tests can check the order in which the two sides spoke.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use starling_core::connection::framed::FramedConnection;
use starling_core::message::ConnectorType;
use starling_core::{ConnectId, Connection, Message, MessageType, Node, NodeId, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Circuit messages in the order either end sent them
#[derive(Default)]
pub struct CircuitLog {
    events: Mutex<Vec<(NodeId, MessageType)>>,
}

impl CircuitLog {
    /// Every logged send as (sender, kind)
    pub fn events(&self) -> Vec<(NodeId, MessageType)> {
        self.events.lock().unwrap().clone()
    }

    /// Kinds only, in send order
    pub fn kinds(&self) -> Vec<MessageType> {
        self.events().into_iter().map(|(_, kind)| kind).collect()
    }

    fn push(&self, sender: NodeId, kind: MessageType) {
        self.events.lock().unwrap().push((sender, kind));
    }
}

/// Connection that logs its outbound circuit messages before queueing them
struct Logged {
    inner: Arc<FramedConnection>,
    sender: NodeId,
    log: Arc<CircuitLog>,
}

#[async_trait]
impl Connection for Logged {
    async fn handle(self: Arc<Self>, node: Node, id: ConnectId) {
        Arc::clone(&self.inner).handle(node, id).await;
    }

    fn send(&self, msg: &Message) -> Result<()> {
        if msg.kind.is_stream() {
            self.log.push(self.sender, msg.kind);
        }
        self.inner.send(msg)
    }

    fn message_duration(&self) -> Duration {
        self.inner.message_duration()
    }

    fn stream_chunk_size(&self) -> usize {
        self.inner.stream_chunk_size()
    }

    fn connector_type(&self) -> ConnectorType {
        self.inner.connector_type()
    }

    fn address(&self) -> String {
        self.inner.address()
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// One direction of a link; every chunk read is held for `delay`.
///
/// Returns the end to write into and the end to read from.
fn slow_pipe(delay: Duration) -> (DuplexStream, DuplexStream) {
    let (write_end, mut inlet) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut outlet, read_end) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match inlet.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tokio::time::sleep(delay).await;
                    if outlet.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (write_end, read_end)
}

/// Links two nodes through delayed pipes
pub struct SlowLink;

impl SlowLink {
    /// Connect `a` and `b`, delaying each direction by `delay`.
    ///
    /// Returns the log both ends record their circuit sends into.
    pub fn connect(a: &Node, b: &Node, delay: Duration) -> Arc<CircuitLog> {
        let log = Arc::new(CircuitLog::default());
        let (a_out, b_in) = slow_pipe(delay);
        let (b_out, a_in) = slow_pipe(delay);

        let end = |node: &Node, peer: &Node, reader: DuplexStream, writer: DuplexStream| {
            let inner = FramedConnection::new(
                Box::new(reader),
                Box::new(writer),
                None,
                ConnectorType::Memory,
                format!("slow:{}", peer.id()),
                node.config(),
            );
            node.attach(Arc::new(Logged {
                inner,
                sender: node.id(),
                log: Arc::clone(&log),
            }))
        };
        end(a, b, a_in, a_out);
        end(b, a, b_in, b_out);
        log
    }
}

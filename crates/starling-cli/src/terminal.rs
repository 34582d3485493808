//! Terminal role: renders mesh activity for the operator.
//!
//! Agents are given friendly names (`agent-1`, `agent-2`, ...) in the order
//! their hellos or status answers are first seen.

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use starling_core::message::{
    ErrorReport, Hello, NewBind, NewConnection, NodeDescriptor, NodeKind, RemoteCdResponse,
    RemoteLsResponse, RemoteMkDirResponse, RemotePwdResponse, RemoteTmpDirResponse,
    SyncResponse,
};
use starling_core::stream::StreamMeta;
use starling_core::{Message, MessageProcessor, MessageType, Node, NodeId, StreamSink};

const REPORT_BACKLOG: usize = 64;

/// Processor for terminal nodes
pub struct TerminalProcessor {
    agents: Mutex<Vec<NodeId>>,
    joined: watch::Sender<usize>,
    reports: broadcast::Sender<(NodeId, ErrorReport)>,
    replies: broadcast::Sender<(NodeId, Message)>,
    quiet: bool,
}

impl Default for TerminalProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalProcessor {
    /// Processor that prints everything it sees.
    #[must_use]
    pub fn new() -> Self {
        let (joined, _) = watch::channel(0);
        let (reports, _) = broadcast::channel(REPORT_BACKLOG);
        let (replies, _) = broadcast::channel(REPORT_BACKLOG);
        Self {
            agents: Mutex::new(Vec::new()),
            joined,
            reports,
            replies,
            quiet: false,
        }
    }

    /// Processor that logs instead of printing.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::new()
        }
    }

    /// Friendly name of `id`, if it is a known agent.
    pub fn agent_name(&self, id: NodeId) -> Option<String> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(|agent| *agent == id)
            .map(|index| format!("agent-{}", index + 1))
    }

    /// Every agent seen so far, in naming order.
    pub fn agents(&self) -> Vec<NodeId> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve a friendly name or a node id.
    ///
    /// Friendly names only resolve to agents already seen; ids always parse.
    pub fn resolve(&self, target: &str) -> Option<NodeId> {
        if let Some(number) = target.strip_prefix("agent-") {
            let index = number.parse::<usize>().ok()?.checked_sub(1)?;
            return self
                .agents
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(index)
                .copied();
        }
        target.parse().ok()
    }

    /// Wait until `target` (or any agent, when `None`) is known.
    pub async fn wait_for_agent(&self, target: Option<&str>, timeout: Duration) -> Option<NodeId> {
        let mut joined = self.joined.subscribe();
        let lookup = || match target {
            Some(target) => self.resolve(target),
            None => self.agents().first().copied(),
        };
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(id) = lookup() {
                    return Some(id);
                }
                if joined.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Error reports as they arrive, with their source node.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<(NodeId, ErrorReport)> {
        self.reports.subscribe()
    }

    /// Directory request answers as they arrive, with their source node.
    pub fn subscribe_replies(&self) -> broadcast::Receiver<(NodeId, Message)> {
        self.replies.subscribe()
    }

    /// Friendly name of `id` if it is a known agent, else the id itself.
    pub fn display_name(&self, id: NodeId) -> String {
        self.agent_name(id).unwrap_or_else(|| id.to_string())
    }

    fn remember(&self, node: NodeDescriptor) {
        if node.kind != NodeKind::Agent {
            return;
        }
        let count = {
            let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
            if agents.contains(&node.id) {
                return;
            }
            agents.push(node.id);
            agents.len()
        };
        self.joined.send_replace(count);
        self.print(format!("+ agent-{count} is {}", node.id));
    }

    fn print(&self, line: String) {
        if self.quiet {
            tracing::info!("{line}");
        } else {
            println!("{line}");
        }
    }
}

/// One line describing an error report from `source`.
#[must_use]
pub fn render_report(source: &str, report: &ErrorReport) -> String {
    if report.context.is_empty() {
        format!("! {source}: {:?}", report.kind)
    } else {
        format!("! {source}: {:?} ({})", report.kind, report.context)
    }
}

/// Multi-line summary of a status answer.
#[must_use]
pub fn render_status(name: &str, response: &SyncResponse) -> String {
    use std::fmt::Write as _;

    let info = &response.info;
    let mut out = format!("{name} [{:?} {}]", response.node.kind, response.node.id);
    for conn in &info.connections {
        let _ = write!(
            out,
            "\n  connection {:>3}  {:?} {}",
            conn.index, conn.connector, conn.address
        );
        if let Some(traffic) = conn.traffic {
            let _ = write!(
                out,
                "  (out {} B/{} frames, in {} B/{} frames",
                traffic.bytes_sent,
                traffic.frames_sent,
                traffic.bytes_received,
                traffic.frames_received
            );
            if traffic.errors > 0 {
                let _ = write!(out, ", {} errors", traffic.errors);
            }
            out.push(')');
        }
    }
    for listener in &info.listeners {
        let _ = write!(
            out,
            "\n  listener   {:>3}  {:?} {}",
            listener.index, listener.connector, listener.address
        );
    }
    for stream in &info.streams {
        let _ = write!(
            out,
            "\n  stream     {:>3}  {:?} {} -> {}",
            stream.index, stream.kind, stream.context, stream.remote
        );
    }
    out
}

/// Whether `kind` answers a directory request.
#[must_use]
pub fn is_reply(kind: MessageType) -> bool {
    matches!(
        kind,
        MessageType::RemoteCdResponse
            | MessageType::RemoteLsResponse
            | MessageType::RemoteMkDirResponse
            | MessageType::RemotePwdResponse
            | MessageType::RemoteTmpDirResponse
    )
}

/// Text of a directory request answer, `None` for other or malformed
/// messages.
#[must_use]
pub fn render_reply(source: &str, msg: &Message) -> Option<String> {
    use std::fmt::Write as _;

    let text = match msg.kind {
        MessageType::RemoteCdResponse => {
            let cd: RemoteCdResponse = msg.payload().ok()?;
            format!("{source}: {} -> {}", cd.previous, cd.directory)
        }
        MessageType::RemoteLsResponse => {
            let ls: RemoteLsResponse = msg.payload().ok()?;
            let mut out = format!("{source}: {} ({} entries)", ls.directory, ls.entries.len());
            for entry in &ls.entries {
                let kind = if entry.is_dir { 'd' } else { '-' };
                let _ = write!(
                    out,
                    "\n  {kind} {:04o} {:>12}  {}",
                    entry.mode, entry.size, entry.name
                );
            }
            out
        }
        MessageType::RemoteMkDirResponse => {
            let made: RemoteMkDirResponse = msg.payload().ok()?;
            format!("{source}: created {}", made.directory)
        }
        MessageType::RemotePwdResponse => {
            let pwd: RemotePwdResponse = msg.payload().ok()?;
            format!("{source}: {}", pwd.directory)
        }
        MessageType::RemoteTmpDirResponse => {
            let tmp: RemoteTmpDirResponse = msg.payload().ok()?;
            format!("{source}: created {}", tmp.directory)
        }
        _ => return None,
    };
    Some(text)
}

#[async_trait]
impl MessageProcessor for TerminalProcessor {
    async fn process(&self, _node: &Node, msg: Message) {
        let source = msg.source;
        match msg.kind {
            MessageType::Error => match msg.payload::<ErrorReport>() {
                Ok(report) => {
                    self.print(render_report(&self.display_name(source), &report));
                    // No subscribers is fine
                    let _ = self.reports.send((source, report));
                }
                Err(e) => tracing::warn!("Bad report from {}: {}", source, e),
            },
            MessageType::Hello => {
                if let Ok(hello) = msg.payload::<Hello>() {
                    self.remember(hello.node);
                }
            }
            MessageType::SyncResponse => match msg.payload::<SyncResponse>() {
                Ok(response) => {
                    self.remember(response.node);
                    self.print(render_status(&self.display_name(source), &response));
                }
                Err(e) => tracing::warn!("Bad status from {}: {}", source, e),
            },
            MessageType::NewBind => {
                if let Ok(bind) = msg.payload::<NewBind>() {
                    self.print(format!(
                        "* {} listening on {:?} {}",
                        self.display_name(source),
                        bind.connector,
                        bind.address
                    ));
                }
            }
            MessageType::NewConnection => {
                if let Ok(conn) = msg.payload::<NewConnection>() {
                    self.print(format!(
                        "* {} connected over {:?} {}",
                        self.display_name(source),
                        conn.connector,
                        conn.address
                    ));
                }
            }
            kind if is_reply(kind) => {
                match render_reply(&self.display_name(source), &msg) {
                    Some(text) => self.print(text),
                    None => tracing::warn!("Bad {:?} from {}", kind, source),
                }
                let _ = self.replies.send((source, msg));
            }
            other => tracing::debug!("Terminal ignoring {:?} from {}", other, source),
        }
    }
}

/// Sink writing circuit output to a local writer, stdout by default.
pub struct CommandOutput {
    out: Mutex<Box<dyn Write + Send>>,
    done: watch::Sender<bool>,
}

impl CommandOutput {
    /// Sink writing to `out`.
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            out: Mutex::new(out),
            done,
        }
    }

    /// Sink writing to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Resolves once the circuit has closed.
    pub async fn wait_closed(&self) {
        let mut done = self.done.subscribe();
        // The sender lives in self, so this only fails if the sink is gone
        let _ = done.wait_for(|closed| *closed).await;
    }
}

impl StreamSink for CommandOutput {
    fn deliver(&self, stream: &StreamMeta, data: &[u8]) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = out.write_all(data).and_then(|()| out.flush()) {
            tracing::warn!("Dropping output of stream {}: {}", stream.id(), e);
        }
    }

    fn closed(&self, stream: &StreamMeta) {
        tracing::debug!("Stream {} closed", stream.id());
        self.done.send_replace(true);
    }
}

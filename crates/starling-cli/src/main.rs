//! Starling CLI
//!
//! Runs agents and drives them from a terminal node.

mod agent;
mod config;
mod remote;
mod terminal;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use starling_core::connection::tcp::TcpConnector;
use starling_core::message::{
    ErrorKind, KillSwitch, NodeKind, RemoteCdRequest, RemoteLsRequest, RemoteMkDirRequest,
    RemotePwdRequest, RemoteTmpDirRequest, SyncRequest, TerminateKind, TerminateRequest,
};
use starling_core::{
    FileId, MessageId, MessageType, Node, NodeId, StreamBinding, StreamHandle, StreamId,
    StreamKind,
};
use starling_crypto::hash::{derive_frame_key, fingerprint};

use agent::AgentProcessor;
use config::Config;
use terminal::{CommandOutput, TerminalProcessor};

/// How long a terminal waits for agents to answer
const AGENT_WAIT: Duration = Duration::from_secs(5);

/// Time given to queued closes and reports to drain before exit
const EXIT_GRACE: Duration = Duration::from_millis(250);

/// Stdin chunks read ahead of the circuit
const STDIN_BACKLOG: usize = 4;

/// Starling - mesh agent and operator terminal
#[derive(Parser)]
#[command(name = "starling")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent until killed
    Agent {
        /// Addresses to accept mesh connections on
        #[arg(short, long)]
        listen: Vec<String>,

        /// Peers to dial
        #[arg(short = 'C', long)]
        connect: Vec<String>,
    },

    /// Run a command on an agent and print its output
    Exec {
        /// Agent name (agent-N) or node id; the first agent seen by default
        #[arg(short, long)]
        agent: Option<String>,

        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        /// Command line
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy a local file to an agent
    Upload {
        /// Agent name (agent-N) or node id; the first agent seen by default
        #[arg(short, long)]
        agent: Option<String>,

        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        /// Local file
        #[arg(required = true)]
        file: PathBuf,

        /// Path to create on the agent
        #[arg(required = true)]
        remote: String,
    },

    /// Copy a file from an agent to a new local file
    Download {
        /// Agent name (agent-N) or node id; the first agent seen by default
        #[arg(short, long)]
        agent: Option<String>,

        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        /// Path of the file on the agent
        #[arg(required = true)]
        remote: String,

        /// Local file to create
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Inspect or change an agent's working directory
    Remote {
        /// Agent name (agent-N) or node id; the first agent seen by default
        #[arg(short, long)]
        agent: Option<String>,

        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        #[command(subcommand)]
        op: RemoteOp,
    },

    /// Show every reachable node's connections, listeners and streams
    Status {
        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        /// Seconds to collect answers
        #[arg(short, long, default_value = "3")]
        wait: u64,
    },

    /// Ask an agent to close one of its entries, or itself
    Terminate {
        /// Agent name (agent-N) or node id
        #[arg(short, long, required = true)]
        agent: String,

        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        /// connection, listener, stream or agent
        #[arg(required = true)]
        kind: String,

        /// Index from `status`
        #[arg(default_value = "0")]
        index: u32,
    },

    /// Stop every agent in the mesh
    Kill {
        /// Peer to join the mesh through
        #[arg(short = 'C', long)]
        connect: Vec<String>,

        /// Reason recorded by the agents
        #[arg(short, long, default_value = "operator request")]
        reason: String,
    },

    /// Generate a new shared passphrase
    Keygen {
        /// Output file for the passphrase
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print fresh random identifiers
    Ids {
        /// How many of each
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },
}

#[derive(Subcommand)]
enum RemoteOp {
    /// Change the working directory
    Cd {
        /// Directory, absolute or relative to the current one
        directory: String,
    },
    /// List a directory
    Ls {
        /// Directory; the working directory by default
        directory: Option<String>,
    },
    /// Create a directory with its parents and move into it
    Mkdir {
        /// Directory to create
        directory: String,
    },
    /// Print the working directory
    Pwd,
    /// Create a fresh temporary directory and move into it
    Tmpdir,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Agent { listen, connect } => {
            run_agent(listen, connect, &config).await?;
        }
        Commands::Exec {
            agent,
            connect,
            command,
        } => {
            run_command(agent, connect, command.join(" "), &config).await?;
        }
        Commands::Upload {
            agent,
            connect,
            file,
            remote,
        } => {
            upload_file(agent, connect, file, remote, &config).await?;
        }
        Commands::Download {
            agent,
            connect,
            remote,
            file,
        } => {
            download_file(agent, connect, remote, file, &config).await?;
        }
        Commands::Remote { agent, connect, op } => {
            run_remote(agent, connect, op, &config).await?;
        }
        Commands::Status { connect, wait } => {
            show_status(connect, Duration::from_secs(wait), &config).await?;
        }
        Commands::Terminate {
            agent,
            connect,
            kind,
            index,
        } => {
            terminate(agent, connect, &kind, index, &config).await?;
        }
        Commands::Kill { connect, reason } => {
            kill_all(connect, reason, &config).await?;
        }
        Commands::Keygen { output } => {
            generate_passphrase(output)?;
        }
        Commands::Ids { count } => {
            print_ids(count);
        }
    }

    Ok(())
}

/// Run an agent until it is killed or interrupted
async fn run_agent(
    listen: Vec<String>,
    connect: Vec<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let key = config.frame_key()?;
    let mut builder = Node::builder(NodeKind::Agent)
        .config(config.node_config())
        .processor(Arc::new(AgentProcessor::new(key.clone())));
    if let Some(id) = config.node_id()? {
        builder = builder.id(id);
    }
    let node = builder.build();

    let name = config.node.name.as_deref().unwrap_or("agent");
    tracing::info!("Starting {} as {}", name, node.id());
    if let Some(key) = &key {
        tracing::info!("Frames sealed with key {}", fingerprint(key));
    } else {
        tracing::warn!("No passphrase configured; frames are not sealed");
    }

    let listen = if listen.is_empty() {
        config.network.listen.clone()
    } else {
        listen
    };
    for addr in listen {
        let binding = TcpConnector::new(addr.clone(), key.clone())
            .bind(&node)
            .with_context(|| format!("binding {addr}"))?;
        println!("Listening on {}", binding.local_addr());
        tokio::spawn(async move {
            if let Err(e) = binding.serve().await {
                tracing::error!("Listener {} failed: {}", addr, e);
            }
        });
    }

    for addr in peers(connect, config) {
        // Dial failures are broadcast by the node; keep serving
        let _ = node.connect(&TcpConnector::new(addr, key.clone())).await;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            node.terminate(TerminateKind::Agent, 0)?;
        }
        () = node.wait_shutdown() => {}
    }
    tokio::time::sleep(EXIT_GRACE).await;
    Ok(())
}

/// Run a command on an agent, streaming its output to stdout
async fn run_command(
    agent: Option<String>,
    connect: Vec<String>,
    command: String,
    config: &Config,
) -> anyhow::Result<()> {
    let (node, terminal) = join_mesh(connect, TerminalProcessor::quiet(), config).await?;
    let target = find_agent(&terminal, agent.as_deref()).await?;

    let output = Arc::new(CommandOutput::stdout());
    let handle = node
        .open_stream(
            target,
            StreamKind::Command,
            command,
            StreamBinding::Sink(output.clone()),
        )
        .await?;

    let forward = forward_input(handle.clone(), stdin_chunks(handle.chunk_size()));

    tokio::select! {
        () = output.wait_closed() => {}
        _ = tokio::signal::ctrl_c() => {
            if tokio::time::timeout(AGENT_WAIT, handle.close()).await.is_err() {
                handle.abort();
            }
        }
    }
    forward.abort();
    leave_mesh(&node).await;
    Ok(())
}

/// Write every chunk from `input` into the circuit, in order
fn forward_input(
    handle: StreamHandle,
    mut input: mpsc::Receiver<Vec<u8>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = input.recv().await {
            if let Err(e) = handle.write(&chunk).await {
                tracing::debug!("Stopped forwarding stdin: {}", e);
                return;
            }
        }
    })
}

/// Local stdin in chunks of at most `chunk_size` bytes.
///
/// Reads happen on a plain thread so a read still pending at exit never
/// holds up runtime shutdown.
fn stdin_chunks(chunk_size: usize) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(STDIN_BACKLOG);
    std::thread::spawn(move || {
        use std::io::Read;

        let mut stdin = std::io::stdin().lock();
        let mut buf = vec![0u8; chunk_size];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Copy a local file into a new file on an agent
async fn upload_file(
    agent: Option<String>,
    connect: Vec<String>,
    file: PathBuf,
    remote: String,
    config: &Config,
) -> anyhow::Result<()> {
    let mut source = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;

    let (node, terminal) = join_mesh(connect, TerminalProcessor::quiet(), config).await?;
    let target = find_agent(&terminal, agent.as_deref()).await?;
    let mut reports = terminal.subscribe_reports();

    let handle = node
        .open_stream(
            target,
            StreamKind::FileUpload,
            remote.clone(),
            StreamBinding::Detached,
        )
        .await?;

    let mut buf = vec![0u8; handle.chunk_size()];
    let mut sent = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        handle.write(&buf[..n]).await?;
        sent += n as u64;
    }
    handle.close().await;

    let outcome = tokio::time::timeout(AGENT_WAIT, async {
        loop {
            match reports.recv().await {
                Ok((from, report)) if from == target => match report.kind {
                    ErrorKind::FileUploadCompleted => return Ok(()),
                    ErrorKind::Generic | ErrorKind::FileOpenFailed => {
                        return Err(anyhow::anyhow!("upload failed: {}", report.context));
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(_) => return Err(anyhow::anyhow!("report channel closed")),
            }
        }
    })
    .await
    .unwrap_or_else(|_| Err(anyhow::anyhow!("no completion report from {target}")));

    leave_mesh(&node).await;
    outcome?;
    println!("Uploaded {} bytes to {}", sent, remote);
    Ok(())
}

/// Copy a file on an agent into a new local file
async fn download_file(
    agent: Option<String>,
    connect: Vec<String>,
    remote: String,
    file: PathBuf,
    config: &Config,
) -> anyhow::Result<()> {
    let local = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&file)
        .with_context(|| format!("creating {}", file.display()))?;

    let result = fetch(agent, connect, &remote, local, config).await;
    if result.is_err() {
        // Leave nothing half-written behind
        let _ = std::fs::remove_file(&file);
    }
    result?;

    let received = std::fs::metadata(&file)?.len();
    println!("Downloaded {} bytes from {} to {}", received, remote, file.display());
    Ok(())
}

async fn fetch(
    agent: Option<String>,
    connect: Vec<String>,
    remote: &str,
    local: std::fs::File,
    config: &Config,
) -> anyhow::Result<()> {
    let (node, terminal) = join_mesh(connect, TerminalProcessor::quiet(), config).await?;
    let target = find_agent(&terminal, agent.as_deref()).await?;
    let mut reports = terminal.subscribe_reports();

    let output = Arc::new(CommandOutput::new(Box::new(local)));
    let opened = node
        .open_stream(
            target,
            StreamKind::FileDownload,
            remote,
            StreamBinding::Sink(output.clone()),
        )
        .await;
    if opened.is_ok() {
        output.wait_closed().await;
    }

    // The agent reports before it closes, so the report is already queued
    let outcome = tokio::time::timeout(AGENT_WAIT, async {
        loop {
            match reports.recv().await {
                Ok((from, report)) if from == target => match report.kind {
                    ErrorKind::FileDownloadCompleted => return Ok(()),
                    ErrorKind::Generic | ErrorKind::FileOpenFailed => {
                        return Err(anyhow::anyhow!("download failed: {}", report.context));
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(_) => return Err(anyhow::anyhow!("report channel closed")),
            }
        }
    })
    .await
    .unwrap_or_else(|_| Err(anyhow::anyhow!("no completion report from {target}")));

    leave_mesh(&node).await;
    opened?;
    outcome
}

/// Send one directory request and print the answer
async fn run_remote(
    agent: Option<String>,
    connect: Vec<String>,
    op: RemoteOp,
    config: &Config,
) -> anyhow::Result<()> {
    let (node, terminal) = join_mesh(connect, TerminalProcessor::quiet(), config).await?;
    let target = find_agent(&terminal, agent.as_deref()).await?;
    let mut replies = terminal.subscribe_replies();
    let mut reports = terminal.subscribe_reports();

    let expected = match op {
        RemoteOp::Cd { directory } => {
            node.send_payload(target, &RemoteCdRequest { directory })?;
            MessageType::RemoteCdResponse
        }
        RemoteOp::Ls { directory } => {
            let directory = directory.unwrap_or_default();
            node.send_payload(target, &RemoteLsRequest { directory })?;
            MessageType::RemoteLsResponse
        }
        RemoteOp::Mkdir { directory } => {
            node.send_payload(target, &RemoteMkDirRequest { directory })?;
            MessageType::RemoteMkDirResponse
        }
        RemoteOp::Pwd => {
            node.send_payload(target, &RemotePwdRequest)?;
            MessageType::RemotePwdResponse
        }
        RemoteOp::Tmpdir => {
            node.send_payload(target, &RemoteTmpDirRequest)?;
            MessageType::RemoteTmpDirResponse
        }
    };

    let name = terminal.display_name(target);
    let outcome = tokio::time::timeout(AGENT_WAIT, async {
        loop {
            tokio::select! {
                reply = replies.recv() => match reply {
                    Ok((from, msg)) if from == target && msg.kind == expected => {
                        return terminal::render_reply(&name, &msg)
                            .ok_or_else(|| anyhow::anyhow!("malformed {expected:?} from {name}"));
                    }
                    Ok(_) => {}
                    Err(_) => return Err(anyhow::anyhow!("reply channel closed")),
                },
                report = reports.recv() => match report {
                    Ok((from, report)) if from == target && refuses_request(report.kind) => {
                        return Err(anyhow::anyhow!("{:?}: {}", report.kind, report.context));
                    }
                    Ok(_) => {}
                    Err(_) => return Err(anyhow::anyhow!("report channel closed")),
                },
            }
        }
    })
    .await
    .unwrap_or_else(|_| Err(anyhow::anyhow!("no answer from {name}")));

    leave_mesh(&node).await;
    println!("{}", outcome?);
    Ok(())
}

fn refuses_request(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::DirectoryChangeFailed
            | ErrorKind::DirectoryListFailed
            | ErrorKind::DirectoryCreationFailed
            | ErrorKind::DecodeError
            | ErrorKind::Generic
    )
}

/// Ask every node for its status and print the answers
async fn show_status(connect: Vec<String>, wait: Duration, config: &Config) -> anyhow::Result<()> {
    let (node, _terminal) = join_mesh(connect, TerminalProcessor::new(), config).await?;
    tokio::time::sleep(wait).await;
    leave_mesh(&node).await;
    Ok(())
}

/// Send one terminate request
async fn terminate(
    agent: String,
    connect: Vec<String>,
    kind: &str,
    index: u32,
    config: &Config,
) -> anyhow::Result<()> {
    let kind = match kind {
        "connection" => TerminateKind::Connection,
        "listener" => TerminateKind::Listener,
        "stream" => TerminateKind::Stream,
        "agent" => TerminateKind::Agent,
        other => anyhow::bail!("Unknown terminate kind: {other}"),
    };
    let (node, terminal) = join_mesh(connect, TerminalProcessor::new(), config).await?;
    let target = find_agent(&terminal, Some(&agent)).await?;

    node.send_payload(target, &TerminateRequest { kind, index })?;
    // Give an invalid-index report time to come back
    tokio::time::sleep(Duration::from_secs(1)).await;
    leave_mesh(&node).await;
    Ok(())
}

/// Broadcast a kill switch
async fn kill_all(connect: Vec<String>, reason: String, config: &Config) -> anyhow::Result<()> {
    let (node, _terminal) = join_mesh(connect, TerminalProcessor::new(), config).await?;
    node.send_payload(NodeId::BROADCAST, &KillSwitch { reason })?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    leave_mesh(&node).await;
    Ok(())
}

/// Generate a random passphrase and print its key fingerprint
fn generate_passphrase(output: Option<PathBuf>) -> anyhow::Result<()> {
    let bytes: [u8; 32] = starling_crypto::random::random_array()?;
    let passphrase = zeroize::Zeroizing::new(hex::encode(bytes));
    let key = derive_frame_key(passphrase.as_bytes())?;

    match output {
        Some(path) => {
            write_secret(&path, passphrase.as_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Passphrase written to {}", path.display());
            println!("Set `psk_file = \"{}\"` under [network]", path.display());
        }
        None => println!("{}", passphrase.as_str()),
    }
    println!("Key fingerprint: {}", fingerprint(&key));
    Ok(())
}

#[cfg(unix)]
fn write_secret(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_secret(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)
}

fn print_ids(count: usize) {
    for _ in 0..count {
        println!("node    {}", NodeId::random());
        println!("stream  {}", StreamId::random());
        println!("file    {}", FileId::random());
        println!("message {}", MessageId::random());
    }
}

fn peers(connect: Vec<String>, config: &Config) -> Vec<String> {
    if connect.is_empty() {
        config.network.connect.clone()
    } else {
        connect
    }
}

/// Start a terminal node, dial the configured peers and ask for status
async fn join_mesh(
    connect: Vec<String>,
    processor: TerminalProcessor,
    config: &Config,
) -> anyhow::Result<(Node, Arc<TerminalProcessor>)> {
    let peers = peers(connect, config);
    if peers.is_empty() {
        anyhow::bail!("No peer to connect to; pass --connect or set [network] connect");
    }

    let key = config.frame_key()?;
    let terminal = Arc::new(processor);
    let mut builder = Node::builder(NodeKind::Terminal)
        .config(config.node_config())
        .processor(terminal.clone());
    if let Some(id) = config.node_id()? {
        builder = builder.id(id);
    }
    let node = builder.build();

    let mut joined = 0;
    for addr in peers {
        match node.connect(&TcpConnector::new(addr.clone(), key.clone())).await {
            Ok(()) => joined += 1,
            Err(e) => tracing::warn!("Cannot reach {}: {}", addr, e),
        }
    }
    if joined == 0 {
        anyhow::bail!("Could not reach any peer");
    }

    node.send_payload(NodeId::BROADCAST, &SyncRequest)?;
    Ok((node, terminal))
}

async fn find_agent(terminal: &TerminalProcessor, target: Option<&str>) -> anyhow::Result<NodeId> {
    terminal
        .wait_for_agent(target, AGENT_WAIT)
        .await
        .ok_or_else(|| match target {
            Some(target) => anyhow::anyhow!("Agent {target} not found"),
            None => anyhow::anyhow!("No agent answered"),
        })
}

async fn leave_mesh(node: &Node) {
    node.shutdown();
    tokio::time::sleep(EXIT_GRACE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use starling_core::connection::memory::MemoryLink;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forwarded_input_reaches_the_command() {
        let terminal = Node::builder(NodeKind::Terminal).build();
        let agent = Node::builder(NodeKind::Agent)
            .processor(Arc::new(AgentProcessor::new(None)))
            .build();
        MemoryLink::connect(&terminal, &agent);
        tokio::time::timeout(Duration::from_secs(2), async {
            while terminal.route_to(agent.id()).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let printed = Shared::default();
        let output = Arc::new(CommandOutput::new(Box::new(printed.clone())));
        let handle = terminal
            .open_stream(
                agent.id(),
                StreamKind::Command,
                "cat".to_string(),
                StreamBinding::Sink(output.clone()),
            )
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(STDIN_BACKLOG);
        let forward = forward_input(handle.clone(), rx);
        tx.send(b"hello\n".to_vec()).await.unwrap();
        tx.send(b"world\n".to_vec()).await.unwrap();
        drop(tx);
        forward.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while printed.0.lock().unwrap().as_slice() != b"hello\nworld\n" {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.close().await;
        tokio::time::timeout(Duration::from_secs(2), output.wait_closed())
            .await
            .unwrap();
        terminal.shutdown();
        agent.shutdown();
    }
}

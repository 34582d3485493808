//! Local resources bound to circuit endpoints.
//!
//! Each endpoint holds a [`StreamBinding`] receiving the circuit's inbound
//! bytes, and optionally a [`LocalDriver`] pushing the resource's own output
//! back into the circuit. Releasing a binding never blocks: it drops the
//! writer queue and fires the driver's stop signal, and the background tasks
//! wind down on their own.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::{StreamHandle, StreamMeta};
use crate::connection::Shutdown;
use crate::error::{Error, Result};
use crate::message::ErrorKind;
use crate::node::Node;

/// Receiver for circuit bytes that end on this node, such as a shell display.
pub trait StreamSink: Send + Sync {
    /// One inbound chunk.
    fn deliver(&self, stream: &StreamMeta, data: &[u8]);

    /// The circuit closed.
    fn closed(&self, _stream: &StreamMeta) {}
}

/// Sink that writes circuit bytes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StreamSink for LogSink {
    fn deliver(&self, stream: &StreamMeta, data: &[u8]) {
        tracing::info!("[{}] {}", stream.id(), String::from_utf8_lossy(data));
    }
}

/// Bounded queue into a background writer plus the stop signal of the
/// resource's driver.
pub struct PipeBinding {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    stop: Shutdown,
}

impl PipeBinding {
    fn new(tx: Option<mpsc::Sender<Vec<u8>>>, stop: Shutdown) -> Self {
        Self {
            tx: Mutex::new(tx),
            stop,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue bytes for the writer. Resolves once the queue has room.
    async fn push(&self, data: &[u8]) -> Result<()> {
        match self.sender() {
            Some(tx) => tx
                .send(data.to_vec())
                .await
                .map_err(|_| Error::StreamBind("local writer stopped".into())),
            None => Ok(()),
        }
    }

    fn release(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.stop.trigger();
    }

    /// Stop signal shared with the resource's driver.
    #[must_use]
    pub fn stop_signal(&self) -> &Shutdown {
        &self.stop
    }
}

/// What an endpoint does with the bytes it receives and with its own close.
pub enum StreamBinding {
    /// Child process: inbound bytes feed stdin, close kills it
    Process(PipeBinding),
    /// TCP socket: inbound bytes are written to it, close shuts it down
    Socket(PipeBinding),
    /// Local file: upload target, or download source ignoring inbound bytes
    File(PipeBinding),
    /// Caller-supplied sink
    Sink(Arc<dyn StreamSink>),
    /// No local resource
    Detached,
}

impl StreamBinding {
    /// Hand one inbound chunk to the local resource.
    ///
    /// # Errors
    ///
    /// Fails when a socket or file writer has stopped; the circuit should
    /// then be closed. Process stdin failures are only logged since the
    /// process may still be producing output.
    pub async fn deliver(&self, stream: &StreamMeta, data: &[u8]) -> Result<()> {
        match self {
            Self::Process(pipe) => {
                if let Err(e) = pipe.push(data).await {
                    tracing::debug!("Dropping stdin for stream {}: {}", stream.id(), e);
                }
                Ok(())
            }
            Self::Socket(pipe) | Self::File(pipe) => pipe.push(data).await,
            Self::Sink(sink) => {
                sink.deliver(stream, data);
                Ok(())
            }
            Self::Detached => Ok(()),
        }
    }

    pub(crate) fn release(&self, stream: &StreamMeta) {
        match self {
            Self::Process(pipe) | Self::Socket(pipe) | Self::File(pipe) => pipe.release(),
            Self::Sink(sink) => sink.closed(stream),
            Self::Detached => {}
        }
    }
}

impl std::fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Process(_) => "Process",
            Self::Socket(_) => "Socket",
            Self::File(_) => "File",
            Self::Sink(_) => "Sink",
            Self::Detached => "Detached",
        };
        f.write_str(name)
    }
}

enum DriverKind {
    Command {
        child: Child,
        command: String,
    },
    Socket {
        reader: tokio::net::tcp::OwnedReadHalf,
        report: Option<ErrorKind>,
        address: String,
    },
    Download {
        file: tokio::fs::File,
        path: String,
    },
}

/// Background task feeding a local resource's output into its circuit.
pub struct LocalDriver {
    kind: DriverKind,
    stop: Shutdown,
}

impl LocalDriver {
    /// Report `kind` by broadcast when the socket reaches end of stream.
    #[must_use]
    pub fn report_on_end(mut self, kind: ErrorKind) -> Self {
        if let DriverKind::Socket { report, .. } = &mut self.kind {
            *report = Some(kind);
        }
        self
    }

    /// Spawn the driver for the registered circuit behind `handle`.
    pub fn start(self, handle: StreamHandle) {
        let stop = self.stop;
        match self.kind {
            DriverKind::Command { child, command } => {
                tokio::spawn(drive_command(child, command, handle, stop));
            }
            DriverKind::Socket {
                reader,
                report,
                address,
            } => {
                tokio::spawn(async move {
                    let end = pump(reader, &handle, &stop).await;
                    finish(&handle, end, report.map(|kind| (kind, address))).await;
                });
            }
            DriverKind::Download { file, path } => {
                tokio::spawn(async move {
                    let end = pump(file, &handle, &stop).await;
                    finish(&handle, end, Some((ErrorKind::FileDownloadCompleted, path))).await;
                });
            }
        }
    }
}

fn spawn_writer<W, F>(mut writer: W, depth: usize, done: F) -> mpsc::Sender<Vec<u8>>
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(std::io::Result<()>) + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(depth.max(1));
    tokio::spawn(async move {
        let mut result = Ok(());
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = writer.flush().await;
        }
        let _ = writer.shutdown().await;
        done(result);
    });
    tx
}

/// Spawn the whitespace-split `command_line` with the inherited environment.
///
/// # Errors
///
/// Returns [`Error::StreamBind`] for an empty line or a spawn failure.
pub fn command(command_line: &str, depth: usize) -> Result<(StreamBinding, LocalDriver)> {
    let mut argv = command_line.split_whitespace();
    let program = argv
        .next()
        .ok_or_else(|| Error::StreamBind("empty command line".into()))?;

    let mut child = Command::new(program)
        .args(argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::StreamBind(format!("{program}: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::StreamBind("child stdin unavailable".into()))?;
    let tx = spawn_writer(stdin, depth, |_| {});

    let stop = Shutdown::new();
    Ok((
        StreamBinding::Process(PipeBinding::new(Some(tx), stop.clone())),
        LocalDriver {
            kind: DriverKind::Command {
                child,
                command: command_line.to_string(),
            },
            stop,
        },
    ))
}

/// Bind an established TCP socket.
#[must_use]
pub fn socket(stream: TcpStream, depth: usize) -> (StreamBinding, LocalDriver) {
    let address = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (reader, writer) = stream.into_split();
    let tx = spawn_writer(writer, depth, |_| {});
    let stop = Shutdown::new();
    (
        StreamBinding::Socket(PipeBinding::new(Some(tx), stop.clone())),
        LocalDriver {
            kind: DriverKind::Socket {
                reader,
                report: None,
                address,
            },
            stop,
        },
    )
}

/// Open `path` for reading as a download source.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be opened.
pub async fn download_source(path: &str) -> Result<(StreamBinding, LocalDriver)> {
    let file = tokio::fs::File::open(path).await?;
    let stop = Shutdown::new();
    Ok((
        StreamBinding::File(PipeBinding::new(None, stop.clone())),
        LocalDriver {
            kind: DriverKind::Download {
                file,
                path: display_path(path),
            },
            stop,
        },
    ))
}

/// Create `path` as an upload target. An existing file is never replaced.
///
/// Completion is reported by broadcast once the last queued byte has been
/// written after the circuit closes.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file exists or cannot be created.
pub async fn upload_target(node: &Node, path: &str, depth: usize) -> Result<StreamBinding> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let node = node.clone();
    let shown = display_path(path);
    let tx = spawn_writer(file, depth, move |result| match result {
        Ok(()) => node.report(ErrorKind::FileUploadCompleted, shown),
        Err(e) => node.report(ErrorKind::Generic, format!("{shown}: {e}")),
    });
    Ok(StreamBinding::File(PipeBinding::new(Some(tx), Shutdown::new())))
}

fn display_path(path: &str) -> String {
    std::path::absolute(Path::new(path))
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.to_string())
}

enum PumpEnd {
    Eof,
    Stopped,
    Failed,
}

async fn pump<R>(mut reader: R, handle: &StreamHandle, stop: &Shutdown) -> PumpEnd
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; handle.chunk_size()];
    loop {
        let read = tokio::select! {
            _ = stop.wait() => return PumpEnd::Stopped,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => {
                if handle.write(&buf[..n]).await.is_err() {
                    return PumpEnd::Stopped;
                }
            }
            Err(e) => {
                tracing::debug!("Read failed on stream {}: {}", handle.id(), e);
                return PumpEnd::Failed;
            }
        }
    }
}

async fn finish(handle: &StreamHandle, end: PumpEnd, report: Option<(ErrorKind, String)>) {
    match end {
        PumpEnd::Stopped => return,
        PumpEnd::Eof => {
            // Last chunk must be acknowledged before the close goes out
            let _ = handle.flush().await;
            if let Some((kind, context)) = report {
                handle.node().report(kind, context);
            }
        }
        PumpEnd::Failed => {
            handle.abort();
            return;
        }
    }
    handle.close().await;
}

async fn drive_command(mut child: Child, command: String, handle: StreamHandle, stop: Shutdown) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out = stdout.map(|r| {
        let handle = handle.clone();
        let stop = stop.clone();
        tokio::spawn(async move { pump(r, &handle, &stop).await })
    });
    let err = stderr.map(|r| {
        let handle = handle.clone();
        let stop = stop.clone();
        tokio::spawn(async move { pump(r, &handle, &stop).await })
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop.wait() => {
            let _ = child.kill().await;
            child.wait().await
        }
    };

    for task in [out, err].into_iter().flatten() {
        let _ = task.await;
    }

    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    };
    tracing::info!("Command {:?} on stream {} ended: {}", command, handle.id(), status);

    let _ = handle.flush().await;
    handle
        .node()
        .report(ErrorKind::CommandEnded, format!("{command} ({status})"));
    handle.close().await;
}
